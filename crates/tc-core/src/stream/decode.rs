//! Decoder for the fixed-layout mutation record.
//!
//! Layout (little-endian, 44 bytes):
//!
//! | offset | field      | type     |
//! |-------:|------------|----------|
//! | 0      | table_id   | u32      |
//! | 4      | table_name | [u8; 16] |
//! | 20     | kind       | i32      |
//! | 24     | owner_pid  | u32      |
//! | 28     | key_size   | u32      |
//! | 32     | value_size | u32      |
//! | 36     | key        | [u8; 4]  |
//! | 40     | value      | [u8; 4]  |
//!
//! Trailing bytes past the layout are ignored; ring-buffer samples are
//! rounded up to 8-byte multiples.

use serde::Serialize;
use tc_common::{TableId, TableName, TABLE_NAME_LEN};
use thiserror::Error;

use crate::keys::CAPTURED_KEY_BYTES;

/// Size of one encoded record.
pub const RECORD_LEN: usize = 44;

const OFF_TABLE_ID: usize = 0;
const OFF_NAME: usize = 4;
const OFF_KIND: usize = OFF_NAME + TABLE_NAME_LEN;
const OFF_PID: usize = 24;
const OFF_KEY_SIZE: usize = 28;
const OFF_VALUE_SIZE: usize = 32;
const OFF_KEY: usize = 36;
const OFF_VALUE: usize = 40;

/// Kind of table mutation. Wire values are fixed by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// Insert or update-in-place.
    Insert,
    Remove,
}

impl MutationKind {
    pub fn from_wire(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(MutationKind::Insert),
            1 => Some(MutationKind::Remove),
            _ => None,
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            MutationKind::Insert => 0,
            MutationKind::Remove => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Insert => "insert",
            MutationKind::Remove => "remove",
        }
    }
}

/// One successful table mutation observed by the hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationEvent {
    pub table_id: TableId,
    pub table_name: TableName,
    pub kind: MutationKind,
    pub owner_pid: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub key_bytes: [u8; CAPTURED_KEY_BYTES],
    pub value_bytes: [u8; 4],
}

impl MutationEvent {
    /// Captured key as a little-endian integer, for log output.
    pub fn key_u32(&self) -> u32 {
        u32::from_le_bytes(self.key_bytes)
    }

    pub fn value_u32(&self) -> u32 {
        u32::from_le_bytes(self.value_bytes)
    }

    /// Encode back into the wire layout.
    pub fn to_record(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[OFF_TABLE_ID..OFF_TABLE_ID + 4].copy_from_slice(&self.table_id.0.to_le_bytes());
        let name = self.table_name.as_str().as_bytes();
        // Keep room for the terminating NUL like the kernel does.
        let n = name.len().min(TABLE_NAME_LEN - 1);
        buf[OFF_NAME..OFF_NAME + n].copy_from_slice(&name[..n]);
        buf[OFF_KIND..OFF_KIND + 4].copy_from_slice(&self.kind.to_wire().to_le_bytes());
        buf[OFF_PID..OFF_PID + 4].copy_from_slice(&self.owner_pid.to_le_bytes());
        buf[OFF_KEY_SIZE..OFF_KEY_SIZE + 4].copy_from_slice(&self.key_size.to_le_bytes());
        buf[OFF_VALUE_SIZE..OFF_VALUE_SIZE + 4].copy_from_slice(&self.value_size.to_le_bytes());
        buf[OFF_KEY..OFF_KEY + 4].copy_from_slice(&self.key_bytes);
        buf[OFF_VALUE..OFF_VALUE + 4].copy_from_slice(&self.value_bytes);
        buf
    }
}

/// Record decoding failures. Both indicate a producer/controller mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record is {actual} bytes, expected at least {expected}")]
    Truncated { actual: usize, expected: usize },

    #[error("unknown mutation kind {0}")]
    UnknownKind(i32),
}

impl From<DecodeError> for tc_common::Error {
    fn from(err: DecodeError) -> Self {
        tc_common::Error::MalformedRecord(err.to_string())
    }
}

fn field<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}

/// Decode one record.
///
/// The length is checked once up front; every field read after that is
/// within bounds.
pub fn decode_record(buf: &[u8]) -> Result<MutationEvent, DecodeError> {
    if buf.len() < RECORD_LEN {
        return Err(DecodeError::Truncated {
            actual: buf.len(),
            expected: RECORD_LEN,
        });
    }

    let raw_kind = i32::from_le_bytes(field(buf, OFF_KIND));
    let kind = MutationKind::from_wire(raw_kind).ok_or(DecodeError::UnknownKind(raw_kind))?;

    Ok(MutationEvent {
        table_id: TableId(u32::from_le_bytes(field(buf, OFF_TABLE_ID))),
        table_name: TableName::from_padded(&buf[OFF_NAME..OFF_NAME + TABLE_NAME_LEN]),
        kind,
        owner_pid: u32::from_le_bytes(field(buf, OFF_PID)),
        key_size: u32::from_le_bytes(field(buf, OFF_KEY_SIZE)),
        value_size: u32::from_le_bytes(field(buf, OFF_VALUE_SIZE)),
        key_bytes: field(buf, OFF_KEY),
        value_bytes: field(buf, OFF_VALUE),
    })
}

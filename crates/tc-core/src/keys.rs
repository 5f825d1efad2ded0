//! Canonical key encoding shared by the snapshot and the event stream.
//!
//! The snapshot reads raw key bytes straight out of the table while the
//! mutation hook only captures the first [`CAPTURED_KEY_BYTES`] of each key.
//! A [`KeyCodec`] is chosen once per table from its declared key size and
//! applied to both sources, so a key observed by either path maps to the
//! same [`KeyRecord`].

use serde::{Serialize, Serializer};
use std::fmt;

/// Number of key bytes carried in a mutation record.
pub const CAPTURED_KEY_BYTES: usize = 4;

/// Canonical key bytes. Compared by exact byte equality only.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyRecord(Box<[u8]>);

impl KeyRecord {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyRecord({})", self)
    }
}

impl fmt::Display for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl Serialize for KeyRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Key encoding selected by a table's key size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "codec")]
pub enum KeyCodec {
    /// Keys of 1..=4 bytes, kept whole in on-table byte order.
    Fixed { width: u8 },
    /// Keys wider than the captured prefix (or of unknown size). Both sources
    /// are reduced to the first [`CAPTURED_KEY_BYTES`], so distinct keys
    /// sharing a prefix collapse into one member.
    Prefix,
}

impl KeyCodec {
    pub fn for_key_size(key_size: u32) -> Self {
        match key_size {
            // Range checked: fits in u8.
            1..=4 => KeyCodec::Fixed {
                width: key_size as u8,
            },
            _ => KeyCodec::Prefix,
        }
    }

    /// Number of canonical bytes this codec produces.
    pub fn width(&self) -> usize {
        match self {
            KeyCodec::Fixed { width } => usize::from(*width),
            KeyCodec::Prefix => CAPTURED_KEY_BYTES,
        }
    }

    /// Whether distinct table keys can map to the same record.
    pub fn is_lossy(&self) -> bool {
        matches!(self, KeyCodec::Prefix)
    }

    /// Normalize key bytes from either source.
    ///
    /// Input longer than the codec width is truncated; shorter input is
    /// zero-padded, matching how the hook reads a short key into a
    /// zero-initialized field.
    pub fn normalize(&self, raw: &[u8]) -> KeyRecord {
        let width = self.width();
        let mut out = vec![0u8; width];
        let n = raw.len().min(width);
        out[..n].copy_from_slice(&raw[..n]);
        KeyRecord(out.into_boxed_slice())
    }
}

//! Kernel table identity types.
//!
//! A kernel table is identified by its numeric id, which the kernel hands
//! out and may reuse once the table is destroyed. Names are fixed-width and
//! frequently truncated, so they are never treated as unique.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of the kernel's fixed table-name buffer, including the NUL.
pub const TABLE_NAME_LEN: usize = 16;

/// Kernel-assigned numeric table id.
///
/// Valid only for the lifetime of one table instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(pub u32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TableId {
    fn from(id: u32) -> Self {
        TableId(id)
    }
}

/// Table name as reported by the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableName(String);

impl TableName {
    /// Build a name from a NUL-padded kernel buffer.
    ///
    /// Stops at the first NUL, decodes lossily and trims trailing whitespace
    /// (the enumeration program left-justifies names into a padded column).
    pub fn from_padded(raw: &[u8]) -> Self {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let decoded = String::from_utf8_lossy(&raw[..end]);
        TableName(decoded.trim_end().to_string())
    }

    pub fn new(name: impl Into<String>) -> Self {
        TableName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TableName {
    fn from(name: &str) -> Self {
        TableName(name.to_string())
    }
}

/// Kernel table type.
///
/// Only the kinds whose mutation entry points are instrumented get names;
/// everything else keeps its raw kernel type number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Hash,
    Array,
    LruHash,
    Other(u32),
}

impl TableKind {
    /// Map a kernel `BPF_MAP_TYPE_*` value.
    pub fn from_kernel_type(map_type: u32) -> Self {
        match map_type {
            1 => TableKind::Hash,
            2 => TableKind::Array,
            9 => TableKind::LruHash,
            other => TableKind::Other(other),
        }
    }
}

impl Default for TableKind {
    fn default() -> Self {
        TableKind::Other(0)
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::Hash => write!(f, "hash"),
            TableKind::Array => write!(f, "array"),
            TableKind::LruHash => write!(f, "lru_hash"),
            TableKind::Other(t) => write!(f, "type_{}", t),
        }
    }
}

/// Everything known about one table instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableIdentity {
    pub id: TableId,
    pub name: TableName,
    /// Maximum entries; 0 when unknown.
    pub capacity: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub kind: TableKind,
}

impl TableIdentity {
    /// Identity with only id and name known.
    pub fn partial(id: TableId, name: TableName) -> Self {
        TableIdentity {
            id,
            name,
            capacity: 0,
            key_size: 0,
            value_size: 0,
            kind: TableKind::default(),
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_key_size(mut self, key_size: u32) -> Self {
        self.key_size = key_size;
        self
    }

    pub fn with_value_size(mut self, value_size: u32) -> Self {
        self.value_size = value_size;
        self
    }

    pub fn with_kind(mut self, kind: TableKind) -> Self {
        self.kind = kind;
        self
    }
}

impl fmt::Display for TableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_from_padded_strips_nul() {
        let mut raw = [0u8; TABLE_NAME_LEN];
        raw[..8].copy_from_slice(b"hash_map");
        assert_eq!(TableName::from_padded(&raw).as_str(), "hash_map");
    }

    #[test]
    fn test_name_from_padded_full_width() {
        let raw = *b"sixteen_chars_xx";
        assert_eq!(TableName::from_padded(&raw).as_str(), "sixteen_chars_xx");
    }

    #[test]
    fn test_name_from_padded_invalid_utf8() {
        let raw = [b'a', 0xff, b'b', 0];
        assert_eq!(TableName::from_padded(&raw).as_str(), "a\u{fffd}b");
    }

    #[test]
    fn test_kind_from_kernel_type() {
        assert_eq!(TableKind::from_kernel_type(1), TableKind::Hash);
        assert_eq!(TableKind::from_kernel_type(2), TableKind::Array);
        assert_eq!(TableKind::from_kernel_type(9), TableKind::LruHash);
        assert_eq!(TableKind::from_kernel_type(27), TableKind::Other(27));
        assert_eq!(TableKind::LruHash.to_string(), "lru_hash");
    }

    #[test]
    fn test_identity_builder() {
        let identity = TableIdentity::partial(TableId(7), "counts".into())
            .with_capacity(1024)
            .with_key_size(4)
            .with_kind(TableKind::Hash);
        assert_eq!(identity.capacity, 1024);
        assert_eq!(identity.key_size, 4);
        assert_eq!(identity.to_string(), "7:counts");
    }
}

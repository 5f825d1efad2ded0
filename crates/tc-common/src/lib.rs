//! Table census common types and errors.
//!
//! This crate provides foundational types shared across tc-core modules:
//! - Kernel table identity types (id, name, kind, capacity)
//! - The unified error taxonomy with stable codes and categories

pub mod error;
pub mod table;

pub use error::{format_error_human, Error, ErrorCategory, Result, StructuredError};
pub use table::{TableId, TableIdentity, TableKind, TableName, TABLE_NAME_LEN};

//! Error types for the table census.
//!
//! This module provides structured error handling with:
//! - Stable error codes for machine parsing
//! - Category classification that encodes the propagation rule
//! - Remediation suggestions for humans
//!
//! # Propagation
//!
//! | Category     | Behavior                                             |
//! |--------------|------------------------------------------------------|
//! | `protocol`   | fatal: terminates the owning loop (operator restart) |
//! | `table`      | transient: skip the table, log, continue             |
//! | `accounting` | soft: log, resolve toward no double/negative count   |
//! | `config`     | fatal at startup                                     |
//! | `io`         | depends on the caller; usually transient             |
//! | `platform`   | fatal at startup                                     |
//!
//! # Human-Facing Output
//!
//! ```text
//! ✗ Malformed Event Record
//!   Reason: malformed event record: record is 12 bytes, expected at least 44
//!   Fix: The instrumentation and controller disagree on the record layout...
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for table census operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration file errors.
    Config,
    /// Producer/controller protocol mismatches.
    Protocol,
    /// A single table could not be opened or enumerated.
    Table,
    /// Replica accounting anomalies.
    Accounting,
    /// File I/O and serialization errors.
    Io,
    /// Platform compatibility errors.
    Platform,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Table => write!(f, "table"),
            ErrorCategory::Accounting => write!(f, "accounting"),
            ErrorCategory::Io => write!(f, "io"),
            ErrorCategory::Platform => write!(f, "platform"),
        }
    }
}

/// Unified error type for the table census.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration file {path}: {reason}")]
    InvalidConfig { path: String, reason: String },

    // Protocol errors (20-29)
    #[error("malformed event record: {0}")]
    MalformedRecord(String),

    #[error("malformed census line {line_no}: {reason}")]
    MalformedCensusLine { line_no: usize, reason: String },

    #[error("required source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("census poller gave up after {failures} consecutive failed cycles")]
    PollBudgetExhausted { failures: u32 },

    // Table errors (30-39)
    #[error("table {table} unavailable: {reason}")]
    TableUnavailable { table: String, reason: String },

    #[error("enumerating table {table} failed: {reason}")]
    EnumerationFailed { table: String, reason: String },

    // Accounting errors (40-49)
    #[error("duplicate insert into table {table_id}")]
    DuplicateInsert { table_id: u32 },

    #[error("remove of absent key from table {table_id}")]
    RemoveOfAbsent { table_id: u32 },

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Platform errors (70-79)
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl Error {
    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Configuration errors
    /// - 20-29: Protocol errors
    /// - 30-39: Table errors
    /// - 40-49: Accounting errors
    /// - 60-69: I/O errors
    /// - 70-79: Platform errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidConfig { .. } => 11,
            Error::MalformedRecord(_) => 20,
            Error::MalformedCensusLine { .. } => 21,
            Error::SourceUnavailable(_) => 22,
            Error::PollBudgetExhausted { .. } => 23,
            Error::TableUnavailable { .. } => 30,
            Error::EnumerationFailed { .. } => 31,
            Error::DuplicateInsert { .. } => 40,
            Error::RemoveOfAbsent { .. } => 41,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
            Error::UnsupportedPlatform(_) => 70,
            Error::PermissionDenied(_) => 71,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::InvalidConfig { .. } => ErrorCategory::Config,

            Error::MalformedRecord(_)
            | Error::MalformedCensusLine { .. }
            | Error::SourceUnavailable(_)
            | Error::PollBudgetExhausted { .. } => ErrorCategory::Protocol,

            Error::TableUnavailable { .. } | Error::EnumerationFailed { .. } => {
                ErrorCategory::Table
            }

            Error::DuplicateInsert { .. } | Error::RemoveOfAbsent { .. } => {
                ErrorCategory::Accounting
            }

            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,

            Error::UnsupportedPlatform(_) | Error::PermissionDenied(_) => ErrorCategory::Platform,
        }
    }

    /// Whether the error must terminate the loop that produced it.
    ///
    /// Continuing past a fatal error risks silently wrong accounting.
    pub fn is_fatal(&self) -> bool {
        match self.category() {
            ErrorCategory::Config | ErrorCategory::Protocol | ErrorCategory::Platform => true,
            ErrorCategory::Table | ErrorCategory::Accounting | ErrorCategory::Io => false,
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::InvalidConfig { .. } => {
                "Run 'tc-core check' to validate the configuration file."
            }
            Error::MalformedRecord(_) => {
                "The instrumentation and controller disagree on the record layout. Rebuild both from the same revision."
            }
            Error::MalformedCensusLine { .. } => {
                "The enumeration program output changed format. Re-pin the iterator built for this controller."
            }
            Error::SourceUnavailable(_) => {
                "Check that the instrumentation is loaded and the configured record/iterator paths exist."
            }
            Error::PollBudgetExhausted { .. } => {
                "The census poller failed repeatedly. Inspect the iterator output with 'cat <iterator_path>'."
            }
            Error::TableUnavailable { .. } | Error::EnumerationFailed { .. } => {
                "The table was skipped. It may have been unpinned, or the process lacks CAP_BPF."
            }
            Error::DuplicateInsert { .. } | Error::RemoveOfAbsent { .. } => {
                "No action needed. Accounting anomalies are expected around startup."
            }
            Error::Io(_) => "Check paths and permissions, then retry.",
            Error::Json(_) => "Invalid JSON. Check syntax with 'jq . <file>'.",
            Error::UnsupportedPlatform(_) => "Kernel table access requires Linux with BPF support.",
            Error::PermissionDenied(_) => {
                "Run as root or grant CAP_BPF and CAP_PERFMON to the controller."
            }
        }
    }

    /// Returns a short headline for human-readable output.
    pub fn headline(&self) -> &'static str {
        match self {
            Error::Config(_) => "Configuration Error",
            Error::InvalidConfig { .. } => "Invalid Configuration File",
            Error::MalformedRecord(_) => "Malformed Event Record",
            Error::MalformedCensusLine { .. } => "Malformed Census Line",
            Error::SourceUnavailable(_) => "Source Unavailable",
            Error::PollBudgetExhausted { .. } => "Census Poller Stopped",
            Error::TableUnavailable { .. } => "Table Unavailable",
            Error::EnumerationFailed { .. } => "Table Enumeration Failed",
            Error::DuplicateInsert { .. } => "Duplicate Insert",
            Error::RemoveOfAbsent { .. } => "Remove Of Absent Key",
            Error::Io(_) => "I/O Error",
            Error::Json(_) => "JSON Parse Error",
            Error::UnsupportedPlatform(_) => "Unsupported Platform",
            Error::PermissionDenied(_) => "Permission Denied",
        }
    }
}

/// Structured error response for JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Stable error code.
    pub code: u32,

    /// Error category for grouping.
    pub category: ErrorCategory,

    /// Human-readable error message.
    pub message: String,

    /// Whether the error terminates its loop.
    pub fatal: bool,

    /// Additional structured context (e.g., table id, line number).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        let mut context = HashMap::new();

        match err {
            Error::MalformedCensusLine { line_no, .. } => {
                context.insert("line_no".to_string(), serde_json::json!(line_no));
            }
            Error::PollBudgetExhausted { failures } => {
                context.insert("failures".to_string(), serde_json::json!(failures));
            }
            Error::TableUnavailable { table, .. } | Error::EnumerationFailed { table, .. } => {
                context.insert("table".to_string(), serde_json::json!(table));
            }
            Error::DuplicateInsert { table_id } | Error::RemoveOfAbsent { table_id } => {
                context.insert("table_id".to_string(), serde_json::json!(table_id));
            }
            Error::InvalidConfig { path, .. } => {
                context.insert("path".to_string(), serde_json::json!(path));
            }
            _ => {}
        }

        StructuredError {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
            fatal: err.is_fatal(),
            context,
        }
    }
}

impl StructuredError {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"serialization_failed"}}"#, self.code)
        })
    }
}

/// Format an error for human-readable stderr output.
///
/// Output format:
/// ```text
/// ✗ [Headline]
///   Reason: [Error message]
///   Fix: [Remediation hint]
/// ```
pub fn format_error_human(err: &Error, use_color: bool) -> String {
    let (red, cyan, reset) = if use_color {
        ("\x1b[31m", "\x1b[36m", "\x1b[0m")
    } else {
        ("", "", "")
    };

    format!(
        "{red}✗{reset} {headline}\n  Reason: {message}\n  {cyan}Fix:{reset} {remediation}",
        red = red,
        cyan = cyan,
        reset = reset,
        headline = err.headline(),
        message = err,
        remediation = err.remediation()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        assert_eq!(Error::Config("test".into()).code(), 10);
        assert_eq!(Error::MalformedRecord("short".into()).code(), 20);
        assert_eq!(Error::RemoveOfAbsent { table_id: 3 }.code(), 41);
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            Error::MalformedCensusLine {
                line_no: 1,
                reason: "missing field".into()
            }
            .category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            Error::TableUnavailable {
                table: "/sys/fs/bpf/x".into(),
                reason: "ENOENT".into()
            }
            .category(),
            ErrorCategory::Table
        );
        assert_eq!(
            Error::DuplicateInsert { table_id: 1 }.category(),
            ErrorCategory::Accounting
        );
    }

    #[test]
    fn test_fatality_follows_category() {
        assert!(Error::MalformedRecord("x".into()).is_fatal());
        assert!(Error::PollBudgetExhausted { failures: 3 }.is_fatal());
        assert!(!Error::EnumerationFailed {
            table: "t".into(),
            reason: "r".into()
        }
        .is_fatal());
        assert!(!Error::RemoveOfAbsent { table_id: 9 }.is_fatal());
    }

    #[test]
    fn test_structured_error_context() {
        let err = Error::MalformedCensusLine {
            line_no: 4,
            reason: "expected 4 fields, got 3".into(),
        };
        let structured = StructuredError::from(&err);
        assert_eq!(structured.code, 21);
        assert!(structured.fatal);
        assert_eq!(structured.context["line_no"], serde_json::json!(4));

        let json = structured.to_json();
        assert!(json.contains("\"category\":\"protocol\""));
    }

    #[test]
    fn test_format_error_human_without_color() {
        let err = Error::SourceUnavailable("/run/tc/events".into());
        let out = format_error_human(&err, false);
        assert!(out.starts_with("✗ Source Unavailable"));
        assert!(out.contains("Reason: required source unavailable: /run/tc/events"));
        assert!(out.contains("Fix: "));
    }
}

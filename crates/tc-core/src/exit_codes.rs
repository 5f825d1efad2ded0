//! Exit codes for the tc-core binary.
//!
//! Exit code ranges:
//! - 0-1: Clean outcomes
//! - 10-19: User/environment errors (fixable by the operator)
//! - 20-29: Runtime failures of a census loop or the process itself

use tc_common::{Error, ErrorCategory};

/// Stable exit codes for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Clean run or clean shutdown.
    Clean = 0,

    /// Stopped by SIGINT/SIGTERM.
    Interrupted = 1,

    /// Invalid arguments or configuration.
    ConfigError = 10,

    /// Not supported on this platform.
    PlatformError = 11,

    /// Kernel refused access (missing CAP_BPF / CAP_SYS_ADMIN).
    PermissionError = 12,

    /// A record or enumeration source could not be opened or went away.
    SourceError = 13,

    /// The event stream or enumeration output violated the wire format.
    ProtocolError = 20,

    /// I/O error.
    IoError = 21,

    /// Internal error (bug).
    InternalError = 22,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        matches!(self, ExitCode::Clean | ExitCode::Interrupted)
    }

    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::Interrupted => "OK_INTERRUPTED",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::PlatformError => "ERR_PLATFORM",
            ExitCode::PermissionError => "ERR_PERMISSION",
            ExitCode::SourceError => "ERR_SOURCE",
            ExitCode::ProtocolError => "ERR_PROTOCOL",
            ExitCode::IoError => "ERR_IO",
            ExitCode::InternalError => "ERR_INTERNAL",
        }
    }

    /// Map a terminating error to its exit code.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::PermissionDenied(_) => ExitCode::PermissionError,
            Error::SourceUnavailable(_) => ExitCode::SourceError,
            _ => match err.category() {
                ErrorCategory::Config => ExitCode::ConfigError,
                ErrorCategory::Protocol => ExitCode::ProtocolError,
                ErrorCategory::Platform => ExitCode::PlatformError,
                ErrorCategory::Io => ExitCode::IoError,
                ErrorCategory::Table | ErrorCategory::Accounting => ExitCode::InternalError,
            },
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.as_i32()
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}

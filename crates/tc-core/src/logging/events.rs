//! Structured event vocabulary for logging.
//!
//! Lifecycle events are emitted with a `target` taken from [`event_names`]
//! and carry the run correlation ids from a [`LogContext`].

use serde::{Deserialize, Serialize};

/// Log levels as they appear in JSONL output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

/// Pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Startup and configuration.
    Init,
    /// Baseline enumeration of pinned tables.
    Snapshot,
    /// Mutation event consumption.
    Stream,
    /// Kernel-side census polling.
    Poll,
    /// Metrics exposition.
    Publish,
    /// Thread supervision and shutdown.
    Daemon,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Snapshot => "snapshot",
            Stage::Stream => "stream",
            Stage::Poll => "poll",
            Stage::Publish => "publish",
            Stage::Daemon => "daemon",
        };
        write!(f, "{}", s)
    }
}

/// Standard event names used as tracing targets.
pub mod event_names {
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_FINISHED: &str = "run.finished";

    pub const CONFIG_LOADED: &str = "config.loaded";
    pub const CONFIG_DEFAULT_USED: &str = "config.default_used";

    pub const SNAPSHOT_FINISHED: &str = "snapshot.finished";

    pub const STREAM_STARTED: &str = "stream.started";
    pub const STREAM_FINISHED: &str = "stream.finished";
    pub const STREAM_FAILED: &str = "stream.failed";

    pub const POLL_STARTED: &str = "poll.started";
    pub const POLL_STOPPED: &str = "poll.stopped";
    pub const POLL_FAILED: &str = "poll.failed";

    pub const METRICS_STARTED: &str = "metrics.started";
}

/// Correlation ids shared by every event of one controller run.
#[derive(Debug, Clone)]
pub struct LogContext {
    pub run_id: String,
    pub host_id: String,
}

impl LogContext {
    pub fn new(run_id: impl Into<String>, host_id: impl Into<String>) -> Self {
        LogContext {
            run_id: run_id.into(),
            host_id: host_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_serialization() {
        assert_eq!(serde_json::to_string(&Stage::Snapshot).unwrap(), "\"snapshot\"");
        assert_eq!(Stage::Poll.to_string(), "poll");
    }

    #[test]
    fn test_level_from_tracing() {
        assert_eq!(Level::from(tracing::Level::INFO), Level::Info);
        assert_eq!(Level::from(tracing::Level::WARN), Level::Warn);
    }

    #[test]
    fn test_log_context() {
        let ctx = LogContext::new("run-abc", "host-xyz");
        assert_eq!(ctx.run_id, "run-abc");
        assert_eq!(ctx.host_id, "host-xyz");
    }
}

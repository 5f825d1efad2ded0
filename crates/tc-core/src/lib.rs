//! Table Census Core Library
//!
//! Live cardinality and pressure for kernel BPF tables:
//! - Mutation event decoding and the shadow replica store
//! - Startup snapshot of pinned tables
//! - Kernel-side census polling via a pinned table iterator
//! - Prometheus publishing, configuration and exit codes
//!
//! The binary entry point is in `main.rs`.

pub mod census;
pub mod config;
pub mod daemon;
pub mod exit_codes;
pub mod kernel;
pub mod keys;
pub mod logging;
pub mod publish;
pub mod replica;
pub mod shutdown;
pub mod snapshot;
pub mod stream;

pub use census::{CensusLine, CensusPoller, PollCycle, PollerConfig};
pub use config::{load_config, CensusConfig, ConfigOptions, ResolvedConfig};
pub use daemon::{Daemon, DaemonSources, DaemonSummary};
pub use exit_codes::ExitCode;
pub use publish::{CensusSink, LabelMode, Publisher, Strategy, PRESSURE_UNKNOWN};
pub use replica::{ApplyOutcome, ShadowReplicaStore, TableCensus};
pub use shutdown::Shutdown;
pub use stream::{decode_record, MutationEvent, MutationKind, RECORD_LEN};

//! Configuration loading and validation for tc-core.
//!
//! A single JSON file, resolved in this order:
//! 1. Explicit `--config` path
//! 2. `TABLE_CENSUS_CONFIG` environment variable
//! 3. `$XDG_CONFIG_HOME/table_census/config.json`
//! 4. Built-in defaults
//!
//! An explicitly named file must exist; the XDG file is optional.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::census::PollerConfig;
use crate::kernel::DEFAULT_PINNED_ROOT;
use crate::publish::prometheus::MetricsConfig;
use crate::publish::{LabelMode, Strategy};
use crate::snapshot::DEFAULT_MAX_DEPTH;
use crate::stream::RECORD_LEN;

/// Schema version for configuration files.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "TABLE_CENSUS_CONFIG";

const CONFIG_DIR_NAME: &str = "table_census";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Invalid JSON in config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error reading {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schema version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error("Semantic validation failed: {0}")]
    Validation(#[from] ValidationError),
}

impl ConfigError {
    fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::NotFound { path }
            | ConfigError::ParseError { path, .. }
            | ConfigError::IoError { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<ConfigError> for tc_common::Error {
    fn from(err: ConfigError) -> Self {
        match err.path() {
            Some(path) => tc_common::Error::InvalidConfig {
                path: path.display().to_string(),
                reason: err.to_string(),
            },
            None => tc_common::Error::Config(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no census strategy enabled; enable replica or poller")]
    NoStrategy,

    #[error("authority {0} is not enabled")]
    AuthorityDisabled(Strategy),

    #[error("poller.interval_ms must be greater than zero")]
    ZeroInterval,

    #[error("replica.record_path is required when the replica is enabled")]
    MissingRecordPath,

    #[error("replica.record_stride {0} is shorter than one record")]
    StrideTooShort(usize),

    #[error("metrics.path must start with '/', got {0:?}")]
    MetricsPath(String),
}

/// Default pin of the mutation event ring buffer.
pub const DEFAULT_EVENTS_PIN: &str = "/sys/fs/bpf/map_events";

/// How mutation records reach the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSourceKind {
    /// Pinned kernel ring buffer, drained directly.
    #[default]
    Ringbuf,
    /// FIFO or file carrying back-to-back records.
    Fifo,
}

/// Shadow replica settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    pub enabled: bool,
    pub record_source: RecordSourceKind,
    /// Pinned ring buffer, or the FIFO when `record_source` is `fifo`.
    pub record_path: Option<PathBuf>,
    /// Bytes per record on a FIFO, including any alignment padding.
    pub record_stride: usize,
    /// Namespace walked by the startup snapshot. `None` skips the walk.
    pub pinned_root: Option<PathBuf>,
    /// Extra pinned tables outside `pinned_root`.
    pub pinned_paths: Vec<PathBuf>,
    pub max_depth: usize,
    /// Look up capacity and key size of tables first seen through an event.
    pub resolve_unknown_tables: bool,
    /// Keep sorted members in `snapshot` output.
    pub track_members: bool,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            record_source: RecordSourceKind::default(),
            record_path: Some(PathBuf::from(DEFAULT_EVENTS_PIN)),
            record_stride: RECORD_LEN,
            pinned_root: Some(PathBuf::from(DEFAULT_PINNED_ROOT)),
            pinned_paths: Vec::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            resolve_unknown_tables: true,
            track_members: false,
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CensusConfig {
    pub schema_version: String,
    pub metrics: MetricsConfig,
    pub replica: ReplicaConfig,
    pub poller: PollerConfig,
    pub label_mode: LabelMode,
    /// Strategy that owns the primary series when both run.
    pub authority: Option<Strategy>,
}

impl Default for CensusConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION.to_string(),
            metrics: MetricsConfig::default(),
            replica: ReplicaConfig::default(),
            poller: PollerConfig::default(),
            label_mode: LabelMode::default(),
            authority: None,
        }
    }
}

impl CensusConfig {
    /// Enabled strategies.
    pub fn strategies(&self) -> Vec<Strategy> {
        let mut out = Vec::new();
        if self.replica.enabled {
            out.push(Strategy::Replica);
        }
        if self.poller.enabled {
            out.push(Strategy::Poller);
        }
        out
    }

    /// The designated authority, defaulting to the poller when it runs.
    pub fn authority(&self) -> Option<Strategy> {
        self.authority.or(if self.poller.enabled {
            Some(Strategy::Poller)
        } else if self.replica.enabled {
            Some(Strategy::Replica)
        } else {
            None
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let strategies = self.strategies();
        if strategies.is_empty() {
            return Err(ValidationError::NoStrategy);
        }
        if let Some(authority) = self.authority {
            if !strategies.contains(&authority) {
                return Err(ValidationError::AuthorityDisabled(authority));
            }
        }
        if self.poller.enabled && self.poller.interval_ms == 0 {
            return Err(ValidationError::ZeroInterval);
        }
        if self.replica.enabled {
            if self.replica.record_path.is_none() {
                return Err(ValidationError::MissingRecordPath);
            }
            if self.replica.record_source == RecordSourceKind::Fifo
                && self.replica.record_stride < RECORD_LEN
            {
                return Err(ValidationError::StrideTooShort(self.replica.record_stride));
            }
        }
        if self.metrics.enabled && !self.metrics.path.starts_with('/') {
            return Err(ValidationError::MetricsPath(self.metrics.path.clone()));
        }
        Ok(())
    }
}

/// Configuration resolution options.
#[derive(Debug, Default)]
pub struct ConfigOptions {
    /// Explicit config file (highest priority).
    pub config_path: Option<PathBuf>,
}

/// Loaded configuration with provenance.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: CensusConfig,
    /// File the config came from (None if using defaults).
    pub path: Option<PathBuf>,
    /// SHA-256 of the file content (None if using defaults).
    pub hash: Option<String>,
}

/// Where a config file was looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Candidate {
    /// Must exist.
    Required(PathBuf),
    /// Used only if present.
    Optional(PathBuf),
}

fn resolve_candidate(
    explicit: Option<&Path>,
    env_value: Option<String>,
    config_home: Option<PathBuf>,
) -> Option<Candidate> {
    if let Some(path) = explicit {
        return Some(Candidate::Required(path.to_path_buf()));
    }
    if let Some(path) = env_value.filter(|v| !v.is_empty()) {
        return Some(Candidate::Required(PathBuf::from(path)));
    }
    config_home.map(|home| Candidate::Optional(home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME)))
}

fn config_home() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
}

/// Load configuration with the standard resolution order and validate it.
pub fn load_config(options: &ConfigOptions) -> Result<ResolvedConfig, ConfigError> {
    let candidate = resolve_candidate(
        options.config_path.as_deref(),
        std::env::var(CONFIG_ENV_VAR).ok(),
        config_home(),
    );

    let resolved = match candidate {
        Some(Candidate::Required(path)) => {
            if !path.exists() {
                return Err(ConfigError::NotFound { path });
            }
            load_from_file(&path)?
        }
        Some(Candidate::Optional(path)) if path.exists() => load_from_file(&path)?,
        _ => ResolvedConfig {
            config: CensusConfig::default(),
            path: None,
            hash: None,
        },
    };

    resolved.config.validate()?;
    Ok(resolved)
}

/// Load and version-check one config file. Does not validate semantics.
pub fn load_from_file(path: &Path) -> Result<ResolvedConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        path: path.to_path_buf(),
        source: e,
    })?;

    let hash = compute_hash(&content);

    let config: CensusConfig =
        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(ConfigError::VersionMismatch {
            expected: CONFIG_SCHEMA_VERSION.to_string(),
            actual: config.schema_version.clone(),
        });
    }

    Ok(ResolvedConfig {
        config,
        path: Some(path.to_path_buf()),
        hash: Some(hash),
    })
}

/// SHA-256 of the file content, hex encoded.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_validate() {
        let config = CensusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.authority(), Some(Strategy::Poller));
        assert_eq!(config.metrics.port, 2112);
        assert_eq!(config.label_mode, LabelMode::Id);
    }

    #[test]
    fn test_explicit_file_loads_with_hash() {
        let file = write_config(
            r#"{
                "schema_version": "1.0.0",
                "label_mode": "name",
                "replica": {"enabled": true, "record_path": "/run/table_census/events"},
                "poller": {"enabled": false}
            }"#,
        );
        let resolved = load_config(&ConfigOptions {
            config_path: Some(file.path().to_path_buf()),
        })
        .unwrap();
        assert_eq!(resolved.config.label_mode, LabelMode::Name);
        assert_eq!(resolved.config.authority(), Some(Strategy::Replica));
        assert_eq!(resolved.config.replica.max_depth, DEFAULT_MAX_DEPTH);
        assert_eq!(resolved.hash.as_ref().map(|h| h.len()), Some(64));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let err = load_config(&ConfigOptions {
            config_path: Some(PathBuf::from("/nonexistent/table_census.json")),
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
        let err: tc_common::Error = err.into();
        assert_eq!(err.code(), 11);
    }

    #[test]
    fn test_version_mismatch() {
        let file = write_config(r#"{"schema_version": "0.9.0"}"#);
        let err = load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::VersionMismatch { .. }));
    }

    #[test]
    fn test_parse_error() {
        let file = write_config("{not json");
        assert!(matches!(
            load_from_file(file.path()).unwrap_err(),
            ConfigError::ParseError { .. }
        ));
    }

    #[test]
    fn test_validation_rules() {
        let mut config = CensusConfig::default();
        config.poller.enabled = false;
        assert_eq!(config.validate(), Err(ValidationError::NoStrategy));

        let mut config = CensusConfig::default();
        config.authority = Some(Strategy::Replica);
        assert_eq!(
            config.validate(),
            Err(ValidationError::AuthorityDisabled(Strategy::Replica))
        );

        let mut config = CensusConfig::default();
        config.poller.interval_ms = 0;
        assert_eq!(config.validate(), Err(ValidationError::ZeroInterval));

        let mut config = CensusConfig::default();
        config.replica.enabled = true;
        config.replica.record_path = None;
        assert_eq!(config.validate(), Err(ValidationError::MissingRecordPath));

        config.replica.record_path = Some(PathBuf::from("/tmp/events"));
        config.replica.record_stride = 40;
        // The stride only frames FIFO input.
        assert!(config.validate().is_ok());
        config.replica.record_source = RecordSourceKind::Fifo;
        assert_eq!(config.validate(), Err(ValidationError::StrideTooShort(40)));
    }

    #[test]
    fn test_record_source_defaults_to_pinned_ringbuf() {
        let config = CensusConfig::default();
        assert_eq!(config.replica.record_source, RecordSourceKind::Ringbuf);
        assert_eq!(
            config.replica.record_path.as_deref(),
            Some(Path::new(DEFAULT_EVENTS_PIN))
        );

        let file = write_config(
            r#"{"replica": {"enabled": true, "record_source": "fifo", "record_path": "/run/tc/events"}}"#,
        );
        let config = load_from_file(file.path()).unwrap().config;
        assert_eq!(config.replica.record_source, RecordSourceKind::Fifo);
        assert_eq!(config.replica.record_stride, RECORD_LEN);
    }

    #[test]
    fn test_resolution_order() {
        let home = Some(PathBuf::from("/home/u/.config"));
        assert_eq!(
            resolve_candidate(Some(Path::new("/etc/tc.json")), Some("/env.json".into()), home.clone()),
            Some(Candidate::Required(PathBuf::from("/etc/tc.json")))
        );
        assert_eq!(
            resolve_candidate(None, Some("/env.json".into()), home.clone()),
            Some(Candidate::Required(PathBuf::from("/env.json")))
        );
        assert_eq!(
            resolve_candidate(None, Some(String::new()), home),
            Some(Candidate::Optional(PathBuf::from(
                "/home/u/.config/table_census/config.json"
            )))
        );
        assert_eq!(resolve_candidate(None, None, None), None);
    }

    #[test]
    fn test_hash_is_sha256() {
        assert_eq!(
            compute_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

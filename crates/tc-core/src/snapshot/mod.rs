//! Startup baseline of every tracked table.
//!
//! The loader reads each table's current entries once and seeds the replica
//! store with the keys whose value is not all zero. It is best-effort: a
//! file that is not a table, or a table that fails mid-read, is skipped and
//! recorded in the [`SnapshotReport`]. Nothing here is fatal.
//!
//! The read is not atomic with event delivery; see the race notes on
//! [`crate::daemon`].

pub mod namespace;

pub use namespace::{walk_namespace, NamespaceWalk, SkippedPath, DEFAULT_MAX_DEPTH};

use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tc_common::{TableId, TableName};
use tracing::{debug, warn};

use crate::keys::{KeyCodec, KeyRecord};
use crate::kernel::{KernelTable, TableOpener};
use crate::replica::ShadowReplicaStore;

/// One table loaded into the store.
#[derive(Debug, Clone, Serialize)]
pub struct SeededTable {
    pub id: TableId,
    pub name: TableName,
    pub capacity: u32,
    pub cardinality: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// What a snapshot pass did.
#[derive(Debug, Default, Serialize)]
pub struct SnapshotReport {
    pub seeded: Vec<SeededTable>,
    pub entries_read: u64,
    pub zero_valued_skipped: u64,
    pub skipped: Vec<SkippedPath>,
    #[serde(skip)]
    seen: HashSet<TableId>,
}

impl SnapshotReport {
    pub fn tables_seeded(&self) -> usize {
        self.seeded.len()
    }
}

/// Loads table baselines into a [`ShadowReplicaStore`].
pub struct SnapshotLoader {
    opener: Arc<dyn TableOpener>,
    max_depth: usize,
}

impl SnapshotLoader {
    pub fn new(opener: Arc<dyn TableOpener>) -> Self {
        SnapshotLoader {
            opener,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Attempt every regular file under a pinned namespace.
    pub fn load_namespace(
        &self,
        root: &Path,
        store: &ShadowReplicaStore,
        report: &mut SnapshotReport,
    ) {
        let walk = walk_namespace(root, self.max_depth);
        for skipped in &walk.skipped {
            debug!(path = %skipped.path.display(), reason = %skipped.reason, "namespace entry skipped");
        }
        report.skipped.extend(walk.skipped);
        self.load_paths(&walk.candidates, store, report);
    }

    /// Attempt each path as a pinned table.
    pub fn load_paths(&self, paths: &[PathBuf], store: &ShadowReplicaStore, report: &mut SnapshotReport) {
        for path in paths {
            match self.opener.open_pinned(path) {
                Ok(table) => self.load_table(table, Some(path.clone()), store, report),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "not a usable table");
                    report.skipped.push(SkippedPath {
                        path: path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Load tables the process already holds handles for.
    pub fn load_handles(
        &self,
        tables: Vec<Box<dyn KernelTable>>,
        store: &ShadowReplicaStore,
        report: &mut SnapshotReport,
    ) {
        for table in tables {
            self.load_table(table, None, store, report);
        }
    }

    fn load_table(
        &self,
        mut table: Box<dyn KernelTable>,
        path: Option<PathBuf>,
        store: &ShadowReplicaStore,
        report: &mut SnapshotReport,
    ) {
        let identity = table.identity().clone();
        if !report.seen.insert(identity.id) {
            debug!(table_id = identity.id.0, "table pinned more than once, already seeded");
            return;
        }

        let entries = match table.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(table_id = identity.id.0, table = %identity.name, error = %e, "table enumeration failed, skipping");
                report.seen.remove(&identity.id);
                report.skipped.push(SkippedPath {
                    path: path.unwrap_or_else(|| PathBuf::from(identity.to_string())),
                    reason: e.to_string(),
                });
                return;
            }
        };

        let codec = KeyCodec::for_key_size(identity.key_size);
        let mut keys: Vec<KeyRecord> = Vec::with_capacity(entries.len());
        for entry in &entries {
            report.entries_read += 1;
            if entry.value_is_zero() {
                report.zero_valued_skipped += 1;
                continue;
            }
            keys.push(codec.normalize(&entry.key));
        }

        let cardinality = store.seed(identity.clone(), keys);
        debug!(
            table_id = identity.id.0,
            table = %identity.name,
            entries = entries.len(),
            cardinality,
            "table seeded"
        );
        report.seeded.push(SeededTable {
            id: identity.id,
            name: identity.name,
            capacity: identity.capacity,
            cardinality,
            path,
        });
    }
}

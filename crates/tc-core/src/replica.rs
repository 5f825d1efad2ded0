//! Shadow replica of each tracked table's live key set.
//!
//! The store is the only owner of replica state. Each table sits behind its
//! own mutex inside a map guarded by an `RwLock`, so the consumer, the loader
//! and readers touching different tables never contend. Every change is
//! published while the table's lock is held, which keeps a table's gauge
//! writes in apply order.
//!
//! The startup snapshot treats an all-zero value as an empty slot, but the
//! stream does not look at values: an Insert always makes its key a member,
//! even when it writes zero. Storing zero into an array slot after the
//! baseline therefore counts that slot, and only an explicit Remove takes it
//! out again.
//!
//! Tables are keyed by numeric id only. A recycled id keeps accumulating
//! into the old replica until restart; a name change on a known id is
//! logged, not corrected.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tc_common::{TableId, TableIdentity, TableName};
use tracing::{debug, warn};

use crate::keys::{KeyCodec, KeyRecord};
use crate::publish::{pressure, Publisher, TableLabel};
use crate::stream::decode::{MutationEvent, MutationKind};

/// Lifecycle of a table's replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaPhase {
    /// Known but neither seeded nor mutated yet.
    Unseen,
    /// Baseline loaded from the snapshot.
    Seeded,
    /// At least one event applied.
    Live,
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Inserted,
    /// Insert of a present key: update in place, cardinality unchanged.
    Updated,
    Removed,
    /// Remove of a key the replica never saw. Ignored.
    RemoveOfAbsent,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Inserted => "inserted",
            ApplyOutcome::Updated => "updated",
            ApplyOutcome::Removed => "removed",
            ApplyOutcome::RemoveOfAbsent => "remove_of_absent",
        }
    }

    /// The soft accounting error this outcome stands for, if any.
    pub fn anomaly(&self, table_id: TableId) -> Option<tc_common::Error> {
        match self {
            ApplyOutcome::Updated => Some(tc_common::Error::DuplicateInsert {
                table_id: table_id.0,
            }),
            ApplyOutcome::RemoveOfAbsent => Some(tc_common::Error::RemoveOfAbsent {
                table_id: table_id.0,
            }),
            ApplyOutcome::Inserted | ApplyOutcome::Removed => None,
        }
    }
}

/// Point-in-time view of one table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableCensus {
    pub identity: TableIdentity,
    pub cardinality: u64,
    pub pressure: f64,
    pub phase: ReplicaPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<KeyRecord>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicaOptions {
    /// Include sorted members in [`ShadowReplicaStore::read`] results.
    pub track_members: bool,
}

#[derive(Debug)]
struct TableReplica {
    identity: TableIdentity,
    codec: KeyCodec,
    label: TableLabel,
    live: HashSet<KeyRecord>,
    phase: ReplicaPhase,
    /// Last conflicting name warned about, to warn once per change.
    warned_name: Option<TableName>,
}

impl TableReplica {
    fn new(identity: TableIdentity, label: TableLabel, fallback_key_size: u32) -> Self {
        let key_size = if identity.key_size > 0 {
            identity.key_size
        } else {
            fallback_key_size
        };
        let codec = KeyCodec::for_key_size(key_size);
        if codec.is_lossy() {
            warn!(
                table_id = identity.id.0,
                table = %identity.name,
                key_size,
                "keys wider than the captured prefix; distinct keys sharing a prefix are counted once"
            );
        }
        TableReplica {
            identity,
            codec,
            label,
            live: HashSet::new(),
            phase: ReplicaPhase::Unseen,
            warned_name: None,
        }
    }

    fn cardinality(&self) -> u64 {
        self.live.len() as u64
    }

    fn census(&self, track_members: bool) -> TableCensus {
        let members = track_members.then(|| {
            let mut keys: Vec<KeyRecord> = self.live.iter().cloned().collect();
            keys.sort();
            keys
        });
        TableCensus {
            identity: self.identity.clone(),
            cardinality: self.cardinality(),
            pressure: pressure(self.cardinality(), self.identity.capacity),
            phase: self.phase,
            members,
        }
    }

    /// Fill in identity fields the replica was created without.
    fn absorb_identity(&mut self, identity: &TableIdentity) {
        if self.identity.capacity == 0 {
            self.identity.capacity = identity.capacity;
        }
        if self.identity.key_size == 0 {
            self.identity.key_size = identity.key_size;
        }
        if self.identity.value_size == 0 {
            self.identity.value_size = identity.value_size;
        }
        if self.identity.name.is_empty() {
            self.identity.name = identity.name.clone();
        }
    }

    fn check_name(&mut self, name: &TableName) {
        if name.is_empty() || *name == self.identity.name {
            return;
        }
        if self.warned_name.as_ref() == Some(name) {
            return;
        }
        warn!(
            table_id = self.identity.id.0,
            recorded = %self.identity.name,
            observed = %name,
            "table id reused under a different name; counts are combined until restart"
        );
        self.warned_name = Some(name.clone());
    }
}

/// Per-table live key sets and counts.
pub struct ShadowReplicaStore {
    tables: RwLock<HashMap<TableId, Arc<Mutex<TableReplica>>>>,
    publisher: Publisher,
    options: ReplicaOptions,
}

fn lock(table: &Mutex<TableReplica>) -> MutexGuard<'_, TableReplica> {
    // A panic mid-apply leaves a valid set behind; keep serving it.
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ShadowReplicaStore {
    pub fn new(publisher: Publisher, options: ReplicaOptions) -> Self {
        ShadowReplicaStore {
            tables: RwLock::new(HashMap::new()),
            publisher,
            options,
        }
    }

    fn get(&self, id: TableId) -> Option<Arc<Mutex<TableReplica>>> {
        let tables = self.tables.read().unwrap_or_else(|p| p.into_inner());
        tables.get(&id).cloned()
    }

    fn get_or_create(
        &self,
        identity: &TableIdentity,
        fallback_key_size: u32,
    ) -> (Arc<Mutex<TableReplica>>, bool) {
        if let Some(table) = self.get(identity.id) {
            return (table, false);
        }
        let mut tables = self.tables.write().unwrap_or_else(|p| p.into_inner());
        let mut created = false;
        let table = tables
            .entry(identity.id)
            .or_insert_with(|| {
                created = true;
                let label = self.publisher.label(identity.id, &identity.name);
                Arc::new(Mutex::new(TableReplica::new(
                    identity.clone(),
                    label,
                    fallback_key_size,
                )))
            })
            .clone();
        (table, created)
    }

    fn publish(&self, table: &TableReplica) {
        self.publisher
            .publish(&table.label, table.cardinality(), table.identity.capacity);
    }

    /// Whether the store already tracks `id`.
    pub fn contains(&self, id: TableId) -> bool {
        self.get(id).is_some()
    }

    /// Track a table without a baseline, e.g. one resolved by id on its
    /// first event. A no-op for known tables apart from filling in missing
    /// identity fields.
    pub fn register(&self, identity: TableIdentity) {
        let (table, created) = self.get_or_create(&identity, 0);
        if !created {
            lock(&table).absorb_identity(&identity);
        }
    }

    /// Load a table's baseline and publish its count.
    ///
    /// For a table already known to the store the keys are merged into the
    /// live set and the phase is left alone, so events applied while the
    /// snapshot ran are not lost. Returns the resulting cardinality.
    pub fn seed<I>(&self, identity: TableIdentity, keys: I) -> u64
    where
        I: IntoIterator<Item = KeyRecord>,
    {
        let (table, created) = self.get_or_create(&identity, 0);
        let mut table = lock(&table);
        if !created {
            table.absorb_identity(&identity);
        }
        table.live.extend(keys);
        if table.phase == ReplicaPhase::Unseen {
            table.phase = ReplicaPhase::Seeded;
        }
        debug!(
            table_id = identity.id.0,
            table = %table.identity.name,
            cardinality = table.cardinality(),
            "replica seeded"
        );
        self.publish(&table);
        table.cardinality()
    }

    /// Codec used for a table's keys, if the table is known.
    pub fn codec(&self, id: TableId) -> Option<KeyCodec> {
        self.get(id).map(|t| lock(&t).codec)
    }

    /// Apply one mutation and publish the table's new count.
    pub fn apply(&self, event: &MutationEvent) -> ApplyOutcome {
        let identity = TableIdentity::partial(event.table_id, event.table_name.clone())
            .with_key_size(event.key_size)
            .with_value_size(event.value_size);
        let (table, _) = self.get_or_create(&identity, event.key_size);
        let mut table = lock(&table);

        table.check_name(&event.table_name);
        let key = table.codec.normalize(&event.key_bytes);

        let outcome = match event.kind {
            MutationKind::Insert => {
                if table.live.insert(key.clone()) {
                    ApplyOutcome::Inserted
                } else {
                    ApplyOutcome::Updated
                }
            }
            MutationKind::Remove => {
                if table.live.remove(&key) {
                    ApplyOutcome::Removed
                } else {
                    ApplyOutcome::RemoveOfAbsent
                }
            }
        };
        table.phase = ReplicaPhase::Live;

        match outcome.anomaly(event.table_id) {
            Some(err) => debug!(
                table_id = event.table_id.0,
                key = %key,
                code = err.code(),
                error = %err,
                cardinality = table.cardinality(),
                "accounting anomaly ignored"
            ),
            None => debug!(
                table_id = event.table_id.0,
                key = %key,
                outcome = outcome.as_str(),
                cardinality = table.cardinality(),
                "event applied"
            ),
        }

        self.publish(&table);
        self.publisher.sink().record_event(outcome.as_str());
        outcome
    }

    /// Consistent view of one table.
    pub fn read(&self, id: TableId) -> Option<TableCensus> {
        self.get(id)
            .map(|t| lock(&t).census(self.options.track_members))
    }

    /// Known table ids, ascending.
    pub fn tables(&self) -> Vec<TableId> {
        let tables = self.tables.read().unwrap_or_else(|p| p.into_inner());
        let mut ids: Vec<TableId> = tables.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Views of every known table, ascending by id.
    pub fn censuses(&self) -> Vec<TableCensus> {
        self.tables()
            .into_iter()
            .filter_map(|id| self.read(id))
            .collect()
    }
}

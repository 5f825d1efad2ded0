//! Sequential drain of a record source into the replica store.

use serde::Serialize;
use std::io::ErrorKind;
use std::sync::Arc;
use tracing::debug;

use super::decode::decode_record;
use super::source::RecordSource;
use crate::kernel::TableCatalog;
use crate::replica::{ApplyOutcome, ShadowReplicaStore};
use crate::shutdown::Shutdown;

/// Result of one [`EventConsumer::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Applied(ApplyOutcome),
    /// No record was ready.
    Idle,
    /// The source is closed.
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub records: u64,
    pub inserted: u64,
    pub updated: u64,
    pub removed: u64,
    pub remove_of_absent: u64,
    /// Tables first seen through an event and resolved by id.
    pub resolved: u64,
}

impl ConsumerStats {
    fn count(&mut self, outcome: ApplyOutcome) {
        self.records += 1;
        match outcome {
            ApplyOutcome::Inserted => self.inserted += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::Removed => self.removed += 1,
            ApplyOutcome::RemoveOfAbsent => self.remove_of_absent += 1,
        }
    }
}

/// Decodes records in delivery order and applies them to the store.
///
/// There is exactly one consumer per source, which is what keeps each
/// table's events in order.
pub struct EventConsumer<S> {
    source: S,
    store: Arc<ShadowReplicaStore>,
    catalog: Option<Arc<dyn TableCatalog>>,
    stats: ConsumerStats,
}

impl<S: RecordSource> EventConsumer<S> {
    pub fn new(source: S, store: Arc<ShadowReplicaStore>) -> Self {
        EventConsumer {
            source,
            store,
            catalog: None,
            stats: ConsumerStats::default(),
        }
    }

    /// Resolve capacity and key size of tables first seen through an event.
    pub fn with_catalog(mut self, catalog: Arc<dyn TableCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Read, decode and apply at most one record.
    ///
    /// Decode failures and source failures are fatal protocol errors.
    pub fn step(&mut self) -> tc_common::Result<Step> {
        let raw = match self.source.next_record() {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(Step::Closed),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return Ok(Step::Idle)
            }
            Err(e) => return Err(tc_common::Error::SourceUnavailable(e.to_string())),
        };

        let event = decode_record(&raw)?;

        if !self.store.contains(event.table_id) {
            if let Some(catalog) = &self.catalog {
                match catalog.describe(event.table_id) {
                    Ok(identity) => {
                        self.store.register(identity);
                        self.stats.resolved += 1;
                    }
                    Err(e) => debug!(
                        table_id = event.table_id.0,
                        error = %e,
                        "could not resolve table, capacity unknown"
                    ),
                }
            }
        }

        let outcome = self.store.apply(&event);
        self.stats.count(outcome);
        debug!(
            table_id = event.table_id.0,
            table = %event.table_name,
            kind = event.kind.as_str(),
            pid = event.owner_pid,
            key = event.key_u32(),
            key_size = event.key_size,
            value = event.value_u32(),
            value_size = event.value_size,
            outcome = outcome.as_str(),
            "mutation event"
        );
        Ok(Step::Applied(outcome))
    }

    /// Drain until the source closes or shutdown is triggered.
    pub fn run(&mut self, shutdown: &Shutdown) -> tc_common::Result<ConsumerStats> {
        while !shutdown.is_triggered() {
            if self.step()? == Step::Closed {
                break;
            }
        }
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::memory::MemoryCatalog;
    use crate::publish::{LabelMode, MemorySink, Publisher, Strategy};
    use crate::replica::ReplicaOptions;
    use crate::stream::decode::{MutationEvent, MutationKind, RECORD_LEN};
    use crate::stream::source::ChannelSource;
    use std::sync::mpsc;
    use tc_common::{TableId, TableIdentity, TableName};

    fn store() -> Arc<ShadowReplicaStore> {
        let sink = Arc::new(MemorySink::new());
        let publisher = Publisher::sole(sink, LabelMode::Id, Strategy::Replica);
        Arc::new(ShadowReplicaStore::new(publisher, ReplicaOptions::default()))
    }

    fn record(id: u32, kind: MutationKind, key: u32) -> Vec<u8> {
        MutationEvent {
            table_id: TableId(id),
            table_name: TableName::new("t"),
            kind,
            owner_pid: 10,
            key_size: 4,
            value_size: 4,
            key_bytes: key.to_le_bytes(),
            value_bytes: [1, 0, 0, 0],
        }
        .to_record()
        .to_vec()
    }

    #[test]
    fn test_drains_until_closed() {
        let (tx, rx) = mpsc::channel();
        tx.send(record(1, MutationKind::Insert, 1)).unwrap();
        tx.send(record(1, MutationKind::Insert, 1)).unwrap();
        tx.send(record(1, MutationKind::Remove, 2)).unwrap();
        drop(tx);

        let store = store();
        let mut consumer = EventConsumer::new(ChannelSource::new(rx), store.clone());
        let stats = consumer.run(&Shutdown::new()).unwrap();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.remove_of_absent, 1);
        assert_eq!(store.read(TableId(1)).unwrap().cardinality, 1);
    }

    #[test]
    fn test_short_record_is_fatal() {
        let (tx, rx) = mpsc::channel();
        tx.send(vec![0u8; RECORD_LEN - 4]).unwrap();
        let mut consumer = EventConsumer::new(ChannelSource::new(rx), store());
        let err = consumer.step().unwrap_err();
        assert_eq!(err.code(), 20);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_catalog_resolves_first_seen_table() {
        let (tx, rx) = mpsc::channel();
        tx.send(record(8, MutationKind::Insert, 1)).unwrap();
        drop(tx);
        let catalog = MemoryCatalog::new().with_table(
            TableIdentity::partial(TableId(8), TableName::new("t"))
                .with_capacity(4)
                .with_key_size(4),
        );
        let store = store();
        let mut consumer =
            EventConsumer::new(ChannelSource::new(rx), store.clone()).with_catalog(Arc::new(catalog));
        consumer.run(&Shutdown::new()).unwrap();
        assert_eq!(consumer.stats().resolved, 1);
        assert_eq!(store.read(TableId(8)).unwrap().pressure, 0.25);
    }

    #[test]
    fn test_idle_source_does_not_apply() {
        let (_tx, rx) = mpsc::channel::<Vec<u8>>();
        let source = ChannelSource::new(rx).with_poll_interval(std::time::Duration::from_millis(1));
        let mut consumer = EventConsumer::new(source, store());
        assert_eq!(consumer.step().unwrap(), Step::Idle);
    }
}

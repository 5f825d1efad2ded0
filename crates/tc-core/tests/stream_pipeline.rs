//! Byte stream to replica: framed records read from a file or pipe,
//! decoded and applied in order.

use std::io::Cursor;
use std::sync::Arc;

use tc_common::{TableId, TableIdentity, TableName};
use tc_core::kernel::memory::MemoryCatalog;
use tc_core::publish::{CensusField, LabelMode, MemorySink, Publisher, Strategy};
use tc_core::replica::{ReplicaOptions, ReplicaPhase, ShadowReplicaStore};
use tc_core::shutdown::Shutdown;
use tc_core::stream::{EventConsumer, MutationEvent, MutationKind, ReaderSource, RECORD_LEN};

fn record(table: u32, name: &str, kind: MutationKind, key: u32) -> [u8; RECORD_LEN] {
    MutationEvent {
        table_id: TableId(table),
        table_name: TableName::new(name),
        kind,
        owner_pid: 100,
        key_size: 4,
        value_size: 8,
        key_bytes: key.to_le_bytes(),
        value_bytes: [9, 0, 0, 0],
    }
    .to_record()
}

fn store(options: ReplicaOptions) -> (Arc<ShadowReplicaStore>, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let publisher = Publisher::sole(sink.clone(), LabelMode::Name, Strategy::Replica);
    (Arc::new(ShadowReplicaStore::new(publisher, options)), sink)
}

#[test]
fn drains_stream_in_order() {
    let mut bytes = Vec::new();
    for key in [1, 2, 3] {
        bytes.extend_from_slice(&record(11, "sessions", MutationKind::Insert, key));
    }
    bytes.extend_from_slice(&record(11, "sessions", MutationKind::Remove, 2));
    bytes.extend_from_slice(&record(11, "sessions", MutationKind::Remove, 2));
    bytes.extend_from_slice(&record(12, "routes", MutationKind::Insert, 7));

    let (store, sink) = store(ReplicaOptions { track_members: true });
    let mut consumer = EventConsumer::new(ReaderSource::new(Cursor::new(bytes)), store.clone());
    let stats = consumer.run(&Shutdown::new()).unwrap();

    assert_eq!(stats.records, 6);
    assert_eq!(stats.inserted, 4);
    assert_eq!(stats.removed, 1);
    assert_eq!(stats.remove_of_absent, 1);

    let sessions = store.read(TableId(11)).unwrap();
    assert_eq!(sessions.cardinality, 2);
    assert_eq!(sessions.phase, ReplicaPhase::Live);
    let members: Vec<String> = sessions
        .members
        .unwrap()
        .iter()
        .map(|k| k.to_string())
        .collect();
    assert_eq!(members, vec!["0x01000000", "0x03000000"]);

    assert_eq!(sink.get("sessions", CensusField::ItemCount), Some(2.0));
    assert_eq!(sink.get("routes", CensusField::ItemCount), Some(1.0));
    assert_eq!(sink.counter("event.remove_of_absent"), 1);
}

#[test]
fn truncated_tail_is_a_protocol_error() {
    let mut bytes = record(1, "t", MutationKind::Insert, 1).to_vec();
    bytes.extend_from_slice(&[0u8; 10]);

    let (store, _) = store(ReplicaOptions::default());
    let mut consumer = EventConsumer::new(ReaderSource::new(Cursor::new(bytes)), store.clone());
    let err = consumer.run(&Shutdown::new()).unwrap_err();

    assert_eq!(err.code(), 20);
    assert!(err.is_fatal());
    // The complete record before the tail was applied.
    assert_eq!(store.read(TableId(1)).unwrap().cardinality, 1);
}

#[test]
fn unknown_kind_is_a_protocol_error() {
    let mut bytes = record(1, "t", MutationKind::Insert, 1);
    bytes[20..24].copy_from_slice(&7i32.to_le_bytes());

    let (store, _) = store(ReplicaOptions::default());
    let mut consumer = EventConsumer::new(ReaderSource::new(Cursor::new(bytes.to_vec())), store);
    assert_eq!(consumer.run(&Shutdown::new()).unwrap_err().code(), 20);
}

#[test]
fn padded_stride_from_forwarder() {
    let mut bytes = Vec::new();
    for key in [5, 6] {
        bytes.extend_from_slice(&record(3, "padded", MutationKind::Insert, key));
        bytes.extend_from_slice(&[0u8; 4]);
    }

    let (store, _) = store(ReplicaOptions::default());
    let source = ReaderSource::with_record_len(Cursor::new(bytes), RECORD_LEN + 4);
    let mut consumer = EventConsumer::new(source, store.clone());
    consumer.run(&Shutdown::new()).unwrap();
    assert_eq!(store.read(TableId(3)).unwrap().cardinality, 2);
}

#[test]
fn catalog_fills_in_capacity() {
    let bytes = record(21, "lookup", MutationKind::Insert, 1).to_vec();
    let catalog = MemoryCatalog::new().with_table(
        TableIdentity::partial(TableId(21), TableName::new("lookup"))
            .with_capacity(4)
            .with_key_size(4)
            .with_value_size(8),
    );

    let (store, sink) = store(ReplicaOptions::default());
    let mut consumer = EventConsumer::new(ReaderSource::new(Cursor::new(bytes)), store.clone())
        .with_catalog(Arc::new(catalog));
    let stats = consumer.run(&Shutdown::new()).unwrap();

    assert_eq!(stats.resolved, 1);
    assert_eq!(store.read(TableId(21)).unwrap().pressure, 0.25);
    assert_eq!(sink.get("lookup", CensusField::Capacity), Some(4.0));
}

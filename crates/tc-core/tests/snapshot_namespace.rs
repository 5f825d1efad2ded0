//! Startup snapshot over a directory tree standing in for a bpffs mount.

use std::path::Path;
use std::sync::Arc;

use tc_common::{TableId, TableIdentity, TableName};
use tc_core::kernel::memory::{MemoryOpener, MemoryTable};
use tc_core::publish::{CensusField, LabelMode, MemorySink, Publisher, Strategy};
use tc_core::replica::{ReplicaOptions, ReplicaPhase, ShadowReplicaStore};
use tc_core::snapshot::{SnapshotLoader, SnapshotReport};
use tc_core::stream::{MutationEvent, MutationKind};

fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, b"").unwrap();
}

fn table(id: u32, name: &str, capacity: u32) -> MemoryTable {
    MemoryTable::new(
        TableIdentity::partial(TableId(id), TableName::new(name))
            .with_capacity(capacity)
            .with_key_size(4)
            .with_value_size(4),
    )
}

fn store() -> (ShadowReplicaStore, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let publisher = Publisher::sole(sink.clone(), LabelMode::Id, Strategy::Replica);
    (ShadowReplicaStore::new(publisher, ReplicaOptions::default()), sink)
}

#[test]
fn walks_namespace_and_seeds_tables() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let flows = root.join("net/flows");
    let flows_again = root.join("shared/flows");
    let prog = root.join("progs/xdp_main");
    let broken = root.join("net/broken");
    for path in [&flows, &flows_again, &prog, &broken] {
        touch(path);
    }

    let opener = MemoryOpener::new()
        .pin(
            &flows,
            table(1, "flows", 100)
                .with_entry(1u32.to_le_bytes(), 1u32.to_le_bytes())
                .with_entry(2u32.to_le_bytes(), 0u32.to_le_bytes())
                .with_entry(3u32.to_le_bytes(), 2u32.to_le_bytes()),
        )
        .pin(&flows_again, table(1, "flows", 100))
        .pin(&broken, table(2, "broken", 10).failing());

    let (store, sink) = store();
    let mut report = SnapshotReport::default();
    SnapshotLoader::new(Arc::new(opener)).load_namespace(root, &store, &mut report);

    assert_eq!(report.tables_seeded(), 1);
    assert_eq!(report.seeded[0].cardinality, 2);
    assert_eq!(report.seeded[0].path.as_deref(), Some(flows.as_path()));
    assert_eq!(report.entries_read, 3);
    assert_eq!(report.zero_valued_skipped, 1);

    let skipped: Vec<&Path> = report.skipped.iter().map(|s| s.path.as_path()).collect();
    assert!(skipped.contains(&prog.as_path()));
    assert!(skipped.contains(&broken.as_path()));

    assert_eq!(store.read(TableId(1)).unwrap().phase, ReplicaPhase::Seeded);
    assert!(store.read(TableId(2)).is_none());
    assert_eq!(sink.get("1", CensusField::ItemCount), Some(2.0));
    assert_eq!(sink.get("1", CensusField::Pressure), Some(0.02));
    assert_eq!(sink.get("2", CensusField::ItemCount), None);
}

#[test]
fn events_continue_from_the_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let pinned = dir.path().join("counters");
    touch(&pinned);
    let opener = MemoryOpener::new().pin(
        &pinned,
        table(5, "counters", 8).with_entry(1u32.to_le_bytes(), 1u32.to_le_bytes()),
    );

    let (store, _) = store();
    let mut report = SnapshotReport::default();
    SnapshotLoader::new(Arc::new(opener)).load_paths(&[pinned], &store, &mut report);

    let remove = MutationEvent {
        table_id: TableId(5),
        table_name: TableName::new("counters"),
        kind: MutationKind::Remove,
        owner_pid: 1,
        key_size: 4,
        value_size: 4,
        key_bytes: 1u32.to_le_bytes(),
        value_bytes: [0; 4],
    };
    store.apply(&remove);

    let census = store.read(TableId(5)).unwrap();
    assert_eq!(census.cardinality, 0);
    assert_eq!(census.phase, ReplicaPhase::Live);
}

#[test]
fn missing_root_is_skipped_not_fatal() {
    let (store, _) = store();
    let mut report = SnapshotReport::default();
    SnapshotLoader::new(Arc::new(MemoryOpener::new())).load_namespace(
        Path::new("/nonexistent/bpffs/root"),
        &store,
        &mut report,
    );
    assert_eq!(report.tables_seeded(), 0);
    assert_eq!(report.skipped.len(), 1);
    assert!(store.tables().is_empty());
}

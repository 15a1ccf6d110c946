//! Partition integration tests
//!
//! End-to-end behaviour of create / append / commit / read / reopen,
//! including the failure paths: commits that hit storage faults, writers
//! that cannot open, and reopen over damaged files.

use futures::TryStreamExt;
use std::sync::Arc;
use tsdb_partition::buggify::{self, FaultConfig};
use tsdb_partition::io::SimulatedRng;
use tsdb_partition::storage::{SimulatedObjectStore, SimulatedStoreConfig};
use tsdb_partition::{
    FieldType, InMemoryObjectStore, LocalFsObjectStore, Partition, PartitionError, PartitionMap,
    PartitionOptions, Record, Schema, Sha1Digest, Table, TableConfig, TimeRange,
};

const PATH: &str = "partitions";

fn table() -> Arc<Table> {
    Arc::new(Table::new(
        "telemetry",
        "cpu",
        Schema::new(1)
            .required_field("host", FieldType::String)
            .field("usage", FieldType::Float),
        TableConfig::default(),
    ))
}

fn hash(name: &str) -> Sha1Digest {
    Sha1Digest::of(name.as_bytes())
}

fn record(time: u64) -> Record {
    Record::new(time)
        .with("host", format!("host-{}", time % 3))
        .with("usage", time as f64 / 10.0)
}

fn small_files() -> PartitionOptions {
    let mut options = PartitionOptions::default();
    options.writer.max_records_per_file = 4;
    options
}

// =============================================================================
// Round trip
// =============================================================================

#[tokio::test]
async fn test_create_append_commit_reopen() {
    let store = InMemoryObjectStore::new();
    let partition = Partition::create(store.clone(), table(), hash("a"), PATH, small_files())
        .await
        .unwrap();

    let writer = partition.get_writer().await.unwrap();
    for t in 0..10 {
        writer.append(record(t)).unwrap();
    }
    let committed = writer.commit().await.unwrap();
    assert_eq!(committed.record_count(), 10);
    assert_eq!(committed.files().len(), 3);

    drop(writer);
    drop(partition);

    let reopened = Partition::reopen(store, table(), hash("a"), PATH, small_files())
        .await
        .unwrap();
    let snapshot = reopened.get_snapshot();
    assert_eq!(snapshot.manifest(), committed.manifest());

    let records = reopened.get_reader().collect_all().await.unwrap();
    assert_eq!(records, (0..10).map(record).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_local_fs_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalFsObjectStore::new(dir.path());

    let partition = Partition::create(store.clone(), table(), hash("fs"), PATH, small_files())
        .await
        .unwrap();
    let writer = partition.get_writer().await.unwrap();
    writer.append_all((100..106).map(record)).unwrap();
    writer.commit().await.unwrap();

    let reopened = Partition::reopen(
        LocalFsObjectStore::new(dir.path()),
        table(),
        hash("fs"),
        PATH,
        PartitionOptions {
            verify_on_reopen: true,
            ..small_files()
        },
    )
    .await
    .unwrap();

    let records = reopened.get_reader().collect_all().await.unwrap();
    assert_eq!(records.len(), 6);
    assert_eq!(records[0], record(100));
    assert!(dir.path().join(reopened.layout().manifest()).exists());
}

#[tokio::test]
async fn test_time_range_query() {
    let partition = Partition::create(InMemoryObjectStore::new(), table(), hash("range"), PATH, small_files())
        .await
        .unwrap();
    let writer = partition.get_writer().await.unwrap();
    writer.append_all((0..20).map(|i| record(i * 10))).unwrap();
    writer.commit().await.unwrap();

    let reader = partition.get_reader();
    let hits: Vec<Record> = reader
        .get_records(TimeRange::new(50, 120))
        .try_collect()
        .await
        .unwrap();
    let times: Vec<u64> = hits.iter().map(|r| r.time).collect();
    assert_eq!(times, vec![50, 60, 70, 80, 90, 100, 110]);

    let none: Vec<Record> = reader
        .get_records(TimeRange::new(1_000, 2_000))
        .try_collect()
        .await
        .unwrap();
    assert!(none.is_empty());
}

// =============================================================================
// Snapshot isolation and append-only growth
// =============================================================================

#[tokio::test]
async fn test_reader_keeps_its_snapshot() {
    let partition = Partition::create(InMemoryObjectStore::new(), table(), hash("iso"), PATH, small_files())
        .await
        .unwrap();
    let writer = partition.get_writer().await.unwrap();
    writer.append_all((0..3).map(record)).unwrap();
    writer.commit().await.unwrap();

    let before = partition.get_reader();
    writer.append_all((3..8).map(record)).unwrap();
    writer.commit().await.unwrap();

    assert_eq!(before.count(), 3);
    assert_eq!(before.collect_all().await.unwrap().len(), 3);
    assert_eq!(partition.get_reader().collect_all().await.unwrap().len(), 8);
}

#[tokio::test]
async fn test_snapshots_only_grow() {
    let partition = Partition::create(InMemoryObjectStore::new(), table(), hash("grow"), PATH, small_files())
        .await
        .unwrap();
    let writer = partition.get_writer().await.unwrap();

    let mut previous = partition.get_snapshot();
    for round in 0..5u64 {
        writer.append_all((round * 10..round * 10 + 5).map(record)).unwrap();
        let next = writer.commit().await.unwrap();
        assert!(next.is_superset_of(&previous));
        assert_eq!(next.sequence(), previous.sequence() + 1);
        previous = next;
    }
    assert_eq!(previous.record_count(), 25);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_writer_across_tasks() {
    let partition = Arc::new(
        Partition::create(InMemoryObjectStore::new(), table(), hash("mt"), PATH, small_files())
            .await
            .unwrap(),
    );

    let mut handles = Vec::new();
    for task in 0..8u64 {
        let partition = partition.clone();
        handles.push(tokio::spawn(async move {
            let writer = partition.get_writer().await.unwrap();
            for i in 0..25 {
                writer.append(record(task * 1_000 + i)).unwrap();
            }
            writer.commit().await.unwrap();
            writer
        }));
    }

    let mut writers = Vec::new();
    for handle in handles {
        writers.push(handle.await.unwrap());
    }
    for w in &writers[1..] {
        assert!(Arc::ptr_eq(&writers[0], w));
    }

    let head = partition.get_snapshot();
    assert_eq!(head.record_count(), 200);
    assert_eq!(partition.get_reader().collect_all().await.unwrap().len(), 200);
    let ids: Vec<u64> = head.files().iter().map(|f| f.id).collect();
    assert_eq!(ids, (1..=ids.len() as u64).collect::<Vec<_>>());
}

// =============================================================================
// Failure paths
// =============================================================================

#[tokio::test]
async fn test_failed_commit_is_invisible() {
    buggify::set_config(FaultConfig::new());
    let inner = InMemoryObjectStore::new();
    let store = SimulatedObjectStore::new(inner.clone(), SimulatedRng::new(3), SimulatedStoreConfig::no_faults());

    let partition = Partition::create(store.clone(), table(), hash("atomic"), PATH, small_files())
        .await
        .unwrap();
    let writer = partition.get_writer().await.unwrap();
    writer.append_all((0..6).map(record)).unwrap();
    let first = writer.commit().await.unwrap();

    writer.append_all((6..12).map(record)).unwrap();
    store.set_config(SimulatedStoreConfig::writes_fail());
    let err = writer.commit().await.unwrap_err();
    assert!(matches!(err, PartitionError::CommitIo(_)));
    assert!(Arc::ptr_eq(&first, &partition.get_snapshot()));
    assert_eq!(writer.buffered_len(), 6);

    // Durable state still matches the last successful commit
    let reopened = Partition::reopen(inner.clone(), table(), hash("atomic"), PATH, small_files())
        .await
        .unwrap();
    assert_eq!(reopened.get_snapshot().manifest(), first.manifest());

    store.set_config(SimulatedStoreConfig::no_faults());
    let healed = writer.commit().await.unwrap();
    assert_eq!(healed.record_count(), 12);
    assert_eq!(healed.next_file_id(), first.next_file_id() + 2);
}

#[tokio::test]
async fn test_schema_mismatch_rejects_record_only() {
    let partition = Partition::create(InMemoryObjectStore::new(), table(), hash("schema"), PATH, small_files())
        .await
        .unwrap();
    let writer = partition.get_writer().await.unwrap();
    writer.append(record(1)).unwrap();

    let err = writer.append(Record::new(2).with("usage", 1.0)).unwrap_err();
    assert!(matches!(err, PartitionError::SchemaMismatch { schema_version: 1, .. }));
    let err = writer
        .append(Record::new(3).with("host", "h").with("usage", "high"))
        .unwrap_err();
    assert!(matches!(err, PartitionError::SchemaMismatch { .. }));

    assert_eq!(writer.buffered_len(), 1);
    assert_eq!(writer.commit().await.unwrap().record_count(), 1);
}

#[tokio::test]
async fn test_writer_unavailable_then_retry() {
    buggify::set_config(FaultConfig::new());
    let store = SimulatedObjectStore::new(
        InMemoryObjectStore::new(),
        SimulatedRng::new(9),
        SimulatedStoreConfig::no_faults(),
    );
    let partition = Partition::create(store.clone(), table(), hash("probe"), PATH, small_files())
        .await
        .unwrap();

    store.set_config(SimulatedStoreConfig::writes_fail());
    let err = partition.get_writer().await.unwrap_err();
    assert!(matches!(err, PartitionError::WriterUnavailable(_)));
    assert!(err.is_retryable());

    store.set_config(SimulatedStoreConfig::no_faults());
    let writer = partition.get_writer().await.unwrap();
    assert!(Arc::ptr_eq(&writer, &partition.get_writer().await.unwrap()));
}

#[tokio::test]
async fn test_create_twice_fails() {
    let store = InMemoryObjectStore::new();
    Partition::create(store.clone(), table(), hash("dup"), PATH, PartitionOptions::default())
        .await
        .unwrap();
    let err = Partition::create(store, table(), hash("dup"), PATH, PartitionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PartitionError::StorageInit { .. }));
}

#[tokio::test]
async fn test_reopen_with_missing_file_is_corrupt() {
    let store = InMemoryObjectStore::new();
    let partition = Partition::create(store.clone(), table(), hash("lost"), PATH, small_files())
        .await
        .unwrap();
    let writer = partition.get_writer().await.unwrap();
    writer.append_all((0..8).map(record)).unwrap();
    let snapshot = writer.commit().await.unwrap();

    assert!(store.remove(&snapshot.files()[1].path));
    let err = Partition::reopen(store, table(), hash("lost"), PATH, small_files())
        .await
        .unwrap_err();
    assert!(matches!(err, PartitionError::CorruptState { .. }));
}

#[tokio::test]
async fn test_reopen_with_garbage_manifest_is_corrupt() {
    let store = InMemoryObjectStore::new();
    let partition = Partition::create(store.clone(), table(), hash("junk"), PATH, small_files())
        .await
        .unwrap();
    let manifest_key = partition.layout().manifest();
    assert!(store.corrupt(&manifest_key, |data| data.truncate(data.len() / 2)));

    let err = Partition::reopen(store, table(), hash("junk"), PATH, small_files())
        .await
        .unwrap_err();
    assert!(matches!(err, PartitionError::CorruptState { .. }));
}

#[tokio::test]
async fn test_reader_reports_damaged_file() {
    let store = InMemoryObjectStore::new();
    let partition = Partition::create(store.clone(), table(), hash("rot"), PATH, small_files())
        .await
        .unwrap();
    let writer = partition.get_writer().await.unwrap();
    writer.append_all((0..8).map(record)).unwrap();
    let snapshot = writer.commit().await.unwrap();

    let last = &snapshot.files()[1];
    store.corrupt(&last.path, |data| {
        let mid = data.len() / 2;
        data[mid] ^= 0x5A;
    });

    let mut stream = partition.get_reader().scan();
    let mut ok = 0;
    let mut failed = None;
    while let Some(item) = stream.try_next().await.transpose() {
        match item {
            Ok(_) => ok += 1,
            Err(e) => failed = Some(e),
        }
    }
    assert_eq!(ok, 4);
    assert!(matches!(failed, Some(PartitionError::CorruptState { .. })));
}

// =============================================================================
// Partition map
// =============================================================================

#[tokio::test]
async fn test_map_resolves_one_instance() {
    let map = PartitionMap::new(InMemoryObjectStore::new(), PATH, small_files());
    let t = table();

    let a = map.resolve_for_time(&t, 1_000).await.unwrap();
    let b = map.resolve_for_time(&t, 2_000).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(map.len(), 1);

    let far = map
        .resolve_for_time(&t, t.config().partition_window_us * 5)
        .await
        .unwrap();
    assert_ne!(far.key(), a.key());
    assert_eq!(map.len(), 2);
}

#[tokio::test]
async fn test_map_recovers_and_quarantines() {
    let store = InMemoryObjectStore::new();
    let t = table();

    {
        let map = PartitionMap::new(store.clone(), PATH, small_files());
        for name in ["p1", "p2", "p3"] {
            let p = map.resolve(&t, hash(name)).await.unwrap();
            let writer = p.get_writer().await.unwrap();
            writer.append_all((0..5).map(record)).unwrap();
            writer.commit().await.unwrap();
        }
    }

    // Damage one partition's data
    let damaged = PartitionMap::new(store.clone(), PATH, small_files());
    let victim = damaged.resolve(&t, hash("p2")).await.unwrap();
    let file = victim.get_snapshot().files()[0].path.clone();
    drop(victim);
    drop(damaged);
    store.remove(&file);

    let map = PartitionMap::new(store, PATH, small_files());
    let report = map.recover(&t).await.unwrap();
    assert_eq!(report.opened.len(), 2);
    assert_eq!(report.quarantined.len(), 1);
    assert!(matches!(
        report.quarantined[0].error,
        PartitionError::CorruptState { .. }
    ));
    for p in &report.opened {
        assert_eq!(p.get_info().record_count, 5);
    }
    assert_eq!(map.len(), 2);
}

//! Hot path benchmarks for profiling-driven optimization.
//!
//! Run with: `cargo bench --bench hot_paths`
//! Compare baselines: `cargo bench --bench hot_paths -- --baseline main`
//!
//! The write path (validate + buffer, segment encode, commit) and the read
//! path (segment decode, full scan) dominate partition throughput.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tsdb_partition::storage::{Compression, SegmentReader, SegmentWriter};
use tsdb_partition::{
    FieldType, InMemoryObjectStore, Partition, PartitionKey, PartitionOptions, Record, Schema,
    Sha1Digest, Table, TableConfig,
};

fn table() -> Arc<Table> {
    Arc::new(Table::new(
        "bench",
        "cpu",
        Schema::new(1)
            .required_field("host", FieldType::String)
            .field("usage", FieldType::Float)
            .field("cores", FieldType::UInt),
        TableConfig::default(),
    ))
}

fn record(i: u64) -> Record {
    Record::new(1_700_000_000_000_000 + i)
        .with("host", format!("host-{}", i % 16))
        .with("usage", (i % 100) as f64 / 100.0)
        .with("cores", 8u64)
}

async fn partition(name: &str) -> Partition<InMemoryObjectStore> {
    let mut options = PartitionOptions::default();
    options.writer.verify_writes = false;
    match Partition::create(
        InMemoryObjectStore::new(),
        table(),
        Sha1Digest::of(name.as_bytes()),
        "bench",
        options,
    )
    .await
    {
        Ok(p) => p,
        Err(e) => panic!("create failed: {}", e),
    }
}

/// Schema validation + buffering of a single record
fn bench_append(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let p = rt.block_on(partition("append"));
    let writer = rt.block_on(p.get_writer()).unwrap();

    let mut group = c.benchmark_group("append");
    group.throughput(Throughput::Elements(1));
    let mut i = 0u64;
    group.bench_function("validated", |b| {
        b.iter(|| {
            i += 1;
            writer.append(black_box(record(i))).unwrap();
        })
    });
    group.finish();
}

/// Segment encode for different batch sizes
fn bench_segment_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_encode");

    for count in [100u64, 1_000, 10_000] {
        let records: Vec<Record> = (0..count).map(record).collect();
        group.throughput(Throughput::Elements(count));
        group.bench_function(format!("records_{}", count), |b| {
            b.iter(|| {
                let mut writer = SegmentWriter::new(Compression::None);
                for r in &records {
                    writer.write_record(r).unwrap();
                }
                black_box(writer.finish().unwrap())
            })
        });
    }
    group.finish();
}

fn bench_segment_decode(c: &mut Criterion) {
    let mut writer = SegmentWriter::new(Compression::None);
    for i in 0..1_000 {
        writer.write_record(&record(i)).unwrap();
    }
    let encoded = writer.finish().unwrap();

    let mut group = c.benchmark_group("segment_decode");
    group.throughput(Throughput::Elements(1_000));
    group.bench_function("records_1000", |b| {
        b.iter(|| {
            let reader = SegmentReader::open(black_box(&encoded.bytes)).unwrap();
            black_box(reader.read_all().unwrap())
        })
    });
    group.finish();
}

/// Full commit: encode, put, manifest rewrite, head swap
fn bench_commit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("commit");

    for batch in [10u64, 1_000] {
        group.throughput(Throughput::Elements(batch));
        group.bench_function(format!("batch_{}", batch), |b| {
            let p = rt.block_on(partition(&format!("commit-{}", batch)));
            let writer = rt.block_on(p.get_writer()).unwrap();
            b.iter_batched(
                || {
                    writer.append_all((0..batch).map(record)).unwrap();
                },
                |_| rt.block_on(writer.commit()).unwrap(),
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let p = rt.block_on(async {
        let p = partition("scan").await;
        let writer = p.get_writer().await.unwrap();
        writer.append_all((0..20_000).map(record)).unwrap();
        writer.commit().await.unwrap();
        p
    });

    let mut group = c.benchmark_group("scan");
    group.throughput(Throughput::Elements(20_000));
    group.bench_function("records_20000", |b| {
        b.iter(|| black_box(rt.block_on(p.get_reader().collect_all()).unwrap()))
    });
    group.finish();
}

/// Partition identity hashing
fn bench_partition_uuid(c: &mut Criterion) {
    let key = PartitionKey::from_key_value("bench", "cpu", b"2024-01-01T00");
    c.bench_function("partition_uuid", |b| b.iter(|| black_box(&key).uuid()));
}

criterion_group!(
    benches,
    bench_append,
    bench_segment_encode,
    bench_segment_decode,
    bench_commit,
    bench_scan,
    bench_partition_uuid,
);
criterion_main!(benches);

//! Benchmarks for the aggregation engine
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tempfile::tempdir;
use tsagg::query::{BucketUnit, QueryConfig, QueryDescriptor, QueryOptions, ScanPreference};
use tsagg::storage::*;

const HOSTS: usize = 10;

/// One point per host every 10 seconds
fn create_test_points(count: usize) -> Vec<Point> {
    (0..count)
        .map(|i| {
            Point::new("cpu", (i / HOSTS) as i64 * 10_000)
                .tag("hostname", format!("host_{}", i % HOSTS))
                .field("usage_user", (i % 100) as f64)
                .field("usage_system", (i % 37) as f64)
        })
        .collect()
}

fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("compression");

    for size in [1000, 10000] {
        let points = create_test_points(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("compress_{}", size), |b| {
            b.iter(|| compress_block(black_box(&points)).unwrap())
        });

        let compressed = compress_block(&points).unwrap();
        group.bench_function(format!("decompress_{}", size), |b| {
            b.iter(|| decompress_block(black_box(&compressed)).unwrap())
        });
    }

    group.finish();
}

fn bench_wal(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal");

    group.bench_function("append_single", |b| {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(dir.path().join("bench.wal"), WalSyncMode::None).unwrap();
        let record = WalRecord {
            offset: 0,
            point: create_test_points(1).remove(0),
        };

        b.iter(|| wal.append(black_box(&record)).unwrap());
    });

    group.finish();
}

fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");
    let points = create_test_points(10_000);
    group.throughput(Throughput::Elements(points.len() as u64));

    group.bench_function("in_memory_batch_10000", |b| {
        b.iter(|| {
            let engine = StorageEngine::in_memory();
            engine.ingest_batch(black_box(points.clone())).unwrap()
        })
    });

    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");

    let engine = StorageEngine::in_memory();
    engine.ingest_batch(create_test_points(100_000)).unwrap();
    let executor = engine.executor(QueryConfig::default());

    // One host over the whole range, per-minute max
    let selective = QueryDescriptor::builder("cpu")
        .tag_eq("hostname", "host_0")
        .time_range(0, 100_000_000)
        .bucket(BucketUnit::Minute)
        .max("usage_user")
        .build();

    for scan in [ScanPreference::Index, ScanPreference::Full] {
        let options = QueryOptions::default().scan(scan);
        group.bench_function(format!("one_host_minute_max_{:?}", scan), |b| {
            b.iter(|| executor.execute_with(black_box(&selective), &options).unwrap())
        });
    }

    let broad = QueryDescriptor::builder("cpu")
        .tag_in("hostname", (0..HOSTS / 2).map(|h| format!("host_{}", h)))
        .bucket(BucketUnit::Hour)
        .max("usage_user")
        .min("usage_system")
        .count("usage_user")
        .build();

    group.bench_function("half_hosts_hourly_auto", |b| {
        b.iter(|| executor.execute(black_box(&broad)).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_compression, bench_wal, bench_ingest, bench_query);
criterion_main!(benches);

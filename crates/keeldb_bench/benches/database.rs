//! Table-level benchmarks: writes, reads, deletes and scans.

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use keeldb_bench::utils::{generate_pairs, key, populate, random_data};
use keeldb_core::{Config, Database};
use rand::Rng;
use std::ops::Bound;

/// Benchmark single implicit writes against an in-memory database.
fn bench_single_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_write");

    for size in [64, 256, 1024, 4096, 16_384].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let db = Database::open_in_memory().unwrap();
            let table = db.table("bench").unwrap();
            let data = random_data(size);
            let mut i = 0usize;

            b.iter(|| {
                table.write(&key(i), black_box(&data)).unwrap();
                i += 1;
            });
        });
    }
    group.finish();
}

/// Benchmark durable writes on a real file, with and without fsync per commit.
fn bench_file_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_write");
    group.sample_size(20);

    for sync in [true, false] {
        let label = if sync { "sync" } else { "nosync" };
        group.bench_function(label, |b| {
            let dir = tempfile::tempdir().unwrap();
            let db = Database::open_with_config(
                dir.path(),
                Config::default().sync_on_commit(sync),
            )
            .unwrap();
            let table = db.table("bench").unwrap();
            let data = random_data(256);
            let mut i = 0usize;

            b.iter(|| {
                table.write(&key(i), black_box(&data)).unwrap();
                i += 1;
            });
            db.close().unwrap();
        });
    }
    group.finish();
}

/// Benchmark multi-key transactions.
fn bench_batch_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_write");

    for batch_size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                let db = Database::open_in_memory().unwrap();
                let table = db.table("bench").unwrap();
                let pairs = generate_pairs(batch_size, 256);

                b.iter(|| {
                    db.transaction(|txn| {
                        for (k, v) in &pairs {
                            txn.put(table.tag(), k, black_box(v))?;
                        }
                        Ok(())
                    })
                    .unwrap();
                });
            },
        );
    }
    group.finish();
}

/// Benchmark point reads from a populated table.
fn bench_read_populated(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_populated");

    for count in [100, 1000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let db = Database::open_in_memory().unwrap();
            let table = populate(&db, "bench", count, 256);
            let mut rng = rand::thread_rng();

            b.iter(|| {
                let k = key(rng.gen_range(0..count));
                black_box(table.read(black_box(&k)).unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark reads of values that spill into overflow chains.
fn bench_read_large(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_large");

    for size in [8 * 1024, 64 * 1024, 512 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let db = Database::open_in_memory().unwrap();
            let table = db.table("bench").unwrap();
            table.write(b"large", &random_data(size)).unwrap();

            b.iter(|| black_box(table.read(b"large").unwrap()));
        });
    }
    group.finish();
}

/// Benchmark deleting present keys.
fn bench_delete(c: &mut Criterion) {
    c.bench_function("delete", |b| {
        let db = Database::open_in_memory().unwrap();
        let table = db.table("bench").unwrap();
        let mut i = 0usize;

        b.iter_batched(
            || {
                let k = key(i);
                i += 1;
                table.write(&k, &random_data(256)).unwrap();
                k
            },
            |k| assert!(table.delete(black_box(&k)).unwrap()),
            BatchSize::SmallInput,
        );
    });
}

/// Benchmark an ordered scan of the whole table.
fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");

    for count in [100, 1000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let db = Database::open_in_memory().unwrap();
            let table = populate(&db, "bench", count, 64);

            b.iter(|| {
                black_box(
                    table
                        .range(Bound::Unbounded, Bound::Unbounded)
                        .unwrap(),
                )
            });
        });
    }
    group.finish();
}

/// Benchmark an empty transaction.
fn bench_transaction_overhead(c: &mut Criterion) {
    c.bench_function("transaction_overhead", |b| {
        let db = Database::open_in_memory().unwrap();

        b.iter(|| {
            db.transaction(|_txn| Ok(())).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_single_write,
    bench_file_write,
    bench_batch_write,
    bench_read_populated,
    bench_read_large,
    bench_delete,
    bench_scan,
    bench_transaction_overhead,
);

criterion_main!(benches);

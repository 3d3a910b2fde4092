//! Benchmarks for the layers under the table API: block store and WAL.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use keeldb_bench::utils::{key, random_data};
use keeldb_core::block::{BlockStore, BLOCK_PAYLOAD};
use keeldb_core::wal::{Mutation, WalManager};
use keeldb_core::{TableTag, TransactionId};
use keeldb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use tempfile::TempDir;

fn file_backend(dir: &TempDir, name: &str) -> Box<dyn StorageBackend> {
    Box::new(FileBackend::open(&dir.path().join(name)).unwrap())
}

/// Benchmark writing a full block payload, reusing one allocated block.
fn bench_block_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_write");
    group.throughput(Throughput::Bytes(BLOCK_PAYLOAD as u64));

    group.bench_function("memory", |b| {
        let store = BlockStore::open(Box::new(InMemoryBackend::new()), None).unwrap();
        let id = store.allocate().unwrap();
        let payload = random_data(BLOCK_PAYLOAD);

        b.iter(|| store.write(id, black_box(&payload)).unwrap());
    });

    group.bench_function("file", |b| {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(file_backend(&dir, "blocks.bench"), None).unwrap();
        let id = store.allocate().unwrap();
        let payload = random_data(BLOCK_PAYLOAD);

        b.iter(|| store.write(id, black_box(&payload)).unwrap());
    });

    group.finish();
}

/// Benchmark checksummed block reads.
fn bench_block_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_read");
    group.throughput(Throughput::Bytes(BLOCK_PAYLOAD as u64));

    group.bench_function("memory", |b| {
        let store = BlockStore::open(Box::new(InMemoryBackend::new()), None).unwrap();
        let id = store.allocate().unwrap();
        store.write(id, &random_data(BLOCK_PAYLOAD)).unwrap();

        b.iter(|| black_box(store.read(black_box(id)).unwrap()));
    });

    group.finish();
}

/// Benchmark allocating fresh blocks, which grows the file.
fn bench_block_allocate(c: &mut Criterion) {
    c.bench_function("block_allocate", |b| {
        let store = BlockStore::open(Box::new(InMemoryBackend::new()), None).unwrap();
        b.iter(|| black_box(store.allocate().unwrap()));
    });
}

/// Benchmark WAL appends of one put, with and without an fsync per record.
fn bench_wal_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_append");
    group.sample_size(20);
    let table = TableTag::new("bench").unwrap();

    for size in [64, 1024, 16_384].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("memory", size), size, |b, &size| {
            let wal = WalManager::new(Box::new(InMemoryBackend::new()), false);
            let mutation = Mutation::put(table.clone(), key(0), random_data(size), 0);
            let mut txid = 0u64;

            b.iter(|| {
                txid += 1;
                wal.append(TransactionId::new(txid), std::slice::from_ref(&mutation))
                    .unwrap();
                wal.flush().unwrap();
            });
        });

        group.bench_with_input(BenchmarkId::new("file_sync", size), size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let wal = WalManager::new(file_backend(&dir, "wal.bench"), true);
            let mutation = Mutation::put(table.clone(), key(0), random_data(size), 0);
            let mut txid = 0u64;

            b.iter(|| {
                txid += 1;
                wal.append(TransactionId::new(txid), std::slice::from_ref(&mutation))
                    .unwrap();
                wal.flush().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_block_write,
    bench_block_read,
    bench_block_allocate,
    bench_wal_append,
);

criterion_main!(benches);

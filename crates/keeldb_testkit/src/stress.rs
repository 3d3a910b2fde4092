//! Stress helpers for keeldb.
//!
//! These verify behavior under load and under concurrent readers while the
//! single writer commits.

use keeldb_core::Database;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Reads that observed a partially applied transaction. Must be zero.
    pub inconsistent_reads: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            inconsistent_reads: 0,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {name} ===");
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Inconsistent reads: {}", self.inconsistent_reads);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent reader threads.
    pub threads: usize,
    /// Size of each value in bytes.
    pub value_size: usize,
    /// Number of distinct keys.
    pub key_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 2_000,
            threads: 4,
            value_size: 256,
            key_count: 500,
        }
    }
}

fn stress_key(i: usize) -> Vec<u8> {
    format!("stress-{i:06}").into_bytes()
}

/// Run a sequential write stress test.
pub fn stress_sequential_writes(db: &Database, config: &StressConfig) -> StressTestResult {
    let table = match db.table("stress") {
        Ok(t) => t,
        Err(_) => return StressTestResult::new(0, config.operations, Duration::ZERO),
    };
    let value = vec![0xABu8; config.value_size];

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;
    for i in 0..config.operations {
        match table.write(&stress_key(i % config.key_count.max(1)), &value) {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a sequential read stress test over keys written first.
pub fn stress_sequential_reads(db: &Database, config: &StressConfig) -> StressTestResult {
    let table = match db.table("stress") {
        Ok(t) => t,
        Err(_) => return StressTestResult::new(0, config.operations, Duration::ZERO),
    };
    let value = vec![0xCDu8; config.value_size];
    let keys = config.key_count.max(1);
    for i in 0..keys {
        let _ = table.write(&stress_key(i), &value);
    }

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;
    for i in 0..config.operations {
        match table.read(&stress_key(i % keys)) {
            Ok(Some(v)) if v == value => successful += 1,
            _ => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Runs one writer against `config.threads` readers.
///
/// Every writer transaction sets all `key_count` keys to the same
/// generation number. Readers scan the table and count a scan as
/// inconsistent if it mixes generations or goes back in time; a reader that
/// waits on the writer would show up as low throughput rather than an
/// error.
pub fn stress_readers_during_writes(db: &Database, config: &StressConfig) -> StressTestResult {
    let table = match db.table("snapshot") {
        Ok(t) => t,
        Err(_) => return StressTestResult::new(0, config.operations, Duration::ZERO),
    };
    let keys: Vec<Vec<u8>> = (0..config.key_count.clamp(1, 64)).map(stress_key).collect();
    let encode = |generation: u64| {
        let mut v = generation.to_le_bytes().to_vec();
        v.resize(config.value_size.max(8), (generation % 251) as u8);
        v
    };

    let seed = db.transaction(|txn| {
        for key in &keys {
            txn.put(table.tag(), key, &encode(0))?;
        }
        Ok(())
    });
    if seed.is_err() {
        return StressTestResult::new(0, config.operations, Duration::ZERO);
    }

    let done = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicUsize::new(0));
    let inconsistent = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let readers: Vec<_> = (0..config.threads)
        .map(|_| {
            let table = table.clone();
            let done = Arc::clone(&done);
            let reads = Arc::clone(&reads);
            let inconsistent = Arc::clone(&inconsistent);
            let expected_keys = keys.len();
            thread::spawn(move || {
                let mut last_seen = 0u64;
                while !done.load(Ordering::Acquire) {
                    let Ok(rows) = table.range(Bound::Unbounded, Bound::Unbounded) else {
                        inconsistent.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    reads.fetch_add(1, Ordering::Relaxed);
                    let generations: Vec<u64> = rows
                        .iter()
                        .map(|(_, v)| {
                            let mut raw = [0u8; 8];
                            raw.copy_from_slice(&v[..8]);
                            u64::from_le_bytes(raw)
                        })
                        .collect();
                    let first = generations.first().copied().unwrap_or(0);
                    let torn = rows.len() != expected_keys
                        || generations.iter().any(|&g| g != first)
                        || first < last_seen;
                    if torn {
                        inconsistent.fetch_add(1, Ordering::Relaxed);
                    }
                    last_seen = first;
                }
            })
        })
        .collect();

    let mut successful = 0usize;
    let mut failed = 0usize;
    for generation in 1..=config.operations as u64 {
        let result = db.transaction(|txn| {
            for key in &keys {
                txn.put(table.tag(), key, &encode(generation))?;
            }
            Ok(())
        });
        match result {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    done.store(true, Ordering::Release);
    for reader in readers {
        if reader.join().is_err() {
            inconsistent.fetch_add(1, Ordering::Relaxed);
        }
    }

    let mut result = StressTestResult::new(
        successful + reads.load(Ordering::Relaxed),
        failed,
        start.elapsed(),
    );
    result.inconsistent_reads = inconsistent.load(Ordering::Relaxed);
    result
}

/// Run a test where every other transaction is aborted.
pub fn stress_transaction_aborts(db: &Database, config: &StressConfig) -> StressTestResult {
    let table = match db.table("aborts") {
        Ok(t) => t,
        Err(_) => return StressTestResult::new(0, config.operations, Duration::ZERO),
    };

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;
    for i in 0..config.operations {
        let mut txn = match db.begin() {
            Ok(txn) => txn,
            Err(_) => {
                failed += 1;
                continue;
            }
        };
        if txn.put(table.tag(), &stress_key(i), b"v").is_err() {
            failed += 1;
            continue;
        }
        if i % 2 == 0 {
            txn.abort();
            successful += 1;
        } else if txn.commit().is_ok() {
            successful += 1;
        } else {
            failed += 1;
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

//! Engine counters.
//!
//! Counters are atomic and may be read while operations are in progress.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running operation counters for one engine.
#[derive(Debug, Default)]
pub struct DatabaseStats {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    scans: AtomicU64,
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    checkpoints: AtomicU64,
    errors: AtomicU64,
}

impl DatabaseStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            reads: get(&self.reads),
            writes: get(&self.writes),
            deletes: get(&self.deletes),
            scans: get(&self.scans),
            transactions_started: get(&self.transactions_started),
            transactions_committed: get(&self.transactions_committed),
            transactions_aborted: get(&self.transactions_aborted),
            bytes_written: get(&self.bytes_written),
            bytes_read: get(&self.bytes_read),
            checkpoints: get(&self.checkpoints),
            errors: get(&self.errors),
        }
    }
}

/// A point-in-time copy of [`DatabaseStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Point reads served.
    pub reads: u64,
    /// Keys written by committed transactions.
    pub writes: u64,
    /// Keys deleted by committed transactions.
    pub deletes: u64,
    /// Range scans and key listings.
    pub scans: u64,
    /// Write transactions started.
    pub transactions_started: u64,
    /// Write transactions committed.
    pub transactions_committed: u64,
    /// Write transactions aborted, explicitly or by a failed commit.
    pub transactions_aborted: u64,
    /// Value bytes written.
    pub bytes_written: u64,
    /// Value bytes returned by reads.
    pub bytes_read: u64,
    /// Checkpoints completed.
    pub checkpoints: u64,
    /// Failed commits and checkpoints.
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        assert_eq!(DatabaseStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_operations() {
        let stats = DatabaseStats::new();

        stats.record_read(100);
        stats.record_read(50);
        stats.record_write(200);
        stats.record_delete();
        stats.record_scan();

        let snap = stats.snapshot();
        assert_eq!(snap.reads, 2);
        assert_eq!(snap.bytes_read, 150);
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.bytes_written, 200);
        assert_eq!(snap.deletes, 1);
        assert_eq!(snap.scans, 1);
    }

    #[test]
    fn record_transactions() {
        let stats = DatabaseStats::new();

        stats.record_transaction_start();
        stats.record_transaction_start();
        stats.record_transaction_commit();
        stats.record_transaction_abort();
        stats.record_checkpoint();
        stats.record_error();

        let snap = stats.snapshot();
        assert_eq!(snap.transactions_started, 2);
        assert_eq!(snap.transactions_committed, 1);
        assert_eq!(snap.transactions_aborted, 1);
        assert_eq!(snap.checkpoints, 1);
        assert_eq!(snap.errors, 1);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(DatabaseStats::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        s.record_read(1);
                        s.record_write(1);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.reads, 1000);
        assert_eq!(snap.writes, 1000);
    }
}

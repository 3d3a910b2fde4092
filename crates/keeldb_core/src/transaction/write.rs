//! Write transaction handle.

use crate::error::CoreResult;
use crate::transaction::manager::TransactionManager;
use crate::transaction::state::{PendingWrite, Transaction};
use crate::types::{Entry, Lsn, TableTag, TransactionId};
use parking_lot::MutexGuard;
use std::time::{SystemTime, UNIX_EPOCH};

/// The single open writer.
///
/// Holds the writer slot for its whole lifetime; no other write
/// transaction can begin until this one commits, aborts or is dropped.
/// Dropping without committing aborts.
///
/// ```rust,ignore
/// let users = TableTag::new("users")?;
/// let mut txn = db.begin()?;
/// txn.put(&users, b"alice", b"30")?;
/// txn.put(&users, b"bob", b"25")?;
/// txn.commit()?;
/// ```
pub struct WriteTransaction<'a> {
    manager: &'a TransactionManager,
    txn: Transaction,
    _slot: MutexGuard<'a, ()>,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn new(
        manager: &'a TransactionManager,
        txn: Transaction,
        slot: MutexGuard<'a, ()>,
    ) -> Self {
        Self {
            manager,
            txn,
            _slot: slot,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.txn.id()
    }

    /// Number of buffered writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.txn.write_count()
    }

    /// Buffers `key = value` in `table`.
    pub fn put(&mut self, table: &TableTag, key: &[u8], value: &[u8]) -> CoreResult<()> {
        self.txn.put(table, key, value, now_millis())
    }

    /// Buffers the removal of `key` from `table`.
    pub fn delete(&mut self, table: &TableTag, key: &[u8]) -> CoreResult<()> {
        self.txn.delete(table, key)
    }

    /// Reads `key`, seeing this transaction's own writes first.
    pub fn get(&self, table: &TableTag, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.get_entry(table, key)?.map(|e| e.value))
    }

    /// Like [`WriteTransaction::get`], with the last-update time.
    pub fn get_entry(&self, table: &TableTag, key: &[u8]) -> CoreResult<Option<Entry>> {
        self.txn.ensure_active()?;
        match self.txn.pending(table, key) {
            Some(PendingWrite::Put { value, updated_at }) => Ok(Some(Entry {
                value: value.clone(),
                updated_at: *updated_at,
            })),
            Some(PendingWrite::Delete) => Ok(None),
            None => self.manager.get(table, key),
        }
    }

    /// Makes every buffered write durable and visible, atomically.
    ///
    /// Returns the commit's LSN, or `None` if nothing was written.
    ///
    /// # Errors
    ///
    /// On error the transaction is rolled back: `CommitFailed` if the log
    /// record could not be made durable, `StorageFull` or `CorruptBlock` if
    /// the new tree versions could not be built.
    pub fn commit(mut self) -> CoreResult<Option<Lsn>> {
        self.manager.commit(&mut self.txn)
    }

    /// Discards every buffered write.
    pub fn abort(mut self) {
        self.manager.abort(&mut self.txn);
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        self.manager.abort(&mut self.txn);
    }
}

impl std::fmt::Debug for WriteTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("id", &self.txn.id())
            .field("state", &self.txn.state())
            .field("writes", &self.txn.write_count())
            .finish()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

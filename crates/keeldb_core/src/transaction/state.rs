//! Transaction state and write buffer.

use crate::error::{CoreError, CoreResult};
use crate::types::{check_key, check_value, TableTag, TransactionId};
use crate::wal::Mutation;
use std::collections::BTreeMap;

/// Lifecycle of a write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Open and accepting writes.
    Active,
    /// Commit in progress.
    Committing,
    /// Durable and visible.
    Committed,
    /// Discarded, explicitly or by a failed commit.
    Aborted,
}

/// A buffered write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingWrite {
    /// Store a value.
    Put {
        /// New value.
        value: Vec<u8>,
        /// Unix millis at which the write was issued.
        updated_at: u64,
    },
    /// Remove the key.
    Delete,
}

/// Buffered writes of one transaction.
///
/// Nothing touches the trees or the log until commit; a later write to the
/// same key replaces the earlier one.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    writes: BTreeMap<TableTag, BTreeMap<Vec<u8>, PendingWrite>>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            writes: BTreeMap::new(),
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction still accepts writes.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Buffers a put.
    pub fn put(
        &mut self,
        table: &TableTag,
        key: &[u8],
        value: &[u8],
        updated_at: u64,
    ) -> CoreResult<()> {
        self.ensure_active()?;
        check_key(key)?;
        check_value(value)?;
        self.table_writes(table).insert(
            key.to_vec(),
            PendingWrite::Put {
                value: value.to_vec(),
                updated_at,
            },
        );
        Ok(())
    }

    /// Buffers a delete.
    pub fn delete(&mut self, table: &TableTag, key: &[u8]) -> CoreResult<()> {
        self.ensure_active()?;
        check_key(key)?;
        self.table_writes(table)
            .insert(key.to_vec(), PendingWrite::Delete);
        Ok(())
    }

    fn table_writes(&mut self, table: &TableTag) -> &mut BTreeMap<Vec<u8>, PendingWrite> {
        self.writes.entry(table.clone()).or_default()
    }

    /// The buffered write for a key, if any.
    #[must_use]
    pub fn pending(&self, table: &TableTag, key: &[u8]) -> Option<&PendingWrite> {
        self.writes.get(table)?.get(key)
    }

    /// Number of buffered writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.values().map(BTreeMap::len).sum()
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.write_count() == 0
    }

    /// The buffered writes as log mutations, ordered by table then key.
    pub(crate) fn mutations(&self) -> Vec<Mutation> {
        let mut out = Vec::with_capacity(self.write_count());
        for (table, writes) in &self.writes {
            for (key, write) in writes {
                out.push(match write {
                    PendingWrite::Put { value, updated_at } => {
                        Mutation::put(table.clone(), key.clone(), value.clone(), *updated_at)
                    }
                    PendingWrite::Delete => Mutation::delete(table.clone(), key.clone()),
                });
            }
        }
        out
    }

    pub(crate) fn mark_committing(&mut self) {
        self.state = TransactionState::Committing;
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.state = TransactionState::Aborted;
        self.writes.clear();
    }

    pub(crate) fn ensure_active(&self) -> CoreResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CoreError::TransactionInactive)
        }
    }
}

//! Transaction manager.

use crate::block::{BlockStore, BlockUsage, Superblock};
use crate::btree::{read_value, BTree, LeafEntry, TreeWriter, ValueRef};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::failpoint;
use crate::stats::DatabaseStats;
use crate::transaction::state::Transaction;
use crate::transaction::write::WriteTransaction;
use crate::types::{BlockId, Entry, Lsn, TableTag, TransactionId};
use crate::wal::{Mutation, MutationOp, WalManager, WalTail};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// What startup recovery found.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    /// LSN covered by the superblock found at open.
    pub checkpoint_lsn: Lsn,
    /// Committed transactions replayed from the log.
    pub replayed: u64,
    /// Highest LSN applied.
    pub last_lsn: Lsn,
    /// Whether an incomplete record at the end of the log was discarded.
    pub torn_tail: bool,
}

/// Result of a full structural check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerifyReport {
    /// Non-empty tables.
    pub tables: usize,
    /// Entries across all tables.
    pub entries: u64,
    /// Catalog and table node blocks.
    pub tree_blocks: u64,
    /// Overflow value blocks.
    pub overflow_blocks: u64,
    /// Deepest table tree.
    pub max_depth: usize,
    /// Block accounting from the allocator.
    pub usage: BlockUsage,
    /// Blocks neither reachable, free nor pending. Nonzero means leaked
    /// space.
    pub unaccounted: u64,
}

/// Last published version of every tree.
#[derive(Debug, Clone, Default)]
struct CommittedState {
    catalog: BTree,
    tables: BTreeMap<TableTag, BTree>,
    last_lsn: Lsn,
}

impl CommittedState {
    fn tree(&self, table: &TableTag) -> BTree {
        self.tables.get(table).copied().unwrap_or_default()
    }
}

/// Serializes writers and owns the commit, checkpoint and recovery paths.
///
/// ## Single-Writer Guarantee
///
/// One write transaction at a time holds the writer slot. `begin()` fails
/// with `WriterBusy` when the slot is taken; `begin_wait()` waits for it.
/// Readers never take the slot: they hold the state lock only while they
/// walk a tree, and the only writer step that excludes them is the swap of
/// the new roots.
pub struct TransactionManager {
    blocks: BlockStore,
    wal: WalManager,
    state: RwLock<CommittedState>,
    /// Writer slot.
    writer: Mutex<()>,
    /// The superblock as last written.
    durable: Mutex<Superblock>,
    next_txid: AtomicU64,
    recovered: AtomicBool,
    poisoned: AtomicBool,
    closed: AtomicBool,
    checkpoint_wal_bytes: u64,
    writer_wait: Duration,
    stats: DatabaseStats,
}

impl TransactionManager {
    /// Creates a manager over a block store and log. Nothing is readable
    /// until [`TransactionManager::recover`] has run.
    pub fn new(blocks: BlockStore, wal: WalManager, config: &Config) -> Self {
        Self {
            blocks,
            wal,
            state: RwLock::new(CommittedState::default()),
            writer: Mutex::new(()),
            durable: Mutex::new(Superblock::empty()),
            next_txid: AtomicU64::new(1),
            recovered: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            checkpoint_wal_bytes: config.checkpoint_wal_bytes,
            writer_wait: config.writer_wait,
            stats: DatabaseStats::new(),
        }
    }

    /// Begins a write transaction, failing if another one is open.
    ///
    /// # Errors
    ///
    /// Returns `WriterBusy` if the writer slot is taken.
    pub fn begin(&self) -> CoreResult<WriteTransaction<'_>> {
        self.ensure_usable()?;
        let slot = self.writer.try_lock().ok_or(CoreError::WriterBusy)?;
        self.start(slot)
    }

    /// Begins a write transaction, waiting up to `timeout` for the slot.
    ///
    /// # Errors
    ///
    /// Returns `WriterBusy` if the slot did not free up in time.
    pub fn begin_wait(&self, timeout: Duration) -> CoreResult<WriteTransaction<'_>> {
        self.ensure_usable()?;
        let slot = self
            .writer
            .try_lock_for(timeout)
            .ok_or(CoreError::WriterBusy)?;
        self.start(slot)
    }

    fn start<'a>(&'a self, slot: MutexGuard<'a, ()>) -> CoreResult<WriteTransaction<'a>> {
        // State may have changed while waiting for the slot.
        self.ensure_usable()?;
        let id = TransactionId::new(self.next_txid.fetch_add(1, Ordering::AcqRel));
        self.stats.record_transaction_start();
        tracing::debug!(%id, "begin");
        Ok(WriteTransaction::new(self, Transaction::new(id), slot))
    }

    /// Commits `txn`. The caller holds the writer slot.
    pub(crate) fn commit(&self, txn: &mut Transaction) -> CoreResult<Option<Lsn>> {
        txn.ensure_active()?;
        if let Err(e) = self.ensure_usable() {
            self.abort(txn);
            return Err(e);
        }
        if txn.is_empty() {
            txn.mark_committed();
            self.stats.record_transaction_commit();
            return Ok(None);
        }

        txn.mark_committing();
        let mutations = txn.mutations();
        match self.commit_mutations(txn.id(), &mutations) {
            Ok(lsn) => {
                txn.mark_committed();
                self.stats.record_transaction_commit();
                for m in &mutations {
                    match &m.op {
                        MutationOp::Put { value, .. } => self.stats.record_write(value.len() as u64),
                        MutationOp::Delete => self.stats.record_delete(),
                    }
                }
                self.maybe_checkpoint();
                Ok(Some(lsn))
            }
            Err(e) => {
                tracing::warn!(id = %txn.id(), error = %e, "commit failed");
                txn.mark_aborted();
                self.stats.record_transaction_abort();
                self.stats.record_error();
                Err(e)
            }
        }
    }

    fn commit_mutations(&self, txid: TransactionId, mutations: &[Mutation]) -> CoreResult<Lsn> {
        let base = self.state.read().clone();
        // Dropping `w` on any early return releases the blocks it allocated.
        let mut w = TreeWriter::new(&self.blocks);
        let next = build(&mut w, &base, mutations)?;

        let lsn = self
            .wal
            .append(txid, mutations)
            .map_err(|e| CoreError::commit_failed(format!("WAL append: {e}")))?;

        let flushed = failpoint::maybe_fail(failpoint::WAL_BEFORE_FLUSH)
            .map_err(CoreError::from)
            .and_then(|()| self.wal.flush());
        if let Err(e) = flushed {
            if let Err(revert) = self.wal.revert_last(lsn) {
                tracing::error!(%lsn, error = %revert, "cannot remove unflushed WAL record");
                self.poison();
            }
            return Err(CoreError::commit_failed(format!("WAL flush: {e}")));
        }

        // The record is durable: from here on the commit happens, on this
        // handle or through replay.
        if let Err(e) = failpoint::maybe_fail(failpoint::COMMIT_BEFORE_PUBLISH) {
            tracing::error!(%lsn, error = %e, "commit interrupted before publish");
            self.poison();
            return Err(CoreError::Poisoned);
        }

        self.publish(w, next, lsn);
        tracing::debug!(%txid, %lsn, mutations = mutations.len(), "committed");
        Ok(lsn)
    }

    /// Swaps in a built state and releases the blocks it superseded.
    fn publish(&self, w: TreeWriter<'_>, mut next: CommittedState, lsn: Lsn) {
        let retired = w.finish();
        next.last_lsn = lsn;
        *self.state.write() = next;
        // No reader can still hold the old roots once the swap is done.
        for id in retired {
            self.blocks.free(id);
        }
    }

    fn maybe_checkpoint(&self) {
        if self.checkpoint_wal_bytes == 0 {
            return;
        }
        match self.wal.size() {
            Ok(size) if size >= self.checkpoint_wal_bytes => {
                tracing::debug!(size, "WAL over threshold, checkpointing");
                if let Err(e) = self.checkpoint_locked() {
                    self.stats.record_error();
                    tracing::warn!(error = %e, "automatic checkpoint failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "cannot read WAL size"),
        }
    }

    /// Discards `txn` if it is still open.
    pub(crate) fn abort(&self, txn: &mut Transaction) {
        if txn.is_active() {
            tracing::debug!(id = %txn.id(), writes = txn.write_count(), "abort");
            txn.mark_aborted();
            self.stats.record_transaction_abort();
        }
    }

    /// Reads the committed entry for `key`.
    pub fn get(&self, table: &TableTag, key: &[u8]) -> CoreResult<Option<Entry>> {
        self.ensure_usable()?;
        let entry = {
            let state = self.state.read();
            match state.tree(table).lookup(&self.blocks, key)? {
                Some(found) => Some(Entry {
                    value: read_value(&self.blocks, &found.value)?,
                    updated_at: found.updated_at,
                }),
                None => None,
            }
        };
        if let Some(entry) = &entry {
            self.stats.record_read(entry.value.len() as u64);
        }
        Ok(entry)
    }

    /// Whether `key` has a committed value, without loading it.
    pub fn contains(&self, table: &TableTag, key: &[u8]) -> CoreResult<bool> {
        self.ensure_usable()?;
        let state = self.state.read();
        Ok(state.tree(table).lookup(&self.blocks, key)?.is_some())
    }

    /// Committed entries of `table` within the bounds, in key order.
    pub fn scan(
        &self,
        table: &TableTag,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> CoreResult<Vec<(Vec<u8>, Entry)>> {
        self.ensure_usable()?;
        let mut out = Vec::new();
        {
            let state = self.state.read();
            let range = state.tree(table).range(
                &self.blocks,
                lower.map(<[u8]>::to_vec),
                upper.map(<[u8]>::to_vec),
            );
            for found in range {
                let found = found?;
                let value = read_value(&self.blocks, &found.value)?;
                out.push((
                    found.key,
                    Entry {
                        value,
                        updated_at: found.updated_at,
                    },
                ));
            }
        }
        self.stats.record_scan();
        Ok(out)
    }

    /// Committed keys of `table` within the bounds, without loading values.
    pub fn keys(
        &self,
        table: &TableTag,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> CoreResult<Vec<Vec<u8>>> {
        self.ensure_usable()?;
        let keys = {
            let state = self.state.read();
            state
                .tree(table)
                .range(
                    &self.blocks,
                    lower.map(<[u8]>::to_vec),
                    upper.map(<[u8]>::to_vec),
                )
                .map(|found| found.map(|e| e.key))
                .collect::<CoreResult<Vec<_>>>()?
        };
        self.stats.record_scan();
        Ok(keys)
    }

    /// Number of committed entries in `table`.
    pub fn count(&self, table: &TableTag) -> CoreResult<u64> {
        self.ensure_usable()?;
        let state = self.state.read();
        let mut count = 0;
        for found in state
            .tree(table)
            .range(&self.blocks, Bound::Unbounded, Bound::Unbounded)
        {
            found?;
            count += 1;
        }
        Ok(count)
    }

    /// Tables holding at least one entry.
    pub fn tables(&self) -> CoreResult<Vec<TableTag>> {
        self.ensure_usable()?;
        Ok(self.state.read().tables.keys().cloned().collect())
    }

    /// Rebuilds committed state from the superblock and the log.
    ///
    /// Runs once per manager: loads the newest superblock (initializing a
    /// new database if there is none), rebuilds the free list from the
    /// blocks the trees reach, replays every commit the checkpoint does not
    /// cover, drops a torn log tail and checkpoints.
    ///
    /// # Errors
    ///
    /// Any failure is reported as `RecoveryFailed` and leaves the manager
    /// poisoned. A second call returns `InvalidOperation`.
    pub fn recover(&self) -> CoreResult<RecoveryReport> {
        if self.recovered.swap(true, Ordering::AcqRel) {
            return Err(CoreError::invalid_operation(
                "recovery already ran for this engine",
            ));
        }
        let _slot = self.writer.lock();
        self.recover_locked().map_err(|e| {
            self.poison();
            e.into_recovery_failed()
        })
    }

    fn recover_locked(&self) -> CoreResult<RecoveryReport> {
        let durable = match Superblock::load(&self.blocks)? {
            Some(sb) => sb,
            None => {
                tracing::info!("initializing new database");
                Superblock::empty()
            }
        };

        let catalog = BTree::with_root(durable.catalog_root);
        let mut reachable = HashSet::new();
        let mut mark = |id: BlockId| {
            if reachable.insert(id) {
                Ok(())
            } else {
                Err(CoreError::corrupt_block(id, "block referenced twice"))
            }
        };
        catalog.walk(&self.blocks, &mut mark)?;
        let tables = load_tables(&self.blocks, &catalog)?;
        for tree in tables.values() {
            tree.walk(&self.blocks, &mut mark)?;
        }
        self.blocks.reset_free_list(&reachable);

        let mut report = RecoveryReport {
            checkpoint_lsn: durable.checkpoint_lsn,
            last_lsn: durable.checkpoint_lsn,
            ..RecoveryReport::default()
        };
        let mut next_txid = durable.next_txid.as_u64();
        *self.state.write() = CommittedState {
            catalog,
            tables,
            last_lsn: durable.checkpoint_lsn,
        };
        *self.durable.lock() = durable;

        let mut replay = self.wal.replay(report.checkpoint_lsn)?;
        for commit in replay.by_ref() {
            let commit = commit?;
            let base = self.state.read().clone();
            let mut w = TreeWriter::new(&self.blocks);
            let next = build(&mut w, &base, &commit.mutations)?;
            self.publish(w, next, commit.lsn);

            next_txid = next_txid.max(commit.txid.as_u64() + 1);
            report.replayed += 1;
            report.last_lsn = commit.lsn;
            tracing::debug!(lsn = %commit.lsn, txid = %commit.txid, "replayed");
        }
        let (valid_end, tail) = (replay.valid_end(), replay.tail());
        drop(replay);

        if tail == WalTail::Torn {
            tracing::warn!(valid_end, "discarding torn WAL tail");
            self.wal.truncate(valid_end)?;
            report.torn_tail = true;
        }
        self.wal.resume_after(report.last_lsn);
        self.next_txid.store(next_txid, Ordering::Release);

        self.checkpoint_locked()?;
        tracing::info!(
            replayed = report.replayed,
            last_lsn = %report.last_lsn,
            "recovery complete"
        );
        Ok(report)
    }

    /// Writes a new superblock covering every published commit and
    /// reclaims the log.
    ///
    /// # Errors
    ///
    /// Returns `WriterBusy` if a write transaction keeps the slot past the
    /// configured wait.
    pub fn checkpoint(&self) -> CoreResult<()> {
        self.ensure_usable()?;
        let _slot = self
            .writer
            .try_lock_for(self.writer_wait)
            .ok_or(CoreError::WriterBusy)?;
        self.checkpoint_locked()
    }

    /// Checkpoint body. The caller holds the writer slot.
    fn checkpoint_locked(&self) -> CoreResult<()> {
        self.ensure_usable()?;
        let (catalog_root, lsn) = {
            let state = self.state.read();
            (state.catalog.root(), state.last_lsn)
        };

        self.blocks.sync()?;
        let generation = {
            let mut durable = self.durable.lock();
            let next = Superblock {
                generation: durable.generation + 1,
                checkpoint_lsn: lsn,
                next_txid: TransactionId::new(self.next_txid.load(Ordering::Acquire)),
                block_count: self.blocks.block_count(),
                catalog_root,
            };
            next.store(&self.blocks)?;
            *durable = next;
            durable.generation
        };
        self.blocks.checkpoint_complete();

        if let Err(e) = failpoint::maybe_fail(failpoint::CHECKPOINT_BEFORE_WAL_CLEAR) {
            self.poison();
            return Err(e.into());
        }
        self.wal.checkpoint(lsn)?;

        self.stats.record_checkpoint();
        tracing::info!(%lsn, generation, "checkpoint complete");
        Ok(())
    }

    /// Walks every tree and value chain, checking checksums, key order and
    /// block accounting.
    ///
    /// # Errors
    ///
    /// Returns `CorruptBlock` for the first damaged block found, or
    /// `WriterBusy` if the writer slot stays taken.
    pub fn verify(&self) -> CoreResult<VerifyReport> {
        self.ensure_usable()?;
        let _slot = self
            .writer
            .try_lock_for(self.writer_wait)
            .ok_or(CoreError::WriterBusy)?;
        let state = self.state.read();

        let mut seen = HashSet::new();
        let mut mark = |id: BlockId| {
            if seen.insert(id) {
                Ok(())
            } else {
                Err(CoreError::corrupt_block(id, "block referenced twice"))
            }
        };

        let catalog = state.catalog.walk(&self.blocks, &mut mark)?;
        let mut report = VerifyReport {
            tables: state.tables.len(),
            tree_blocks: catalog.nodes,
            ..VerifyReport::default()
        };
        for tree in state.tables.values() {
            let shape = tree.walk(&self.blocks, &mut mark)?;
            report.entries += shape.entries;
            report.tree_blocks += shape.nodes;
            report.overflow_blocks += shape.overflow_blocks;
            report.max_depth = report.max_depth.max(shape.depth);
        }

        if load_tables(&self.blocks, &state.catalog)? != state.tables {
            return Err(CoreError::invalid_format(
                "catalog does not match the published table roots",
            ));
        }

        let usage = self.blocks.usage();
        let accounted = 1 + seen.len() as u64 + usage.free + usage.pending;
        report.unaccounted = usage.total.saturating_sub(accounted);
        report.usage = usage;
        Ok(report)
    }

    /// Checkpoints and shuts the manager. Idempotent.
    ///
    /// A poisoned manager skips the checkpoint so the next open replays the
    /// log.
    pub fn close(&self) -> CoreResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let _slot = self
            .writer
            .try_lock_for(self.writer_wait)
            .ok_or(CoreError::WriterBusy)?;
        if self.is_closed() {
            return Ok(());
        }

        let result = if self.is_poisoned() || !self.recovered.load(Ordering::Acquire) {
            tracing::warn!("closing without checkpoint");
            Ok(())
        } else {
            self.checkpoint_locked()
        };
        self.closed.store(true, Ordering::Release);
        tracing::info!("engine closed");
        result
    }

    fn poison(&self) {
        if !self.poisoned.swap(true, Ordering::AcqRel) {
            tracing::error!("engine poisoned; reopen to recover");
        }
    }

    fn ensure_usable(&self) -> CoreResult<()> {
        if self.is_closed() {
            return Err(CoreError::DatabaseClosed);
        }
        if self.is_poisoned() {
            return Err(CoreError::Poisoned);
        }
        Ok(())
    }

    /// Whether an interrupted commit or checkpoint left state unusable.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Whether [`TransactionManager::close`] has completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// LSN of the last published commit.
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        self.state.read().last_lsn
    }

    /// Current block accounting.
    #[must_use]
    pub fn block_usage(&self) -> BlockUsage {
        self.blocks.usage()
    }

    /// Current WAL size in bytes.
    pub fn wal_size(&self) -> CoreResult<u64> {
        self.wal.size()
    }

    /// Operation counters.
    #[must_use]
    pub fn stats(&self) -> &DatabaseStats {
        &self.stats
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("last_lsn", &self.last_lsn())
            .field("poisoned", &self.is_poisoned())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Applies `mutations` on top of `base` through `w`, without publishing.
fn build(
    w: &mut TreeWriter<'_>,
    base: &CommittedState,
    mutations: &[Mutation],
) -> CoreResult<CommittedState> {
    let mut next = base.clone();
    let mut touched = BTreeSet::new();

    for m in mutations {
        let tree = next.tables.entry(m.table.clone()).or_default();
        match &m.op {
            MutationOp::Put { value, updated_at } => tree.put(w, &m.key, value, *updated_at)?,
            MutationOp::Delete => {
                tree.delete(w, &m.key)?;
            }
        }
        touched.insert(&m.table);
    }

    for tag in touched {
        match next.tables.get(tag).and_then(BTree::root) {
            Some(root) => {
                next.catalog.upsert(w, catalog_entry(tag, root))?;
            }
            None => {
                next.catalog.remove(w, tag.as_bytes())?;
                next.tables.remove(tag);
            }
        }
    }
    Ok(next)
}

fn catalog_entry(tag: &TableTag, root: BlockId) -> LeafEntry {
    LeafEntry {
        key: tag.as_bytes().to_vec(),
        updated_at: 0,
        value: ValueRef::Inline(root.as_u64().to_le_bytes().to_vec()),
    }
}

/// Reads every (tag, root) pair out of the catalog tree.
fn load_tables(store: &BlockStore, catalog: &BTree) -> CoreResult<BTreeMap<TableTag, BTree>> {
    let mut tables = BTreeMap::new();
    for entry in catalog.range(store, Bound::Unbounded, Bound::Unbounded) {
        let entry = entry?;
        let root = match &entry.value {
            ValueRef::Inline(bytes) if bytes.len() == 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                BlockId::from_raw(u64::from_le_bytes(raw))
            }
            _ => None,
        };
        let tag = String::from_utf8(entry.key)
            .ok()
            .and_then(|s| TableTag::new(s).ok());
        match (tag, root) {
            (Some(tag), Some(root)) => {
                tables.insert(tag, BTree::with_root(Some(root)));
            }
            _ => return Err(CoreError::invalid_format("malformed catalog entry")),
        }
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeldb_storage::{InMemoryBackend, StorageBackend};

    fn users() -> TableTag {
        TableTag::new("users").unwrap()
    }

    fn manager_over(wal: InMemoryBackend, blocks: InMemoryBackend) -> TransactionManager {
        let blocks = BlockStore::open(Box::new(blocks), None).unwrap();
        let wal = WalManager::new(Box::new(wal), false);
        TransactionManager::new(blocks, wal, &Config::default().checkpoint_wal_bytes(0))
    }

    fn create_manager() -> TransactionManager {
        let tm = manager_over(InMemoryBackend::new(), InMemoryBackend::new());
        tm.recover().unwrap();
        tm
    }

    fn value(tm: &TransactionManager, key: &[u8]) -> Option<Vec<u8>> {
        tm.get(&users(), key).unwrap().map(|e| e.value)
    }

    #[test]
    fn commit_makes_writes_visible() {
        let tm = create_manager();
        let mut txn = tm.begin().unwrap();
        txn.put(&users(), b"alice", b"30").unwrap();
        assert_eq!(value(&tm, b"alice"), None);

        let lsn = txn.commit().unwrap();
        assert_eq!(lsn, Some(Lsn::new(1)));
        assert_eq!(value(&tm, b"alice"), Some(b"30".to_vec()));
        assert_eq!(tm.tables().unwrap(), vec![users()]);
    }

    #[test]
    fn empty_commit_logs_nothing() {
        let tm = create_manager();
        assert_eq!(tm.begin().unwrap().commit().unwrap(), None);
        assert_eq!(tm.wal_size().unwrap(), 0);
    }

    #[test]
    fn abort_discards_writes() {
        let tm = create_manager();
        let mut txn = tm.begin().unwrap();
        txn.put(&users(), b"k", b"v").unwrap();
        txn.abort();
        assert_eq!(value(&tm, b"k"), None);

        // Dropping aborts too.
        {
            let mut txn = tm.begin().unwrap();
            txn.put(&users(), b"k", b"v").unwrap();
        }
        assert_eq!(value(&tm, b"k"), None);
        assert_eq!(tm.stats().snapshot().transactions_aborted, 2);
    }

    #[test]
    fn second_writer_is_busy() {
        let tm = create_manager();
        let first = tm.begin().unwrap();
        assert!(matches!(tm.begin(), Err(CoreError::WriterBusy)));
        assert!(matches!(
            tm.begin_wait(Duration::from_millis(20)),
            Err(CoreError::WriterBusy)
        ));
        drop(first);
        assert!(tm.begin().is_ok());
    }

    #[test]
    fn read_your_writes() {
        let tm = create_manager();
        let mut setup = tm.begin().unwrap();
        setup.put(&users(), b"bob", b"25").unwrap();
        setup.commit().unwrap();

        let mut txn = tm.begin().unwrap();
        txn.put(&users(), b"alice", b"30").unwrap();
        txn.delete(&users(), b"bob").unwrap();
        assert_eq!(txn.get(&users(), b"alice").unwrap(), Some(b"30".to_vec()));
        assert_eq!(txn.get(&users(), b"bob").unwrap(), None);
        assert_eq!(value(&tm, b"bob"), Some(b"25".to_vec()));
    }

    #[test]
    fn deleting_last_key_drops_table() {
        let tm = create_manager();
        let mut txn = tm.begin().unwrap();
        txn.put(&users(), b"k", b"v").unwrap();
        txn.commit().unwrap();

        let mut txn = tm.begin().unwrap();
        txn.delete(&users(), b"k").unwrap();
        txn.commit().unwrap();

        assert!(tm.tables().unwrap().is_empty());
        assert_eq!(tm.verify().unwrap().unaccounted, 0);
    }

    #[test]
    fn recover_twice_is_invalid() {
        let tm = create_manager();
        assert!(matches!(
            tm.recover(),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn replay_restores_uncheckpointed_commits() {
        let wal = InMemoryBackend::new();
        let blocks = InMemoryBackend::new();
        {
            let tm = manager_over(wal.clone(), blocks.clone());
            tm.recover().unwrap();
            for i in 0..20u32 {
                let mut txn = tm.begin().unwrap();
                txn.put(&users(), format!("k{i}").as_bytes(), &i.to_le_bytes())
                    .unwrap();
                txn.commit().unwrap();
            }
            // No close: the log is the only record of these commits.
        }

        let tm = manager_over(wal.clone(), blocks);
        let report = tm.recover().unwrap();
        assert_eq!(report.replayed, 20);
        assert_eq!(report.last_lsn, Lsn::new(20));
        assert_eq!(value(&tm, b"k7"), Some(7u32.to_le_bytes().to_vec()));
        assert_eq!(wal.size().unwrap(), 0);

        // Numbering continues after the replayed records.
        let mut txn = tm.begin().unwrap();
        txn.put(&users(), b"next", b"x").unwrap();
        assert_eq!(txn.commit().unwrap(), Some(Lsn::new(21)));
    }

    #[test]
    fn checkpointed_commits_are_not_replayed() {
        let wal = InMemoryBackend::new();
        let blocks = InMemoryBackend::new();
        {
            let tm = manager_over(wal.clone(), blocks.clone());
            tm.recover().unwrap();
            let mut txn = tm.begin().unwrap();
            txn.put(&users(), b"a", b"1").unwrap();
            txn.commit().unwrap();
            tm.close().unwrap();
        }
        let tm = manager_over(wal, blocks);
        let report = tm.recover().unwrap();
        assert_eq!(report.replayed, 0);
        assert_eq!(report.checkpoint_lsn, Lsn::new(1));
        assert_eq!(value(&tm, b"a"), Some(b"1".to_vec()));
    }

    #[test]
    fn flush_failpoint_rolls_back() {
        let tm = create_manager();
        failpoint::enable(failpoint::WAL_BEFORE_FLUSH);
        let mut txn = tm.begin().unwrap();
        txn.put(&users(), b"k", b"v").unwrap();
        let result = txn.commit();
        failpoint::disable(failpoint::WAL_BEFORE_FLUSH);

        assert!(matches!(result, Err(CoreError::CommitFailed { .. })));
        assert!(!tm.is_poisoned());
        assert_eq!(value(&tm, b"k"), None);
        assert_eq!(tm.wal_size().unwrap(), 0);
        assert_eq!(tm.verify().unwrap().unaccounted, 0);
    }

    #[test]
    fn publish_failpoint_poisons() {
        let tm = create_manager();
        failpoint::enable(failpoint::COMMIT_BEFORE_PUBLISH);
        let mut txn = tm.begin().unwrap();
        txn.put(&users(), b"k", b"v").unwrap();
        let result = txn.commit();
        failpoint::disable(failpoint::COMMIT_BEFORE_PUBLISH);

        assert!(matches!(result, Err(CoreError::Poisoned)));
        assert!(matches!(tm.get(&users(), b"k"), Err(CoreError::Poisoned)));
        assert!(matches!(tm.begin(), Err(CoreError::Poisoned)));
    }

    #[test]
    fn storage_full_leaves_state_unchanged() {
        let blocks = BlockStore::open(Box::new(InMemoryBackend::new()), Some(4)).unwrap();
        let wal = WalManager::new(Box::new(InMemoryBackend::new()), false);
        let tm = TransactionManager::new(blocks, wal, &Config::default());
        tm.recover().unwrap();

        let mut txn = tm.begin().unwrap();
        txn.put(&users(), b"small", b"v").unwrap();
        txn.commit().unwrap();

        let mut txn = tm.begin().unwrap();
        txn.put(&users(), b"huge", &vec![1u8; 64 * 1024]).unwrap();
        assert!(matches!(txn.commit(), Err(CoreError::StorageFull { .. })));

        assert_eq!(value(&tm, b"huge"), None);
        assert_eq!(value(&tm, b"small"), Some(b"v".to_vec()));
        assert_eq!(tm.verify().unwrap().unaccounted, 0);
    }

    #[test]
    fn closed_manager_rejects_work() {
        let tm = create_manager();
        tm.close().unwrap();
        tm.close().unwrap();
        assert!(matches!(tm.begin(), Err(CoreError::DatabaseClosed)));
        assert!(matches!(tm.get(&users(), b"k"), Err(CoreError::DatabaseClosed)));
    }
}

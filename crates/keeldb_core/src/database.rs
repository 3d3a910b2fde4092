//! Database and table handles.

use crate::block::{BlockStore, BlockUsage};
use crate::config::Config;
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::stats::StatsSnapshot;
use crate::transaction::{RecoveryReport, TransactionManager, VerifyReport, WriteTransaction};
use crate::types::{DatabasePath, Entry, Lsn, TableTag};
use crate::wal::WalManager;
use keeldb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Engines currently open in this process, by canonical root path.
///
/// Opening a root that already has a live engine hands out that engine, so
/// recovery runs once per root no matter how many handles exist.
static OPEN_ROOTS: Mutex<BTreeMap<PathBuf, Weak<Engine>>> =
    parking_lot::const_mutex(BTreeMap::new());

/// One open database root: its lock, files and transaction manager.
struct Engine {
    config: Config,
    root: Option<PathBuf>,
    /// Holds the directory lock until close.
    dir: Mutex<Option<DatabaseDir>>,
    manager: TransactionManager,
    recovery: RecoveryReport,
}

impl Engine {
    fn start(
        config: Config,
        root: Option<PathBuf>,
        dir: Option<DatabaseDir>,
        wal_backend: Box<dyn StorageBackend>,
        block_backend: Box<dyn StorageBackend>,
    ) -> CoreResult<Arc<Self>> {
        let blocks = BlockStore::open(block_backend, config.max_blocks)
            .map_err(CoreError::into_recovery_failed)?;
        let wal = WalManager::new(wal_backend, config.sync_on_commit);
        let manager = TransactionManager::new(blocks, wal, &config);
        let recovery = manager.recover()?;

        Ok(Arc::new(Self {
            config,
            root,
            dir: Mutex::new(dir),
            manager,
            recovery,
        }))
    }

    fn close(&self) -> CoreResult<()> {
        let result = self.manager.close();
        if self.manager.is_closed() && self.dir.lock().take().is_some() {
            tracing::debug!(root = ?self.root, "released database lock");
        }
        result
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(root = ?self.root, error = %e, "close on drop failed");
        }
    }
}

/// Handle to an open database root.
///
/// Cheap to clone; every clone, and every [`Table`] made from it, shares one
/// engine. The engine checkpoints and releases the directory lock when
/// [`Database::close`] is called or the last handle is dropped.
///
/// ```rust,ignore
/// use keeldb_core::Database;
///
/// let db = Database::open("/tmp/db1")?;
/// let users = db.table("users")?;
/// users.write(b"alice", b"30")?;
/// assert_eq!(users.read(b"alice")?, Some(b"30".to_vec()));
///
/// db.transaction(|txn| {
///     txn.put(users.tag(), b"bob", b"25")?;
///     txn.delete(users.tag(), b"alice")
/// })?;
/// db.close()?;
/// ```
#[derive(Clone)]
pub struct Database {
    engine: Arc<Engine>,
}

impl Database {
    /// Opens or creates the database rooted at `path`.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an empty or malformed path
    /// - `PathUnavailable` if the directory cannot be created or accessed
    /// - `DatabaseLocked` if another process has the root open
    /// - `RecoveryFailed` if the files cannot be recovered
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens or creates the database rooted at `path` with `config`.
    ///
    /// If this process already has the root open, the live engine is
    /// returned and `config` is ignored; a differing `config` is logged at
    /// debug level. A live engine that was poisoned by an interrupted commit
    /// or checkpoint is closed instead, and a fresh engine recovers the root.
    /// Handles still holding the poisoned engine then report
    /// `DatabaseClosed`.
    ///
    /// # Errors
    ///
    /// As [`Database::open`], plus `WriterBusy` if a poisoned engine cannot
    /// be closed because a write transaction still holds it.
    pub fn open_with_config(path: impl AsRef<Path>, config: Config) -> CoreResult<Self> {
        let path = DatabasePath::new(path)?;

        let mut roots = OPEN_ROOTS.lock();
        roots.retain(|_, engine| engine.strong_count() > 0);

        if let Ok(canonical) = path.as_path().canonicalize() {
            if let Some(engine) = roots.get(&canonical).and_then(Weak::upgrade) {
                if engine.manager.is_poisoned() {
                    tracing::warn!(root = %canonical.display(), "replacing poisoned engine");
                    engine.close()?;
                    roots.remove(&canonical);
                } else if !engine.manager.is_closed() {
                    if engine.config != config {
                        tracing::debug!(
                            root = %canonical.display(),
                            "root already open; keeping its existing config"
                        );
                    }
                    tracing::debug!(root = %canonical.display(), "reusing open engine");
                    return Ok(Self { engine });
                }
            }
        }

        let dir = DatabaseDir::open(&path, config.create_if_missing)?;
        let canonical = dir
            .path()
            .canonicalize()
            .map_err(|e| CoreError::path_unavailable(dir.path(), e))?;
        let wal_backend = open_file(&dir.wal_path())?;
        let block_backend = open_file(&dir.block_path())?;
        dir.sync()?;

        let engine = Engine::start(
            config,
            Some(canonical.clone()),
            Some(dir),
            Box::new(wal_backend),
            Box::new(block_backend),
        )?;
        roots.insert(canonical.clone(), Arc::downgrade(&engine));

        tracing::info!(
            root = %canonical.display(),
            replayed = engine.recovery.replayed,
            "opened database"
        );
        Ok(Self { engine })
    }

    /// Opens a database over caller-supplied backends.
    ///
    /// The engine is not registered and takes no directory lock; the caller
    /// owns exclusivity of the backends.
    pub fn open_with_backends(
        config: Config,
        wal_backend: Box<dyn StorageBackend>,
        block_backend: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        let engine = Engine::start(config, None, None, wal_backend, block_backend)?;
        Ok(Self { engine })
    }

    /// Opens an empty database held in memory.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_with_backends(
            Config::default(),
            Box::new(InMemoryBackend::new()),
            Box::new(InMemoryBackend::new()),
        )
    }

    fn manager(&self) -> &TransactionManager {
        &self.engine.manager
    }

    /// Returns a handle to the table named `tag`.
    ///
    /// Tables spring into existence on their first write and disappear from
    /// [`Database::tables`] when their last key is deleted.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `tag` is not a valid table tag.
    pub fn table(&self, tag: &str) -> CoreResult<Table> {
        Ok(Table {
            db: Some(self.clone()),
            root: self.engine.root.clone(),
            tag: TableTag::new(tag)?,
        })
    }

    /// Tables holding at least one key, in tag order.
    pub fn tables(&self) -> CoreResult<Vec<TableTag>> {
        self.manager().tables()
    }

    /// Begins a write transaction.
    ///
    /// # Errors
    ///
    /// Returns `WriterBusy` if another write transaction is open.
    pub fn begin(&self) -> CoreResult<WriteTransaction<'_>> {
        self.manager().begin()
    }

    /// Begins a write transaction, waiting up to `timeout` for the writer
    /// slot.
    pub fn begin_wait(&self, timeout: Duration) -> CoreResult<WriteTransaction<'_>> {
        self.manager().begin_wait(timeout)
    }

    /// Runs `f` in a write transaction, committing if it returns `Ok` and
    /// aborting otherwise. Waits for the writer slot like [`Table::write`].
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> CoreResult<T>,
    {
        let mut txn = self.begin_wait(self.engine.config.writer_wait)?;
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }

    /// Forces a checkpoint.
    pub fn checkpoint(&self) -> CoreResult<()> {
        self.manager().checkpoint()
    }

    /// Checkpoints and closes the engine for every handle sharing it, then
    /// releases the directory lock. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `WriterBusy` if a write transaction stays open past the
    /// configured wait, or the checkpoint's error. The engine is closed
    /// either way unless the writer slot could not be taken.
    pub fn close(&self) -> CoreResult<()> {
        self.engine.close()
    }

    /// Whether the engine is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.manager().is_closed()
    }

    /// Whether an interrupted commit left the engine unusable. A poisoned
    /// engine must be closed and reopened.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.manager().is_poisoned()
    }

    /// Canonical root directory, or `None` for backend-only databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.engine.root.as_deref()
    }

    /// Configuration the engine was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.engine.config
    }

    /// What recovery did when the engine opened.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.engine.recovery
    }

    /// Operation counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.manager().stats().snapshot()
    }

    /// Block allocation figures.
    #[must_use]
    pub fn block_usage(&self) -> BlockUsage {
        self.manager().block_usage()
    }

    /// Current WAL size in bytes.
    pub fn wal_size(&self) -> CoreResult<u64> {
        self.manager().wal_size()
    }

    /// LSN of the last published commit.
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        self.manager().last_lsn()
    }

    /// Checks every tree, value chain and block checksum.
    pub fn verify(&self) -> CoreResult<VerifyReport> {
        self.manager().verify()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("root", &self.engine.root)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

fn open_file(path: &Path) -> CoreResult<FileBackend> {
    FileBackend::open_with_create_dirs(path)
        .map_err(|e| CoreError::path_unavailable(path, io::Error::other(e)))
}

/// Handle bound to one table of one database root.
///
/// Every write is its own durable transaction. Reads see the last committed
/// state and never wait on an open writer.
#[derive(Clone)]
pub struct Table {
    db: Option<Database>,
    /// Root to reopen from; `None` for unregistered engines.
    root: Option<PathBuf>,
    tag: TableTag,
}

impl Table {
    /// Opens the database at `path` and returns its table `tag`.
    ///
    /// # Errors
    ///
    /// As [`Database::open`], plus `InvalidArgument` for a bad tag.
    pub fn open(path: impl AsRef<Path>, tag: &str) -> CoreResult<Self> {
        Database::open(path)?.table(tag)
    }

    /// The table's tag.
    #[must_use]
    pub fn tag(&self) -> &TableTag {
        &self.tag
    }

    /// The database this table belongs to.
    pub fn database(&self) -> CoreResult<&Database> {
        self.db.as_ref().ok_or(CoreError::DatabaseClosed)
    }

    fn manager(&self) -> CoreResult<&TransactionManager> {
        Ok(self.database()?.manager())
    }

    /// Durably stores `value` under `key`.
    ///
    /// Waits up to the configured `writer_wait` for the writer slot. On
    /// error the key keeps its previous state.
    ///
    /// # Errors
    ///
    /// `WriterBusy`, `StorageFull`, `CorruptBlock` or `CommitFailed`, and
    /// `InvalidArgument` for oversized keys or values.
    pub fn write(&self, key: &[u8], value: &[u8]) -> CoreResult<()> {
        let db = self.database()?;
        let mut txn = db.begin_wait(db.config().writer_wait)?;
        txn.put(&self.tag, key, value)?;
        txn.commit()?;
        Ok(())
    }

    /// Reads the committed value of `key`.
    pub fn read(&self, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.read_entry(key)?.map(|e| e.value))
    }

    /// Reads the committed value of `key` with its last-update time.
    pub fn read_entry(&self, key: &[u8]) -> CoreResult<Option<Entry>> {
        self.manager()?.get(&self.tag, key)
    }

    /// Durably removes `key`. Returns whether it was present; removing an
    /// absent key writes nothing.
    pub fn delete(&self, key: &[u8]) -> CoreResult<bool> {
        let db = self.database()?;
        let mut txn = db.begin_wait(db.config().writer_wait)?;
        if !db.manager().contains(&self.tag, key)? {
            return Ok(false);
        }
        txn.delete(&self.tag, key)?;
        txn.commit()?;
        Ok(true)
    }

    /// Whether `key` has a committed value.
    pub fn contains(&self, key: &[u8]) -> CoreResult<bool> {
        self.manager()?.contains(&self.tag, key)
    }

    /// All keys, in ascending order.
    pub fn keys(&self) -> CoreResult<Vec<Vec<u8>>> {
        self.manager()?
            .keys(&self.tag, Bound::Unbounded, Bound::Unbounded)
    }

    /// Key-value pairs with keys inside the bounds, in ascending order.
    ///
    /// ```rust,ignore
    /// use std::ops::Bound;
    /// let page = table.range(Bound::Included(b"user:"), Bound::Excluded(b"user;"))?;
    /// ```
    pub fn range(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> CoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .manager()?
            .scan(&self.tag, lower, upper)?
            .into_iter()
            .map(|(key, entry)| (key, entry.value))
            .collect())
    }

    /// Number of keys.
    pub fn len(&self) -> CoreResult<u64> {
        self.manager()?.count(&self.tag)
    }

    /// Whether the table has no keys.
    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Whether this handle is usable.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.db.as_ref().is_some_and(Database::is_open)
    }

    /// Reacquires an engine for this table's root after [`Table::close`],
    /// or after the engine was closed under it. Does nothing while open.
    ///
    /// A root that is still open elsewhere in the process hands back its
    /// live engine, so no recovery runs twice.
    ///
    /// # Errors
    ///
    /// As [`Database::open`], and `InvalidOperation` for tables of an
    /// in-memory or backend-supplied database.
    pub fn reopen(&mut self) -> CoreResult<()> {
        if self.is_open() {
            return Ok(());
        }
        let root = self.root.as_ref().ok_or_else(|| {
            CoreError::invalid_operation("table has no database root to reopen")
        })?;
        let db = Database::open(root)?;
        tracing::debug!(root = %root.display(), tag = %self.tag.as_str(), "reopened table");
        self.db = Some(db);
        Ok(())
    }

    /// Releases this handle. Idempotent.
    ///
    /// If no other handle shares the engine, the engine is checkpointed and
    /// closed too, releasing the directory lock.
    pub fn close(&mut self) -> CoreResult<()> {
        let Some(db) = self.db.take() else {
            return Ok(());
        };
        if Arc::strong_count(&db.engine) == 1 {
            if let Err(e) = db.close() {
                self.db = Some(db);
                return Err(e);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("tag", &self.tag)
            .field("open", &self.is_open())
            .finish()
    }
}

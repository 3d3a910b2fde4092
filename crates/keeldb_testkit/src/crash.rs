//! Crash simulation and fault injection.
//!
//! A [`SimulatedDisk`] holds two images of one file: the bytes the OS has
//! accepted (`volatile`) and the bytes a `sync` has made durable. Reads and
//! writes go to the volatile image; [`SimulatedDisk::crash`] throws it away
//! and keeps only what was synced, the way a power cut would. Backends
//! handed out before a crash stop working, so the engine that was running
//! cannot touch the disk afterwards.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keeldb_testkit::crash::CrashRig;
//!
//! let rig = CrashRig::new();
//! let db = rig.open()?;
//! db.table("t")?.write(b"k", b"v")?;
//! rig.crash();
//! let db = rig.open()?;
//! assert_eq!(db.recovery_report().replayed, 1);
//! ```

use keeldb_core::{Config, CoreResult, Database};
use keeldb_storage::{StorageBackend, StorageError, StorageResult};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;

#[derive(Debug, Default)]
struct DiskState {
    volatile: Vec<u8>,
    durable: Vec<u8>,
    /// Bumped by every crash; backends from an older epoch are dead.
    epoch: u64,
    syncs: u64,
    fail_sync: bool,
    max_size: Option<u64>,
}

/// One simulated file with separate volatile and durable contents.
///
/// Cloning yields another handle to the same disk.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDisk {
    state: Arc<Mutex<DiskState>>,
}

impl SimulatedDisk {
    /// Creates an empty disk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a backend over the disk's current contents.
    pub fn backend(&self) -> CrashBackend {
        let epoch = self.state.lock().epoch;
        CrashBackend {
            disk: self.clone(),
            epoch,
        }
    }

    /// Loses every unsynced byte.
    pub fn crash(&self) {
        self.crash_keeping_unsynced(0);
    }

    /// Loses unsynced bytes except the first `keep` bytes appended past the
    /// durable image, modelling a write that partly reached the platter.
    pub fn crash_keeping_unsynced(&self, keep: usize) {
        let mut state = self.state.lock();
        let mut image = state.durable.clone();
        if state.volatile.len() > image.len() && state.volatile.starts_with(&image) {
            let extra = &state.volatile[image.len()..];
            image.extend_from_slice(&extra[..keep.min(extra.len())]);
        }
        state.volatile = image;
        state.epoch += 1;
    }

    /// Makes every `sync` fail until turned off.
    pub fn fail_sync(&self, fail: bool) {
        self.state.lock().fail_sync = fail;
    }

    /// Rejects writes that would grow the file past `max` bytes.
    pub fn limit_size(&self, max: Option<u64>) {
        self.state.lock().max_size = max;
    }

    /// Size of the volatile image.
    pub fn volatile_len(&self) -> usize {
        self.state.lock().volatile.len()
    }

    /// Size of the durable image.
    pub fn durable_len(&self) -> usize {
        self.state.lock().durable.len()
    }

    /// Copy of the durable image.
    pub fn durable_bytes(&self) -> Vec<u8> {
        self.state.lock().durable.clone()
    }

    /// Overwrites one durable byte, for corruption tests.
    pub fn corrupt_durable(&self, offset: usize, xor: u8) {
        let mut state = self.state.lock();
        if let Some(byte) = state.durable.get_mut(offset) {
            *byte ^= xor;
        }
        if let Some(byte) = state.volatile.get_mut(offset) {
            *byte ^= xor;
        }
    }

    /// Number of successful syncs so far.
    pub fn sync_count(&self) -> u64 {
        self.state.lock().syncs
    }
}

/// [`StorageBackend`] view of a [`SimulatedDisk`].
#[derive(Debug)]
pub struct CrashBackend {
    disk: SimulatedDisk,
    epoch: u64,
}

impl CrashBackend {
    fn with_state<T>(
        &self,
        op: impl FnOnce(&mut DiskState) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut state = self.disk.state.lock();
        if state.epoch != self.epoch {
            return Err(StorageError::Closed);
        }
        op(&mut state)
    }
}

fn check_growth(state: &DiskState, end: u64) -> StorageResult<()> {
    match state.max_size {
        Some(max) if end > max && end > state.volatile.len() as u64 => Err(StorageError::Io(
            io::Error::other("simulated full disk: no space left on device"),
        )),
        _ => Ok(()),
    }
}

impl StorageBackend for CrashBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.with_state(|state| {
            let size = state.volatile.len() as u64;
            let end = offset.checked_add(len as u64).filter(|&end| end <= size);
            match end {
                Some(end) => Ok(state.volatile[offset as usize..end as usize].to_vec()),
                None => Err(StorageError::ReadPastEnd { offset, len, size }),
            }
        })
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.with_state(|state| {
            let offset = state.volatile.len() as u64;
            check_growth(state, offset + data.len() as u64)?;
            state.volatile.extend_from_slice(data);
            Ok(offset)
        })
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.with_state(|state| {
            let size = state.volatile.len() as u64;
            if offset > size {
                return Err(StorageError::WriteGap { offset, size });
            }
            let end = offset + data.len() as u64;
            check_growth(state, end)?;
            if end > size {
                state.volatile.resize(end as usize, 0);
            }
            state.volatile[offset as usize..end as usize].copy_from_slice(data);
            Ok(())
        })
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.with_state(|_| Ok(()))
    }

    fn size(&self) -> StorageResult<u64> {
        self.with_state(|state| Ok(state.volatile.len() as u64))
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.with_state(|state| {
            if state.fail_sync {
                return Err(StorageError::Io(io::Error::other("simulated fsync failure")));
            }
            state.durable = state.volatile.clone();
            state.syncs += 1;
            Ok(())
        })
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.with_state(|state| {
            let size = state.volatile.len() as u64;
            if new_size > size {
                return Err(StorageError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cannot truncate to {new_size} bytes, storage holds only {size}"),
                )));
            }
            state.volatile.truncate(new_size as usize);
            Ok(())
        })
    }
}

/// A database's pair of simulated disks: the WAL and the block file.
#[derive(Debug, Clone)]
pub struct CrashRig {
    /// Disk holding the WAL.
    pub wal: SimulatedDisk,
    /// Disk holding the block file.
    pub blocks: SimulatedDisk,
    config: Config,
}

impl Default for CrashRig {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashRig {
    /// Creates a rig with fresh disks and automatic checkpoints disabled,
    /// so the WAL keeps every commit until a checkpoint is requested.
    pub fn new() -> Self {
        Self::with_config(Config::default().checkpoint_wal_bytes(0))
    }

    /// Creates a rig whose databases open with `config`.
    pub fn with_config(config: Config) -> Self {
        Self {
            wal: SimulatedDisk::new(),
            blocks: SimulatedDisk::new(),
            config,
        }
    }

    /// Opens a database over the disks' current contents, running recovery.
    pub fn open(&self) -> CoreResult<Database> {
        Database::open_with_backends(
            self.config.clone(),
            Box::new(self.wal.backend()),
            Box::new(self.blocks.backend()),
        )
    }

    /// Cuts power to both disks.
    pub fn crash(&self) {
        self.wal.crash();
        self.blocks.crash();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_keeps_only_synced_bytes() {
        let disk = SimulatedDisk::new();
        let mut backend = disk.backend();
        backend.append(b"durable").unwrap();
        backend.sync().unwrap();
        backend.append(b" volatile").unwrap();
        assert_eq!(disk.volatile_len(), 16);

        disk.crash();
        assert_eq!(disk.volatile_len(), 7);
        assert_eq!(disk.backend().read_at(0, 7).unwrap(), b"durable");
    }

    #[test]
    fn old_backends_die_at_crash() {
        let disk = SimulatedDisk::new();
        let mut old = disk.backend();
        old.append(b"x").unwrap();
        disk.crash();
        assert!(matches!(old.append(b"y"), Err(StorageError::Closed)));
        assert!(matches!(old.size(), Err(StorageError::Closed)));
    }

    #[test]
    fn partial_unsynced_tail_survives() {
        let disk = SimulatedDisk::new();
        let mut backend = disk.backend();
        backend.append(b"abc").unwrap();
        backend.sync().unwrap();
        backend.append(b"defgh").unwrap();
        disk.crash_keeping_unsynced(2);
        assert_eq!(disk.backend().read_at(0, 5).unwrap(), b"abcde");
    }

    #[test]
    fn injected_faults() {
        let disk = SimulatedDisk::new();
        let mut backend = disk.backend();
        disk.fail_sync(true);
        assert!(backend.sync().is_err());
        disk.fail_sync(false);
        backend.sync().unwrap();
        assert_eq!(disk.sync_count(), 1);

        disk.limit_size(Some(4));
        backend.append(b"1234").unwrap();
        assert!(backend.append(b"5").is_err());
        backend.write_at(0, b"ab").unwrap();
        assert_eq!(disk.volatile_len(), 4);
    }

    #[test]
    fn rig_recovers_synced_commits() {
        let rig = CrashRig::new();
        let db = rig.open().unwrap();
        db.table("t").unwrap().write(b"k", b"v").unwrap();
        rig.crash();
        drop(db);

        let db = rig.open().unwrap();
        assert_eq!(db.recovery_report().replayed, 1);
        assert_eq!(
            db.table("t").unwrap().read(b"k").unwrap(),
            Some(b"v".to_vec())
        );
    }
}

//! WAL manager: append, flush, replay, checkpoint.

use crate::checksum::compute_crc32;
use crate::error::{CoreError, CoreResult};
use crate::types::{Lsn, TransactionId};
use crate::wal::iterator::{WalRecordIterator, WalReplay};
use crate::wal::record::{Mutation, WalRecord, CRC_SIZE, HEADER_SIZE, WAL_MAGIC, WAL_VERSION};
use keeldb_storage::StorageBackend;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Owns the log file.
///
/// Appends are serialized by the transaction manager's writer slot; the
/// internal mutex only keeps readers (`iter`, `size`) consistent with them.
pub struct WalManager {
    backend: Mutex<Box<dyn StorageBackend>>,
    /// fsync on flush rather than just pushing to the OS.
    sync_on_flush: bool,
    /// LSN of the last record appended (0 if none yet).
    last_lsn: AtomicU64,
    /// Byte offset where the most recent append started.
    last_append_offset: AtomicU64,
}

impl WalManager {
    /// Creates a WAL manager over `backend`.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_flush: bool) -> Self {
        Self {
            backend: Mutex::new(backend),
            sync_on_flush,
            last_lsn: AtomicU64::new(0),
            last_append_offset: AtomicU64::new(0),
        }
    }

    /// Appends one record carrying all of `mutations` and returns its LSN.
    ///
    /// The record is not durable until [`WalManager::flush`] returns. If the
    /// write itself fails, any partial bytes are cut off again.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for oversized keys or values, or a storage
    /// error.
    pub fn append(&self, txid: TransactionId, mutations: &[Mutation]) -> CoreResult<Lsn> {
        let lsn = Lsn::new(self.last_lsn.load(Ordering::Acquire)).next();
        let record = WalRecord {
            lsn,
            txid,
            mutations: mutations.to_vec(),
        };
        let frame = encode_frame(&record)?;

        let mut backend = self.backend.lock();
        let before = backend.size()?;
        if let Err(e) = backend.append(&frame) {
            if let Err(cleanup) = backend.truncate(before) {
                tracing::warn!(error = %cleanup, "failed to cut partial WAL record");
            }
            return Err(e.into());
        }

        self.last_append_offset.store(before, Ordering::Release);
        self.last_lsn.store(lsn.as_u64(), Ordering::Release);
        tracing::debug!(%lsn, %txid, bytes = frame.len(), "appended WAL record");
        Ok(lsn)
    }

    /// Forces every appended record to stable storage.
    ///
    /// # Errors
    ///
    /// Returns a storage error if durability cannot be confirmed.
    pub fn flush(&self) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        if self.sync_on_flush {
            backend.sync()?;
        } else {
            backend.flush()?;
        }
        Ok(())
    }

    /// Removes the record appended as `lsn`, provided it is still the last
    /// one. Used when a commit fails before its flush is confirmed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `lsn` is not the tail record, or a
    /// storage error.
    pub fn revert_last(&self, lsn: Lsn) -> CoreResult<()> {
        if self.last_lsn() != lsn {
            return Err(CoreError::invalid_operation(format!(
                "cannot revert {lsn}: last record is {}",
                self.last_lsn()
            )));
        }
        let offset = self.last_append_offset.load(Ordering::Acquire);
        self.backend.lock().truncate(offset)?;
        self.last_lsn.store(lsn.as_u64() - 1, Ordering::Release);
        Ok(())
    }

    /// Returns the current WAL size in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// LSN of the last appended record.
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        Lsn::new(self.last_lsn.load(Ordering::Acquire))
    }

    /// Continues numbering after `lsn`. Called once recovery knows the
    /// highest LSN ever written.
    pub fn resume_after(&self, lsn: Lsn) {
        self.last_lsn.fetch_max(lsn.as_u64(), Ordering::AcqRel);
    }

    /// Streams every record in the log as `(offset, record)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be accessed.
    pub fn iter(&self) -> CoreResult<WalRecordIterator<'_>> {
        WalRecordIterator::new(self.backend.lock(), 0)
    }

    /// Reads all records from the WAL. Prefer [`WalManager::iter`] for
    /// large logs.
    pub fn read_all(&self) -> CoreResult<Vec<(u64, WalRecord)>> {
        self.iter()?.collect()
    }

    /// Lazily yields, in LSN order, the commits not covered by a checkpoint
    /// at `after`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be accessed.
    pub fn replay(&self, after: Lsn) -> CoreResult<WalReplay<'_>> {
        Ok(WalReplay::new(self.iter()?, after))
    }

    /// Declares every record up to `up_to` applied to the block store.
    ///
    /// Space is reclaimed when the checkpoint covers the whole log; a
    /// partial checkpoint leaves the file alone, since replay already skips
    /// records at or below the superblock's checkpoint LSN.
    ///
    /// # Errors
    ///
    /// Returns a storage error if truncation fails.
    pub fn checkpoint(&self, up_to: Lsn) -> CoreResult<()> {
        if up_to >= self.last_lsn() {
            self.clear()?;
        } else {
            tracing::debug!(%up_to, last = %self.last_lsn(), "partial WAL checkpoint, keeping log");
        }
        Ok(())
    }

    /// Truncates the WAL to `offset`, e.g. to drop a torn tail, and syncs
    /// the new length.
    pub fn truncate(&self, offset: u64) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        backend.truncate(offset)?;
        backend.sync()?;
        Ok(())
    }

    /// Truncates the WAL to zero bytes.
    pub fn clear(&self) -> CoreResult<()> {
        self.truncate(0)
    }
}

fn encode_frame(record: &WalRecord) -> CoreResult<Vec<u8>> {
    let payload = record.encode_payload()?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::invalid_argument("WAL record payload too large"))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&WAL_MAGIC);
    data.extend_from_slice(&WAL_VERSION.to_le_bytes());
    data.push(record.record_type().as_byte());
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&payload);

    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("sync_on_flush", &self.sync_on_flush)
            .field("last_lsn", &self.last_lsn())
            .finish_non_exhaustive()
    }
}

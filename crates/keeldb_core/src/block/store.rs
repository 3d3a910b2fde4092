//! Block allocation, checksummed reads and writes, free-list bookkeeping.

use crate::checksum::compute_crc32;
use crate::error::{CoreError, CoreResult};
use crate::types::BlockId;
use keeldb_storage::StorageBackend;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};

/// Size of every block in the file, superblock included.
pub const BLOCK_SIZE: usize = 4096;

/// Per-block header: crc32 (4) + payload length (4).
const BLOCK_HEADER: usize = 8;

/// Largest payload a single block can carry.
pub const BLOCK_PAYLOAD: usize = BLOCK_SIZE - BLOCK_HEADER;

/// Block accounting at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockUsage {
    /// Blocks in the file, superblock included.
    pub total: u64,
    /// Blocks ready for reuse.
    pub free: u64,
    /// Blocks released since the last checkpoint that the durable
    /// superblock still references.
    pub pending: u64,
}

/// Free-list state.
///
/// A block the durable superblock can reach must not be overwritten before
/// the next checkpoint, so releasing it only parks it in `deferred`. Blocks
/// handed out since the last checkpoint are tracked in `fresh` and go
/// straight back to `free`.
#[derive(Debug, Default)]
struct Allocator {
    block_count: u64,
    free: BTreeSet<BlockId>,
    fresh: HashSet<BlockId>,
    deferred: Vec<BlockId>,
}

/// Fixed-size block storage over one [`StorageBackend`].
///
/// Callers coordinate exclusive intent: only the writer holding the
/// transaction manager's slot allocates, writes or frees.
pub struct BlockStore {
    backend: RwLock<Box<dyn StorageBackend>>,
    alloc: Mutex<Allocator>,
    max_blocks: Option<u64>,
}

impl BlockStore {
    /// Opens a block store over `backend`.
    ///
    /// A trailing partial block (an interrupted growth) is ignored and will
    /// be overwritten by the next allocation.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend size cannot be read.
    pub fn open(backend: Box<dyn StorageBackend>, max_blocks: Option<u64>) -> CoreResult<Self> {
        let block_count = backend.size()? / BLOCK_SIZE as u64;
        Ok(Self {
            backend: RwLock::new(backend),
            alloc: Mutex::new(Allocator {
                block_count,
                ..Allocator::default()
            }),
            max_blocks,
        })
    }

    /// Number of blocks in the file, superblock included.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.alloc.lock().block_count
    }

    /// Returns a free block id, reusing released blocks before growing.
    ///
    /// # Errors
    ///
    /// Returns `StorageFull` if the file cannot grow.
    pub fn allocate(&self) -> CoreResult<BlockId> {
        let mut alloc = self.alloc.lock();
        if let Some(id) = alloc.free.pop_first() {
            alloc.fresh.insert(id);
            return Ok(id);
        }

        let id = BlockId::new(alloc.block_count.max(1));
        if let Some(max) = self.max_blocks {
            if id.as_u64() >= max {
                return Err(CoreError::storage_full(format!(
                    "block file is capped at {max} blocks"
                )));
            }
        }

        self.grow_to(&mut alloc, id)?;
        alloc.fresh.insert(id);
        Ok(id)
    }

    /// Zero-fills blocks up to and including `id`.
    fn grow_to(&self, alloc: &mut Allocator, id: BlockId) -> CoreResult<()> {
        let mut backend = self.backend.write();
        while alloc.block_count <= id.as_u64() {
            let offset = alloc.block_count * BLOCK_SIZE as u64;
            backend
                .write_at(offset, &[0u8; BLOCK_SIZE])
                .map_err(|e| CoreError::storage_full(format!("cannot grow block file: {e}")))?;
            alloc.block_count += 1;
        }
        Ok(())
    }

    /// Reads a block's payload.
    ///
    /// # Errors
    ///
    /// Returns `CorruptBlock` if the id is out of range or the checksum
    /// does not match.
    pub fn read(&self, id: BlockId) -> CoreResult<Vec<u8>> {
        let count = self.block_count();
        if id.as_u64() == 0 || id.as_u64() >= count {
            return Err(CoreError::corrupt_block(
                id,
                format!("outside block file of {count} blocks"),
            ));
        }

        let raw = self
            .backend
            .read()
            .read_at(id.as_u64() * BLOCK_SIZE as u64, BLOCK_SIZE)?;

        let stored_crc = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let len = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
        if len > BLOCK_PAYLOAD {
            return Err(CoreError::corrupt_block(
                id,
                format!("payload length {len} exceeds block"),
            ));
        }

        let computed = compute_crc32(&raw[4..BLOCK_HEADER + len]);
        if stored_crc != computed {
            return Err(CoreError::corrupt_block(
                id,
                format!("checksum mismatch: stored {stored_crc:08x}, computed {computed:08x}"),
            ));
        }

        Ok(raw[BLOCK_HEADER..BLOCK_HEADER + len].to_vec())
    }

    /// Overwrites a block in place.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a payload larger than
    /// [`BLOCK_PAYLOAD`] or a block that was never allocated, or a storage
    /// error.
    pub fn write(&self, id: BlockId, payload: &[u8]) -> CoreResult<()> {
        if payload.len() > BLOCK_PAYLOAD {
            return Err(CoreError::invalid_argument(format!(
                "block payload of {} bytes exceeds {BLOCK_PAYLOAD}",
                payload.len()
            )));
        }
        let count = self.block_count();
        if id.as_u64() == 0 || id.as_u64() >= count {
            return Err(CoreError::invalid_argument(format!(
                "{id} is outside block file of {count} blocks"
            )));
        }

        let mut frame = vec![0u8; BLOCK_SIZE];
        frame[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        frame[BLOCK_HEADER..BLOCK_HEADER + payload.len()].copy_from_slice(payload);
        let crc = compute_crc32(&frame[4..BLOCK_HEADER + payload.len()]);
        frame[0..4].copy_from_slice(&crc.to_le_bytes());

        self.backend
            .write()
            .write_at(id.as_u64() * BLOCK_SIZE as u64, &frame)?;
        Ok(())
    }

    /// Returns a block to the free list. Content is not zeroed.
    ///
    /// Blocks the durable superblock may still reference become reusable at
    /// the next [`BlockStore::checkpoint_complete`].
    pub fn free(&self, id: BlockId) {
        let mut alloc = self.alloc.lock();
        if alloc.fresh.remove(&id) {
            alloc.free.insert(id);
        } else {
            alloc.deferred.push(id);
        }
    }

    /// Called once a new superblock is durable: every block allocated so
    /// far is now referenced durably, and every deferred release is safe.
    pub fn checkpoint_complete(&self) {
        let mut alloc = self.alloc.lock();
        let deferred = std::mem::take(&mut alloc.deferred);
        alloc.free.extend(deferred);
        alloc.fresh.clear();
    }

    /// Rebuilds the free list from the set of blocks reachable from the
    /// superblock; everything else past block 0 is free.
    pub fn reset_free_list(&self, in_use: &HashSet<BlockId>) {
        let mut alloc = self.alloc.lock();
        alloc.free = (1..alloc.block_count)
            .map(BlockId::new)
            .filter(|id| !in_use.contains(id))
            .collect();
        alloc.fresh.clear();
        alloc.deferred.clear();
    }

    /// Current block accounting.
    #[must_use]
    pub fn usage(&self) -> BlockUsage {
        let alloc = self.alloc.lock();
        BlockUsage {
            total: alloc.block_count,
            free: alloc.free.len() as u64,
            pending: alloc.deferred.len() as u64,
        }
    }

    /// Forces block writes to stable storage.
    pub fn sync(&self) -> CoreResult<()> {
        self.backend.write().sync()?;
        Ok(())
    }

    /// Reads raw bytes from the superblock region.
    pub(crate) fn read_header(&self, offset: usize, len: usize) -> CoreResult<Vec<u8>> {
        Ok(self.backend.read().read_at(offset as u64, len)?)
    }

    /// Writes raw bytes into the superblock region, creating block 0 first
    /// if the file is empty.
    pub(crate) fn write_header(&self, offset: usize, bytes: &[u8]) -> CoreResult<()> {
        let mut alloc = self.alloc.lock();
        if alloc.block_count == 0 {
            self.grow_to(&mut alloc, BlockId::new(0))?;
        }
        self.backend.write().write_at(offset as u64, bytes)?;
        Ok(())
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("usage", &self.usage())
            .field("max_blocks", &self.max_blocks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeldb_storage::InMemoryBackend;

    fn store() -> BlockStore {
        BlockStore::open(Box::new(InMemoryBackend::new()), None).unwrap()
    }

    #[test]
    fn allocate_skips_superblock() {
        let store = store();
        assert_eq!(store.allocate().unwrap(), BlockId::new(1));
        assert_eq!(store.allocate().unwrap(), BlockId::new(2));
        assert_eq!(store.block_count(), 3);
    }

    #[test]
    fn write_read_roundtrip() {
        let store = store();
        let id = store.allocate().unwrap();
        store.write(id, b"node bytes").unwrap();
        assert_eq!(store.read(id).unwrap(), b"node bytes");

        store.write(id, &[7u8; BLOCK_PAYLOAD]).unwrap();
        assert_eq!(store.read(id).unwrap(), vec![7u8; BLOCK_PAYLOAD]);
    }

    #[test]
    fn oversized_payload_rejected() {
        let store = store();
        let id = store.allocate().unwrap();
        assert!(matches!(
            store.write(id, &[0u8; BLOCK_PAYLOAD + 1]),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn unwritten_block_is_corrupt() {
        let store = store();
        let id = store.allocate().unwrap();
        assert!(matches!(
            store.read(id),
            Err(CoreError::CorruptBlock { block, .. }) if block == id
        ));
    }

    #[test]
    fn out_of_range_read_is_corrupt() {
        let store = store();
        assert!(matches!(
            store.read(BlockId::new(9)),
            Err(CoreError::CorruptBlock { .. })
        ));
        assert!(matches!(
            store.read(BlockId::new(0)),
            Err(CoreError::CorruptBlock { .. })
        ));
    }

    #[test]
    fn bit_flip_detected() {
        let store = store();
        let id = store.allocate().unwrap();
        store.write(id, b"payload").unwrap();

        let offset = id.as_u64() as usize * BLOCK_SIZE + BLOCK_HEADER + 2;
        let mut raw = store.read_header(offset, 1).unwrap();
        raw[0] ^= 0x40;
        store.backend.write().write_at(offset as u64, &raw).unwrap();

        assert!(matches!(store.read(id), Err(CoreError::CorruptBlock { .. })));
    }

    #[test]
    fn fresh_blocks_are_reused_immediately() {
        let store = store();
        let a = store.allocate().unwrap();
        let _b = store.allocate().unwrap();
        store.free(a);
        assert_eq!(store.allocate().unwrap(), a);
        assert_eq!(store.block_count(), 3);
    }

    #[test]
    fn durable_blocks_wait_for_checkpoint() {
        let store = store();
        let a = store.allocate().unwrap();
        store.checkpoint_complete();

        store.free(a);
        assert_eq!(store.usage().pending, 1);
        let b = store.allocate().unwrap();
        assert_ne!(a, b);

        store.checkpoint_complete();
        assert_eq!(store.usage().pending, 0);
        assert_eq!(store.allocate().unwrap(), a);
    }

    #[test]
    fn max_blocks_is_storage_full() {
        let store = BlockStore::open(Box::new(InMemoryBackend::new()), Some(3)).unwrap();
        store.allocate().unwrap();
        store.allocate().unwrap();
        assert!(matches!(
            store.allocate(),
            Err(CoreError::StorageFull { .. })
        ));

        // Released blocks are still handed out.
        store.free(BlockId::new(2));
        assert_eq!(store.allocate().unwrap(), BlockId::new(2));
    }

    #[test]
    fn reset_free_list_from_reachable_set() {
        let store = store();
        for _ in 0..5 {
            store.allocate().unwrap();
        }
        let in_use: HashSet<_> = [BlockId::new(2), BlockId::new(4)].into_iter().collect();
        store.reset_free_list(&in_use);

        let usage = store.usage();
        assert_eq!(usage.total, 6);
        assert_eq!(usage.free, 3);
        assert_eq!(store.allocate().unwrap(), BlockId::new(1));
        assert_eq!(store.allocate().unwrap(), BlockId::new(3));
        assert_eq!(store.allocate().unwrap(), BlockId::new(5));
        assert_eq!(store.allocate().unwrap(), BlockId::new(6));
    }

    #[test]
    fn partial_trailing_block_ignored() {
        let backend = InMemoryBackend::with_data(vec![0u8; BLOCK_SIZE * 2 + 100]);
        let store = BlockStore::open(Box::new(backend), None).unwrap();
        assert_eq!(store.block_count(), 2);
        assert_eq!(store.allocate().unwrap(), BlockId::new(2));
        assert_eq!(store.block_count(), 3);
    }
}

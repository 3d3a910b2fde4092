//! Superblock: format identification and checkpoint position.
//!
//! Block 0 holds two slots. Each checkpoint writes the slot the previous
//! one did not, so a torn superblock write always leaves the older slot
//! intact; open picks the valid slot with the higher generation.

use crate::block::store::{BlockStore, BLOCK_SIZE};
use crate::checksum::compute_crc32;
use crate::error::{CoreError, CoreResult};
use crate::types::{BlockId, Lsn, TransactionId};

/// Magic bytes at the start of each superblock slot.
pub const SUPERBLOCK_MAGIC: [u8; 4] = *b"KEEL";

/// Current on-disk format version.
pub const SUPERBLOCK_VERSION: u16 = 1;

const SLOT_SIZE: usize = 512;
const SLOT_OFFSETS: [usize; 2] = [0, BLOCK_SIZE / 2];

/// magic(4) version(2) block_size(4) generation(8) checkpoint_lsn(8)
/// next_txid(8) block_count(8) catalog_root(8)
const ENCODED_LEN: usize = 4 + 2 + 4 + 8 * 5;

/// Durable root of the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Incremented on every checkpoint.
    pub generation: u64,
    /// Every WAL record at or below this LSN is reflected in the blocks.
    pub checkpoint_lsn: Lsn,
    /// First transaction id not yet used.
    pub next_txid: TransactionId,
    /// Blocks in the file when the checkpoint was taken.
    pub block_count: u64,
    /// Root of the catalog tree (table tag -> table root).
    pub catalog_root: Option<BlockId>,
}

impl Superblock {
    /// Superblock of a freshly created database.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            generation: 0,
            checkpoint_lsn: Lsn::default(),
            next_txid: TransactionId::new(1),
            block_count: 1,
            catalog_root: None,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENCODED_LEN + 4);
        buf.extend_from_slice(&SUPERBLOCK_MAGIC);
        buf.extend_from_slice(&SUPERBLOCK_VERSION.to_le_bytes());
        buf.extend_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
        buf.extend_from_slice(&self.generation.to_le_bytes());
        buf.extend_from_slice(&self.checkpoint_lsn.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.next_txid.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.block_count.to_le_bytes());
        buf.extend_from_slice(&BlockId::to_raw(self.catalog_root).to_le_bytes());
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes one slot. `Ok(None)` means the slot is blank or torn;
    /// `Err` means it is intact but unusable by this build.
    fn decode(slot: &[u8]) -> CoreResult<Option<Self>> {
        if slot[0..4] != SUPERBLOCK_MAGIC {
            return Ok(None);
        }
        let stored = u32::from_le_bytes(read_array(slot, ENCODED_LEN));
        if stored != compute_crc32(&slot[..ENCODED_LEN]) {
            return Ok(None);
        }

        let version = u16::from_le_bytes(read_array(slot, 4));
        if version > SUPERBLOCK_VERSION {
            return Err(CoreError::invalid_format(format!(
                "superblock version {version} is newer than supported {SUPERBLOCK_VERSION}"
            )));
        }
        let block_size = u32::from_le_bytes(read_array(slot, 6));
        if block_size as usize != BLOCK_SIZE {
            return Err(CoreError::invalid_format(format!(
                "block size {block_size} does not match {BLOCK_SIZE}"
            )));
        }

        let field = |at: usize| u64::from_le_bytes(read_array(slot, at));
        Ok(Some(Self {
            generation: field(10),
            checkpoint_lsn: Lsn::new(field(18)),
            next_txid: TransactionId::new(field(26)),
            block_count: field(34),
            catalog_root: BlockId::from_raw(field(42)),
        }))
    }

    /// Loads the newest valid superblock.
    ///
    /// Returns `Ok(None)` for a new database: an empty block file, or one
    /// whose first checkpoint never reached disk (both slots zeroed).
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the file has content but neither slot is
    /// valid, or the format is unsupported.
    pub fn load(store: &BlockStore) -> CoreResult<Option<Self>> {
        if store.block_count() == 0 {
            return Ok(None);
        }

        let mut best: Option<Self> = None;
        let mut blank = true;
        for offset in SLOT_OFFSETS {
            let slot = store.read_header(offset, SLOT_SIZE)?;
            blank &= slot.iter().all(|&b| b == 0);
            if let Some(candidate) = Self::decode(&slot)? {
                if best
                    .as_ref()
                    .map_or(true, |b| candidate.generation > b.generation)
                {
                    best = Some(candidate);
                }
            }
        }

        match best {
            Some(sb) => Ok(Some(sb)),
            None if blank => Ok(None),
            None => Err(CoreError::invalid_format("no valid superblock slot")),
        }
    }

    /// Writes this superblock into its slot (chosen by generation) and
    /// syncs the block file.
    pub fn store(&self, store: &BlockStore) -> CoreResult<()> {
        let offset = SLOT_OFFSETS[(self.generation % 2) as usize];
        store.write_header(offset, &self.encode())?;
        store.sync()
    }
}

fn read_array<const N: usize>(slot: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&slot[at..at + N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeldb_storage::InMemoryBackend;

    fn store() -> BlockStore {
        BlockStore::open(Box::new(InMemoryBackend::new()), None).unwrap()
    }

    fn sample(generation: u64) -> Superblock {
        Superblock {
            generation,
            checkpoint_lsn: Lsn::new(generation * 10),
            next_txid: TransactionId::new(generation + 100),
            block_count: 8,
            catalog_root: Some(BlockId::new(3)),
        }
    }

    #[test]
    fn empty_file_has_no_superblock() {
        assert_eq!(Superblock::load(&store()).unwrap(), None);
    }

    #[test]
    fn newest_generation_wins() {
        let store = store();
        sample(1).store(&store).unwrap();
        sample(2).store(&store).unwrap();
        assert_eq!(Superblock::load(&store).unwrap(), Some(sample(2)));

        sample(3).store(&store).unwrap();
        assert_eq!(Superblock::load(&store).unwrap(), Some(sample(3)));
    }

    #[test]
    fn torn_slot_falls_back_to_older() {
        let store = store();
        sample(1).store(&store).unwrap();
        sample(2).store(&store).unwrap();

        // Generation 2 lives in slot 0; tear it.
        store.write_header(12, &[0xFF; 8]).unwrap();
        assert_eq!(Superblock::load(&store).unwrap(), Some(sample(1)));
    }

    #[test]
    fn zeroed_header_is_new_database() {
        let store = store();
        store.write_header(0, &[0u8; 16]).unwrap();
        assert_eq!(store.block_count(), 1);
        assert_eq!(Superblock::load(&store).unwrap(), None);
    }

    #[test]
    fn both_slots_invalid_is_error() {
        let store = store();
        store.write_header(0, b"garbage").unwrap();
        assert!(matches!(
            Superblock::load(&store),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn future_version_rejected() {
        let store = store();
        let mut bytes = sample(1).encode();
        bytes[4] = 9;
        let crc = compute_crc32(&bytes[..ENCODED_LEN]);
        bytes[ENCODED_LEN..].copy_from_slice(&crc.to_le_bytes());
        store.write_header(SLOT_OFFSETS[1], &bytes).unwrap();

        assert!(matches!(
            Superblock::load(&store),
            Err(CoreError::InvalidFormat { .. })
        ));
    }
}

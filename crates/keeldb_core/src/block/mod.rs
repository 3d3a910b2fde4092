//! Block store: fixed-size blocks over one backing file.
//!
//! ```text
//! block 0      superblock (two alternating slots)
//! block 1..n   | crc32 (4) | len (4) | payload (len) | zero padding |
//! ```
//!
//! Blocks are addressed by [`BlockId`](crate::types::BlockId), never by
//! offset. Freed blocks are reused before the file grows.

mod store;
mod superblock;

pub use store::{BlockStore, BlockUsage, BLOCK_PAYLOAD, BLOCK_SIZE};
pub use superblock::{Superblock, SUPERBLOCK_MAGIC, SUPERBLOCK_VERSION};

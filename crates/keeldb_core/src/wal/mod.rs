//! Write-ahead log.
//!
//! Every commit is one record carrying all of the transaction's mutations,
//! so a transaction is in the log entirely or not at all:
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! A record becomes the point of no return once `flush` confirms it. Replay
//! yields records above the superblock's checkpoint LSN in log order, and a
//! checkpoint covering the whole log truncates the file.

mod iterator;
mod record;
mod writer;

pub use iterator::{ReplayedCommit, WalRecordIterator, WalReplay, WalTail};
pub use record::{Mutation, MutationOp, WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
pub use writer::WalManager;

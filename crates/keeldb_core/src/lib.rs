//! # keeldb Core
//!
//! Embedded, durable, single-writer key-value engine.
//!
//! This crate provides:
//! - Block store with checksummed fixed-size blocks and a double superblock
//! - WAL (Write-Ahead Log) holding one record per committed transaction
//! - Copy-on-write B-tree index with overflow chains for large values
//! - Transaction manager with shadow-paging commit and crash recovery
//! - [`Database`] and [`Table`] handles
//!
//! ## Example
//!
//! ```rust,no_run
//! use keeldb_core::Table;
//!
//! let users = Table::open("/tmp/db1", "users")?;
//! users.write(b"alice", b"30")?;
//! users.write(b"bob", b"25")?;
//! assert_eq!(users.read(b"alice")?, Some(b"30".to_vec()));
//! assert_eq!(users.read(b"carol")?, None);
//! # Ok::<(), keeldb_core::CoreError>(())
//! ```
//!
//! ## Durability
//!
//! A write returns only after its WAL record is flushed. Checkpoints write a
//! new superblock and truncate the log; recovery replays what the last
//! checkpoint does not cover.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod block;
pub mod btree;
mod checksum;
mod config;
mod database;
mod dir;
mod error;
pub mod failpoint;
mod stats;
pub mod transaction;
mod types;
pub mod wal;

pub use checksum::compute_crc32;
pub use config::Config;
pub use database::{Database, Table};
pub use dir::{block_path, wal_path, DatabaseDir};
pub use error::{CoreError, CoreResult};
pub use stats::{DatabaseStats, StatsSnapshot};
pub use transaction::{RecoveryReport, VerifyReport, WriteTransaction};
pub use types::{
    BlockId, DatabasePath, Entry, Lsn, TableTag, TransactionId, MAX_KEY_SIZE, MAX_TAG_LEN,
    MAX_VALUE_SIZE,
};

//! # keeldb storage
//!
//! Byte-level storage backends used by keeldb.
//!
//! A backend is an **opaque byte store**: it supports positional reads,
//! appends, positional overwrites, flush/sync and truncation. It never
//! interprets what it holds. The block store in `keeldb_core` lays fixed-size
//! blocks over one backend and the write-ahead log appends framed records to
//! another.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral databases
//! - [`FileBackend`] - Persistent storage over a single OS file
//!
//! ## Example
//!
//! ```rust
//! use keeldb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! backend.write_at(offset, b"HELLO").unwrap();
//! assert_eq!(backend.read_at(0, 11).unwrap(), b"HELLO world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;

//! # keeldb Testkit
//!
//! Test utilities for keeldb.
//!
//! This crate provides:
//! - A simulated disk that separates volatile from durable bytes, so tests
//!   can cut power at any point and reopen what survived
//! - Fault injection for failed syncs and a full disk
//! - Test fixtures and database helpers
//! - Property-based test generators using proptest
//! - Concurrent reader/writer stress helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keeldb_testkit::prelude::*;
//!
//! let rig = CrashRig::new();
//! let db = rig.open().unwrap();
//! db.table("t").unwrap().write(b"k", b"v").unwrap();
//! rig.crash();
//! let db = rig.open().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;

//! Single-writer transactions, commit protocol and recovery.
//!
//! A commit builds new tree versions copy-on-write, logs its mutations and
//! flushes the log, then swaps the new roots in. Readers only ever see a
//! fully published version.

mod manager;
mod state;
mod write;

pub use manager::{RecoveryReport, TransactionManager, VerifyReport};
pub use state::{PendingWrite, Transaction, TransactionState};
pub use write::WriteTransaction;

//! Error types for keeldb core.

use crate::types::BlockId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in keeldb core operations.
///
/// The first six variants form the engine's failure taxonomy: every error a
/// handle caller sees is one of them or an ambient wrapper below.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The database directory cannot be created or accessed.
    #[error("database path unavailable: {}: {source}", path.display())]
    PathUnavailable {
        /// The offending path.
        path: PathBuf,
        /// The underlying filesystem error.
        #[source]
        source: io::Error,
    },

    /// Another writer transaction holds the writer slot.
    #[error("writer busy: another write transaction is open")]
    WriterBusy,

    /// The block file could not grow.
    #[error("storage full: {message}")]
    StorageFull {
        /// What rejected the growth.
        message: String,
    },

    /// A block failed its integrity check.
    #[error("corrupt block {block}: {message}")]
    CorruptBlock {
        /// The block that failed.
        block: BlockId,
        /// Description of the corruption.
        message: String,
    },

    /// Durability of a commit could not be confirmed; the transaction was
    /// rolled back.
    #[error("commit failed: {message}")]
    CommitFailed {
        /// Description of the failure.
        message: String,
    },

    /// Startup recovery failed; the engine refuses to open.
    #[error("recovery failed: {message}")]
    RecoveryFailed {
        /// Description of the failure.
        message: String,
    },

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] keeldb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// WAL is corrupted or invalid.
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Invalid database format or version.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// A caller-supplied value was rejected.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Why the argument was rejected.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The transaction was already committed or aborted.
    #[error("transaction is no longer active")]
    TransactionInactive,

    /// Another process holds the database lock.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// A commit was interrupted after its WAL record became durable; the
    /// in-memory state no longer matches the log. Reopen to recover.
    #[error("database poisoned by an interrupted commit; reopen to recover")]
    Poisoned,
}

impl CoreError {
    /// Creates a path unavailable error.
    pub fn path_unavailable(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::PathUnavailable {
            path: path.into(),
            source,
        }
    }

    /// Creates a storage full error.
    pub fn storage_full(message: impl Into<String>) -> Self {
        Self::StorageFull {
            message: message.into(),
        }
    }

    /// Creates a corrupt block error.
    pub fn corrupt_block(block: BlockId, message: impl Into<String>) -> Self {
        Self::CorruptBlock {
            block,
            message: message.into(),
        }
    }

    /// Creates a commit failed error.
    pub fn commit_failed(message: impl Into<String>) -> Self {
        Self::CommitFailed {
            message: message.into(),
        }
    }

    /// Creates a recovery failed error.
    pub fn recovery_failed(message: impl Into<String>) -> Self {
        Self::RecoveryFailed {
            message: message.into(),
        }
    }

    /// Creates a WAL corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if the caller may simply retry the operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WriterBusy)
    }

    /// Wraps any error raised during startup recovery.
    pub(crate) fn into_recovery_failed(self) -> Self {
        match self {
            Self::RecoveryFailed { .. } => self,
            other => Self::recovery_failed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_writer_busy_is_retryable() {
        assert!(CoreError::WriterBusy.is_retryable());
        assert!(!CoreError::storage_full("disk").is_retryable());
        assert!(!CoreError::commit_failed("fsync").is_retryable());
    }

    #[test]
    fn recovery_wrapping_keeps_message() {
        let err = CoreError::corrupt_block(BlockId::new(7), "checksum").into_recovery_failed();
        match err {
            CoreError::RecoveryFailed { message } => {
                assert!(message.contains("block:7"));
                assert!(message.contains("checksum"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let already = CoreError::recovery_failed("bad superblock").into_recovery_failed();
        assert!(matches!(already, CoreError::RecoveryFailed { message } if message == "bad superblock"));
    }

    #[test]
    fn path_unavailable_display() {
        let err = CoreError::path_unavailable(
            "/nope",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.to_string(), "database path unavailable: /nope: denied");
    }
}

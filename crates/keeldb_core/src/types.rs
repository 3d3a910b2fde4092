//! Core type definitions for keeldb.

use crate::error::{CoreError, CoreResult};
use std::fmt;
use std::path::{Path, PathBuf};

/// Largest accepted key, in bytes.
pub const MAX_KEY_SIZE: usize = 1024;

/// Largest accepted value, in bytes.
pub const MAX_VALUE_SIZE: usize = 16 * 1024 * 1024;

/// Longest accepted table tag, in bytes.
pub const MAX_TAG_LEN: usize = 64;

/// Unique identifier for a transaction.
///
/// Transaction IDs increase monotonically. The next id is persisted at each
/// checkpoint and recovery resumes after the highest id found in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Log sequence number of a WAL record.
///
/// Zero means "nothing logged yet"; the first record gets LSN 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Creates a new LSN.
    #[must_use]
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following LSN.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsn:{}", self.0)
    }
}

/// Identifier of a block in the block file.
///
/// Block 0 holds the superblock and is never handed out by the allocator,
/// so `0` doubles as the on-disk encoding of "no block".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u64);

impl BlockId {
    /// Creates a new block ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Decodes an optional block reference, where 0 means none.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Encodes an optional block reference, where none becomes 0.
    #[must_use]
    pub fn to_raw(block: Option<Self>) -> u64 {
        block.map_or(0, Self::as_u64)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block:{}", self.0)
    }
}

/// Validated root directory of a database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabasePath(PathBuf);

impl DatabasePath {
    /// Validates a database root path.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty path or one containing a NUL
    /// byte, and `PathUnavailable` if the path exists but is not a directory.
    pub fn new(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let text = path.as_os_str();
        if text.is_empty() {
            return Err(CoreError::invalid_argument("database path is empty"));
        }
        if text.as_encoded_bytes().contains(&0) {
            return Err(CoreError::invalid_argument(
                "database path contains a NUL byte",
            ));
        }
        if path.exists() && !path.is_dir() {
            return Err(CoreError::path_unavailable(
                path,
                std::io::Error::new(std::io::ErrorKind::Other, "not a directory"),
            ));
        }
        Ok(Self(path.to_path_buf()))
    }

    /// Returns the path.
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for DatabasePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for DatabasePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Validated name of a logical table inside a database root.
///
/// 1 to 64 bytes drawn from ASCII alphanumerics, `_`, `-` and `.`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableTag(String);

impl TableTag {
    /// Validates a table tag.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the tag is empty, too long or contains a
    /// disallowed character.
    pub fn new(tag: impl Into<String>) -> CoreResult<Self> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(CoreError::invalid_argument("table tag is empty"));
        }
        if tag.len() > MAX_TAG_LEN {
            return Err(CoreError::invalid_argument(format!(
                "table tag is {} bytes, limit is {MAX_TAG_LEN}",
                tag.len()
            )));
        }
        if let Some(bad) = tag
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(CoreError::invalid_argument(format!(
                "table tag {tag:?} contains invalid character {bad:?}"
            )));
        }
        Ok(Self(tag))
    }

    /// Returns the tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the tag bytes, as stored in the catalog.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TableTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored value with its last-update time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The value bytes.
    pub value: Vec<u8>,
    /// Unix milliseconds of the write that stored this value.
    pub updated_at: u64,
}

/// Checks a key against the size limit.
pub(crate) fn check_key(key: &[u8]) -> CoreResult<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(CoreError::invalid_argument(format!(
            "key is {} bytes, limit is {MAX_KEY_SIZE}",
            key.len()
        )));
    }
    Ok(())
}

/// Checks a value against the size limit.
pub(crate) fn check_value(value: &[u8]) -> CoreResult<()> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(CoreError::invalid_argument(format!(
            "value is {} bytes, limit is {MAX_VALUE_SIZE}",
            value.len()
        )));
    }
    Ok(())
}

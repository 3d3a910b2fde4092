//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level byte store.
///
/// Backends know nothing about blocks, log records or keys. The block store
/// addresses a backend with `read_at`/`write_at` at block-aligned offsets;
/// the write-ahead log only ever uses `append`, `truncate` and `sync`.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `write_at` overwrites in place and may extend the store, but never
///   leaves a hole (`offset <= size`)
/// - `read_at` returns exactly the bytes last written at that range
/// - after `sync` returns, every byte written so far survives a crash
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReadPastEnd`](crate::StorageError::ReadPastEnd)
    /// if the range extends beyond the current size, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the storage and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Overwrites `data.len()` bytes at `offset`, growing the storage if the
    /// range ends past the current size.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::WriteGap`](crate::StorageError::WriteGap) if
    /// `offset` is beyond the current size, or an I/O error (a full disk
    /// surfaces here).
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Forces data and metadata to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the storage to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` is greater than the current size or
    /// the truncation fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}

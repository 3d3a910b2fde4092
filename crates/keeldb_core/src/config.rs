//! Database configuration.

use std::time::Duration;

/// Configuration for opening a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Whether to create the database directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether commits fsync the WAL (`true`) or only flush it to the OS.
    pub sync_on_commit: bool,

    /// WAL size in bytes that triggers an automatic checkpoint after a
    /// commit (0 = only checkpoint on close or on request).
    pub checkpoint_wal_bytes: u64,

    /// How long implicit single-key writes wait for the writer slot before
    /// failing with `WriterBusy`.
    pub writer_wait: Duration,

    /// Upper bound on the number of blocks in the block file, superblock
    /// included. Growth past it fails with `StorageFull`.
    pub max_blocks: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            checkpoint_wal_bytes: 4 * 1024 * 1024, // 4 MB
            writer_wait: Duration::from_secs(5),
            max_blocks: None,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to fsync the WAL on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the WAL size that triggers an automatic checkpoint.
    #[must_use]
    pub const fn checkpoint_wal_bytes(mut self, bytes: u64) -> Self {
        self.checkpoint_wal_bytes = bytes;
        self
    }

    /// Sets how long implicit writes wait for the writer slot.
    #[must_use]
    pub const fn writer_wait(mut self, wait: Duration) -> Self {
        self.writer_wait = wait;
        self
    }

    /// Caps the block file at `blocks` blocks.
    #[must_use]
    pub const fn max_blocks(mut self, blocks: u64) -> Self {
        self.max_blocks = Some(blocks);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_commit);
        assert_eq!(config.max_blocks, None);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .create_if_missing(false)
            .sync_on_commit(false)
            .checkpoint_wal_bytes(1024)
            .writer_wait(Duration::from_millis(10))
            .max_blocks(64);

        assert!(!config.create_if_missing);
        assert!(!config.sync_on_commit);
        assert_eq!(config.checkpoint_wal_bytes, 1024);
        assert_eq!(config.writer_wait, Duration::from_millis(10));
        assert_eq!(config.max_blocks, Some(64));
    }
}

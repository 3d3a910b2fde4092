//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases
//! and common test scenarios.

use keeldb_core::{Config, Database, Table};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    /// Root directory, for file-backed databases.
    root: Option<PathBuf>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates a new in-memory test database.
    pub fn memory() -> Self {
        Self {
            db: Database::open_in_memory().expect("Failed to open in-memory database"),
            root: None,
            _temp_dir: None,
        }
    }

    /// Creates a new file-based test database in a fresh temporary
    /// directory.
    pub fn file() -> Self {
        Self::file_with_config(Config::default())
    }

    /// Creates a new file-based test database opened with `config`.
    pub fn file_with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().join("db");
        let db = Database::open_with_config(&root, config).expect("Failed to open file database");

        Self {
            db,
            root: Some(root),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the database root if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Closes the engine and opens the same root again.
    ///
    /// # Panics
    ///
    /// Panics for in-memory databases, or if close or open fails.
    pub fn reopen(&mut self) {
        let root = self.root.clone().expect("Only file databases can reopen");
        self.db.close().expect("Failed to close database");
        self.db = Database::open(&root).expect("Failed to reopen database");
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test with a temporary in-memory database.
///
/// # Example
///
/// ```rust,ignore
/// use keeldb_testkit::with_temp_db;
///
/// #[test]
/// fn my_test() {
///     with_temp_db(|db| {
///         let users = db.table("users").unwrap();
///         users.write(b"k", b"v").unwrap();
///     });
/// }
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::memory();
    f(&test_db.db)
}

/// Runs a test with a temporary file-based database and its root path.
pub fn with_file_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database, &Path) -> R,
{
    let test_db = TestDatabase::file();
    let path = test_db
        .path()
        .expect("File database should have a path")
        .to_path_buf();
    f(&test_db.db, &path)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Key used for entry `i` of a populated table. Big-endian so key order
    /// matches index order.
    pub fn key(i: u32) -> Vec<u8> {
        format!("key-{i:08}").into_bytes()
    }

    /// Value used for entry `i`: sizes cycle through inline and overflow
    /// lengths.
    pub fn value(i: u32) -> Vec<u8> {
        let len = match i % 4 {
            0 => 0,
            1 => 16,
            2 => 600,
            _ => 9_000,
        };
        vec![(i % 251) as u8; len]
    }

    /// Writes `count` entries to `table` and returns the expected contents.
    pub fn populate(table: &Table, count: u32) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let mut expected = BTreeMap::new();
        for i in 0..count {
            table.write(&key(i), &value(i)).expect("Failed to write entry");
            expected.insert(key(i), value(i));
        }
        expected
    }

    /// An in-memory database with one table of `count` entries.
    pub fn populated_database(count: u32) -> (TestDatabase, BTreeMap<Vec<u8>, Vec<u8>>) {
        let test_db = TestDatabase::memory();
        let table = test_db.table("test").expect("Failed to open table");
        let expected = populate(&table, count);
        (test_db, expected)
    }

    /// Full contents of `table` in key order.
    pub fn contents(table: &Table) -> BTreeMap<Vec<u8>, Vec<u8>> {
        table
            .range(std::ops::Bound::Unbounded, std::ops::Bound::Unbounded)
            .expect("Failed to scan table")
            .into_iter()
            .collect()
    }
}

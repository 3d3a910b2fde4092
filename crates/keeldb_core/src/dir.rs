//! Database directory management.
//!
//! ```text
//! <db_path>/
//! ├─ LOCK        # Advisory lock, held while the engine is open
//! ├─ blocks.dat  # Superblock + fixed-size blocks
//! └─ wal.log     # Write-ahead log
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::DatabasePath;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const WAL_FILE: &str = "wal.log";
const BLOCK_FILE: &str = "blocks.dat";

/// Owns a database root directory and its exclusive lock.
///
/// Only one `DatabaseDir` can exist per directory at a time, across
/// processes. The lock is released when the value is dropped.
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens (and optionally creates) a database directory and locks it.
    ///
    /// # Errors
    ///
    /// - `PathUnavailable` if the directory is missing and
    ///   `create_if_missing` is false, or cannot be created or opened
    /// - `DatabaseLocked` if another process holds the lock
    pub fn open(path: &DatabasePath, create_if_missing: bool) -> CoreResult<Self> {
        let path = path.as_path();
        if !path.exists() {
            if !create_if_missing {
                return Err(CoreError::path_unavailable(
                    path,
                    io::Error::new(io::ErrorKind::NotFound, "directory does not exist"),
                ));
            }
            fs::create_dir_all(path).map_err(|e| CoreError::path_unavailable(path, e))?;
            sync_parent(path).map_err(|e| CoreError::path_unavailable(path, e))?;
        }

        if !path.is_dir() {
            return Err(CoreError::path_unavailable(
                path,
                io::Error::new(io::ErrorKind::Other, "not a directory"),
            ));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))
            .map_err(|e| CoreError::path_unavailable(path, e))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the WAL file.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        wal_path(&self.path)
    }

    /// Returns the path to the block file.
    #[must_use]
    pub fn block_path(&self) -> PathBuf {
        block_path(&self.path)
    }

    /// Returns true if neither data file exists yet.
    #[must_use]
    pub fn is_new_database(&self) -> bool {
        !self.block_path().exists() && !self.wal_path().exists()
    }

    /// Fsyncs the directory so newly created files survive a crash.
    pub fn sync(&self) -> CoreResult<()> {
        sync_dir(&self.path)?;
        Ok(())
    }
}

/// Path of the WAL file under a root, for tools that read it without
/// opening the database.
#[must_use]
pub fn wal_path(root: &Path) -> PathBuf {
    root.join(WAL_FILE)
}

/// Path of the block file under a root.
#[must_use]
pub fn block_path(root: &Path) -> PathBuf {
    root.join(BLOCK_FILE)
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

// NTFS journals directory metadata; there is no directory fsync to call.
#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => sync_dir(parent),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn db_path(root: &Path, name: &str) -> DatabasePath {
        DatabasePath::new(root.join(name)).unwrap()
    }

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = db_path(temp.path(), "new_db");

        let dir = DatabaseDir::open(&path, true).unwrap();
        assert!(dir.path().is_dir());
        assert!(dir.is_new_database());
    }

    #[test]
    fn open_missing_without_create_is_path_unavailable() {
        let temp = tempdir().unwrap();
        let result = DatabaseDir::open(&db_path(temp.path(), "missing"), false);
        assert!(matches!(result, Err(CoreError::PathUnavailable { .. })));
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let path = db_path(temp.path(), "locked_db");

        let _first = DatabaseDir::open(&path, true).unwrap();
        let second = DatabaseDir::open(&path, true);
        assert!(matches!(second, Err(CoreError::DatabaseLocked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let path = db_path(temp.path(), "reopen_db");

        drop(DatabaseDir::open(&path, true).unwrap());
        assert!(DatabaseDir::open(&path, true).is_ok());
    }

    #[test]
    fn paths_are_correct() {
        let temp = tempdir().unwrap();
        let path = db_path(temp.path(), "paths_db");

        let dir = DatabaseDir::open(&path, true).unwrap();
        assert_eq!(dir.wal_path(), temp.path().join("paths_db").join("wal.log"));
        assert_eq!(dir.block_path(), temp.path().join("paths_db").join("blocks.dat"));
    }
}

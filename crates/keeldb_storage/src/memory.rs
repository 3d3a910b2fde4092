//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// A storage backend that keeps every byte in memory.
///
/// Used for tests and for databases opened with
/// `Database::open_in_memory`. `flush` and `sync` are no-ops. Clones share
/// the same bytes, so a test can drop an engine and reopen over the same
/// memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend preloaded with `data`, e.g. a disk image captured
    /// before a simulated crash.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a copy of all data in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn write_at(&mut self, offset: u64, new_data: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if offset > size {
            return Err(StorageError::WriteGap { offset, size });
        }

        let start = offset as usize;
        let end = start + new_data.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(new_data);
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;

        if new_size > size {
            return Err(StorageError::truncate_grows(new_size, size));
        }

        data.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn clones_share_bytes() {
        let mut backend = InMemoryBackend::new();
        let view = backend.clone();
        backend.append(b"shared").unwrap();
        assert_eq!(view.data(), b"shared");
    }

    #[test]
    fn memory_new_is_empty() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(backend.data().is_empty());
    }

    #[test]
    fn memory_append_returns_offsets() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 11);
    }

    #[test]
    fn memory_write_at_overwrites_and_extends() {
        let mut backend = InMemoryBackend::with_data(b"abcdef".to_vec());
        backend.write_at(4, b"XYZW").unwrap();
        assert_eq!(backend.data(), b"abcdXYZW");
    }

    #[test]
    fn memory_write_at_gap_fails() {
        let mut backend = InMemoryBackend::new();
        assert!(matches!(
            backend.write_at(1, b"x"),
            Err(StorageError::WriteGap { .. })
        ));
    }

    #[test]
    fn memory_read_at_extending_past_end_fails() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello").unwrap();
        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn memory_truncate() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello world").unwrap();

        backend.truncate(5).unwrap();
        assert_eq!(backend.read_at(0, 5).unwrap(), b"hello");
        assert!(backend.truncate(100).is_err());
    }

    proptest! {
        #[test]
        fn memory_matches_vec_model(
            writes in prop::collection::vec((0usize..64, prop::collection::vec(any::<u8>(), 0..32)), 1..32)
        ) {
            let mut backend = InMemoryBackend::new();
            let mut model: Vec<u8> = Vec::new();

            for (offset, bytes) in writes {
                let offset = offset.min(model.len());
                backend.write_at(offset as u64, &bytes).unwrap();
                if offset + bytes.len() > model.len() {
                    model.resize(offset + bytes.len(), 0);
                }
                model[offset..offset + bytes.len()].copy_from_slice(&bytes);
            }

            prop_assert_eq!(backend.data(), model);
        }
    }
}

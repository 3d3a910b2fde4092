//! Streaming WAL iteration and replay.
//!
//! Records are read through a bounded buffer so replaying a large log never
//! loads it whole.

use crate::checksum::compute_crc32;
use crate::error::{CoreError, CoreResult};
use crate::types::{Lsn, TransactionId};
use crate::wal::record::{
    Mutation, WalRecord, WalRecordType, CRC_SIZE, HEADER_SIZE, WAL_MAGIC, WAL_VERSION,
};
use keeldb_storage::StorageBackend;
use parking_lot::MutexGuard;

/// Read buffer size for streaming iteration.
const READ_BUFFER_SIZE: usize = 64 * 1024; // 64 KB

/// How the log ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalTail {
    /// The last record ended exactly at end of file.
    Clean,
    /// Trailing bytes formed an incomplete or torn record and were ignored.
    Torn,
}

/// A streaming iterator over WAL records, yielding `(offset, record)`.
///
/// Tolerated (treated as end of log):
/// - an incomplete header or payload at end of file
/// - a checksum mismatch on a record that ends exactly at end of file
/// - a zero-filled tail (file extended before its data reached disk)
///
/// Fatal:
/// - bad magic, unknown type, future version or checksum mismatch with more
///   data after the record
pub struct WalRecordIterator<'a> {
    backend: MutexGuard<'a, Box<dyn StorageBackend>>,
    total_size: u64,
    current_offset: u64,
    buffer: Vec<u8>,
    buffer_pos: usize,
    buffer_len: usize,
    finished: bool,
    tail: WalTail,
}

impl<'a> WalRecordIterator<'a> {
    /// Creates an iterator starting at `start_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn new(
        backend: MutexGuard<'a, Box<dyn StorageBackend>>,
        start_offset: u64,
    ) -> CoreResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            current_offset: start_offset,
            buffer: vec![0u8; READ_BUFFER_SIZE],
            buffer_pos: 0,
            buffer_len: 0,
            finished: false,
            tail: WalTail::Clean,
        })
    }

    /// Offset just past the last valid record read so far.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.current_offset
    }

    /// How the log ended; meaningful once the iterator returned `None`.
    #[must_use]
    pub fn tail(&self) -> WalTail {
        self.tail
    }

    /// Ensures `min_bytes` are buffered from the current position. Returns
    /// false if the log holds fewer bytes than that.
    fn ensure_buffered(&mut self, min_bytes: usize) -> CoreResult<bool> {
        let available = self.buffer_len - self.buffer_pos;
        if available >= min_bytes {
            return Ok(true);
        }

        let remaining = (self.total_size - self.current_offset) as usize;
        if remaining < min_bytes {
            return Ok(false);
        }

        if self.buffer_pos > 0 && available > 0 {
            self.buffer.copy_within(self.buffer_pos..self.buffer_len, 0);
        }
        self.buffer_len = available;
        self.buffer_pos = 0;

        if min_bytes > self.buffer.len() {
            self.buffer.resize(min_bytes.next_power_of_two(), 0);
        }

        let to_read = (self.buffer.len() - self.buffer_len).min(remaining - available);
        if to_read > 0 {
            let read_offset = self.current_offset + self.buffer_len as u64;
            let data = self.backend.read_at(read_offset, to_read)?;
            self.buffer[self.buffer_len..self.buffer_len + data.len()].copy_from_slice(&data);
            self.buffer_len += data.len();
        }

        Ok(self.buffer_len - self.buffer_pos >= min_bytes)
    }

    fn rest_is_zero(&self) -> CoreResult<bool> {
        let len = (self.total_size - self.current_offset) as usize;
        let rest = self.backend.read_at(self.current_offset, len)?;
        Ok(rest.iter().all(|&b| b == 0))
    }

    fn end_torn(&mut self) -> Option<(u64, WalRecord)> {
        self.finished = true;
        self.tail = WalTail::Torn;
        None
    }

    fn read_next_record(&mut self) -> CoreResult<Option<(u64, WalRecord)>> {
        if self.finished {
            return Ok(None);
        }

        let start = self.current_offset;
        if start == self.total_size {
            self.finished = true;
            return Ok(None);
        }

        if !self.ensure_buffered(HEADER_SIZE)? {
            return Ok(self.end_torn());
        }

        let header = &self.buffer[self.buffer_pos..self.buffer_pos + HEADER_SIZE];
        if header[0..4] != WAL_MAGIC {
            if self.rest_is_zero()? {
                return Ok(self.end_torn());
            }
            self.finished = true;
            return Err(CoreError::wal_corruption(format!(
                "invalid magic at offset {start}"
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > WAL_VERSION {
            self.finished = true;
            return Err(CoreError::wal_corruption(format!(
                "unsupported version {version} at offset {start}"
            )));
        }

        let type_byte = header[6];
        let Some(record_type) = WalRecordType::from_byte(type_byte) else {
            self.finished = true;
            return Err(CoreError::wal_corruption(format!(
                "unknown record type {type_byte} at offset {start}"
            )));
        };

        let payload_len =
            u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;

        if !self.ensure_buffered(total_len)? {
            return Ok(self.end_torn());
        }

        let payload_start = self.buffer_pos + HEADER_SIZE;
        let payload_end = payload_start + payload_len;
        let mut crc_bytes = [0u8; CRC_SIZE];
        crc_bytes.copy_from_slice(&self.buffer[payload_end..payload_end + CRC_SIZE]);
        let stored_crc = u32::from_le_bytes(crc_bytes);
        let computed_crc = compute_crc32(&self.buffer[self.buffer_pos..payload_end]);

        if stored_crc != computed_crc {
            if start + total_len as u64 == self.total_size {
                return Ok(self.end_torn());
            }
            self.finished = true;
            return Err(CoreError::wal_corruption(format!(
                "checksum mismatch at offset {start}: stored {stored_crc:08x}, computed {computed_crc:08x}"
            )));
        }

        let record =
            WalRecord::decode_payload(record_type, &self.buffer[payload_start..payload_end])?;

        self.buffer_pos += total_len;
        self.current_offset += total_len as u64;

        Ok(Some((start, record)))
    }
}

impl Iterator for WalRecordIterator<'_> {
    type Item = CoreResult<(u64, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.read_next_record() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// A committed transaction read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedCommit {
    /// Log position of the record.
    pub lsn: Lsn,
    /// Transaction that wrote it.
    pub txid: TransactionId,
    /// Mutations in application order.
    pub mutations: Vec<Mutation>,
}

/// Lazy sequence of commits with `lsn > after`, in log order.
///
/// LSNs must strictly increase along the log; a step backwards is reported
/// as corruption.
pub struct WalReplay<'a> {
    records: WalRecordIterator<'a>,
    after: Lsn,
    last_seen: Lsn,
}

impl<'a> WalReplay<'a> {
    pub(crate) fn new(records: WalRecordIterator<'a>, after: Lsn) -> Self {
        Self {
            records,
            after,
            last_seen: Lsn::default(),
        }
    }

    /// Offset just past the last valid record read so far.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.records.valid_end()
    }

    /// How the log ended.
    #[must_use]
    pub fn tail(&self) -> WalTail {
        self.records.tail()
    }
}

impl Iterator for WalReplay<'_> {
    type Item = CoreResult<ReplayedCommit>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (offset, record) = match self.records.next()? {
                Ok(item) => item,
                Err(e) => return Some(Err(e)),
            };

            if record.lsn <= self.last_seen {
                return Some(Err(CoreError::wal_corruption(format!(
                    "{} at offset {offset} does not follow {}",
                    record.lsn, self.last_seen
                ))));
            }
            self.last_seen = record.lsn;

            if record.lsn > self.after {
                return Some(Ok(ReplayedCommit {
                    lsn: record.lsn,
                    txid: record.txid,
                    mutations: record.mutations,
                }));
            }
        }
    }
}

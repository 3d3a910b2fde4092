//! WAL record types and serialization.

use crate::error::{CoreError, CoreResult};
use crate::types::{check_key, check_value, Lsn, TableTag, TransactionId};

/// Magic bytes identifying a WAL record.
pub const WAL_MAGIC: [u8; 4] = *b"KWAL";

/// Current WAL format version.
pub const WAL_VERSION: u16 = 1;

/// Envelope header: magic (4) + version (2) + type (1) + length (4).
pub(crate) const HEADER_SIZE: usize = 11;

/// Trailing CRC32 size.
pub(crate) const CRC_SIZE: usize = 4;

/// Type byte of a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// A committed transaction and all of its mutations.
    Commit = 1,
}

impl WalRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Commit),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// What a mutation does to its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOp {
    /// Insert or replace the value.
    Put {
        /// New value.
        value: Vec<u8>,
        /// Unix millis at which the write was issued.
        updated_at: u64,
    },
    /// Remove the key if present.
    Delete,
}

/// One key-level change inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Table the key belongs to.
    pub table: TableTag,
    /// Key bytes.
    pub key: Vec<u8>,
    /// The change.
    pub op: MutationOp,
}

impl Mutation {
    /// Creates a put mutation.
    #[must_use]
    pub fn put(table: TableTag, key: Vec<u8>, value: Vec<u8>, updated_at: u64) -> Self {
        Self {
            table,
            key,
            op: MutationOp::Put { value, updated_at },
        }
    }

    /// Creates a delete mutation.
    #[must_use]
    pub fn delete(table: TableTag, key: Vec<u8>) -> Self {
        Self {
            table,
            key,
            op: MutationOp::Delete,
        }
    }
}

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// A WAL record: one committed transaction.
///
/// Payload layout:
///
/// ```text
/// | lsn (8) | txid (8) | count (4) | mutation* |
/// mutation = | op (1) | tag_len (1) | tag | key_len (2) | key | [updated_at (8) | value_len (4) | value] |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Position of the record in the log.
    pub lsn: Lsn,
    /// Transaction that produced it.
    pub txid: TransactionId,
    /// Mutations in application order.
    pub mutations: Vec<Mutation>,
}

impl WalRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        WalRecordType::Commit
    }

    /// Serializes the record payload (without envelope).
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a key or value exceeds its limit, or the
    /// payload would not fit the 4-byte length field.
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.lsn.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.txid.as_u64().to_le_bytes());
        let count = u32::try_from(self.mutations.len())
            .map_err(|_| CoreError::invalid_argument("too many mutations in one transaction"))?;
        buf.extend_from_slice(&count.to_le_bytes());

        for mutation in &self.mutations {
            check_key(&mutation.key)?;
            let tag = mutation.table.as_bytes();
            match &mutation.op {
                MutationOp::Put { .. } => buf.push(OP_PUT),
                MutationOp::Delete => buf.push(OP_DELETE),
            }
            // Tags are validated to at most 64 bytes.
            buf.push(tag.len() as u8);
            buf.extend_from_slice(tag);
            buf.extend_from_slice(&(mutation.key.len() as u16).to_le_bytes());
            buf.extend_from_slice(&mutation.key);

            if let MutationOp::Put { value, updated_at } = &mutation.op {
                check_value(value)?;
                buf.extend_from_slice(&updated_at.to_le_bytes());
                buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
                buf.extend_from_slice(value);
            }
        }

        if u32::try_from(buf.len()).is_err() {
            return Err(CoreError::invalid_argument(format!(
                "transaction payload of {} bytes exceeds the WAL record limit",
                buf.len()
            )));
        }
        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    pub fn decode_payload(record_type: WalRecordType, payload: &[u8]) -> CoreResult<Self> {
        match record_type {
            WalRecordType::Commit => {}
        }

        let mut reader = PayloadReader::new(payload);
        let lsn = Lsn::new(reader.u64()?);
        let txid = TransactionId::new(reader.u64()?);
        let count = reader.u32()? as usize;

        let mut mutations = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let op = reader.u8()?;
            let tag_len = reader.u8()? as usize;
            let tag = std::str::from_utf8(reader.bytes(tag_len)?)
                .map_err(|_| CoreError::wal_corruption("table tag is not UTF-8"))?;
            let table = TableTag::new(tag)
                .map_err(|e| CoreError::wal_corruption(format!("bad table tag: {e}")))?;
            let key_len = reader.u16()? as usize;
            let key = reader.bytes(key_len)?.to_vec();

            let op = match op {
                OP_PUT => {
                    let updated_at = reader.u64()?;
                    let value_len = reader.u32()? as usize;
                    let value = reader.bytes(value_len)?.to_vec();
                    MutationOp::Put { value, updated_at }
                }
                OP_DELETE => MutationOp::Delete,
                other => {
                    return Err(CoreError::wal_corruption(format!(
                        "unknown mutation op {other}"
                    )))
                }
            };
            mutations.push(Mutation { table, key, op });
        }

        if !reader.is_empty() {
            return Err(CoreError::wal_corruption(format!(
                "trailing bytes in commit record: {} unread",
                reader.remaining()
            )));
        }

        Ok(Self {
            lsn,
            txid,
            mutations,
        })
    }
}

/// Little-endian cursor over a record payload.
struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| CoreError::wal_corruption("unexpected end of payload"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> CoreResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(name: &str) -> TableTag {
        TableTag::new(name).unwrap()
    }

    #[test]
    fn record_type_byte() {
        assert_eq!(WalRecordType::from_byte(1), Some(WalRecordType::Commit));
        assert_eq!(WalRecordType::from_byte(0), None);
        assert_eq!(WalRecordType::from_byte(7), None);
    }

    #[test]
    fn commit_record_roundtrip() {
        let record = WalRecord {
            lsn: Lsn::new(12),
            txid: TransactionId::new(40),
            mutations: vec![
                Mutation::put(tag("users"), b"alice".to_vec(), b"30".to_vec(), 1_700_000_000_000),
                Mutation::delete(tag("users"), b"bob".to_vec()),
                Mutation::put(tag("log"), Vec::new(), vec![0xAB; 600], 5),
            ],
        };
        let payload = record.encode_payload().unwrap();
        let decoded = WalRecord::decode_payload(WalRecordType::Commit, &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn oversized_key_rejected() {
        let record = WalRecord {
            lsn: Lsn::new(1),
            txid: TransactionId::new(1),
            mutations: vec![Mutation::delete(tag("t"), vec![0; crate::types::MAX_KEY_SIZE + 1])],
        };
        assert!(matches!(
            record.encode_payload(),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn truncated_payload_is_corruption() {
        let record = WalRecord {
            lsn: Lsn::new(1),
            txid: TransactionId::new(1),
            mutations: vec![Mutation::put(tag("t"), b"k".to_vec(), b"value".to_vec(), 0)],
        };
        let payload = record.encode_payload().unwrap();
        let result = WalRecord::decode_payload(WalRecordType::Commit, &payload[..payload.len() - 2]);
        assert!(matches!(result, Err(CoreError::WalCorruption { .. })));
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let record = WalRecord {
            lsn: Lsn::new(1),
            txid: TransactionId::new(1),
            mutations: Vec::new(),
        };
        let mut payload = record.encode_payload().unwrap();
        payload.push(0);
        let result = WalRecord::decode_payload(WalRecordType::Commit, &payload);
        assert!(matches!(result, Err(CoreError::WalCorruption { .. })));
    }

    #[test]
    fn unknown_op_is_corruption() {
        let record = WalRecord {
            lsn: Lsn::new(1),
            txid: TransactionId::new(1),
            mutations: vec![Mutation::delete(tag("t"), b"k".to_vec())],
        };
        let mut payload = record.encode_payload().unwrap();
        payload[20] = 9;
        let result = WalRecord::decode_payload(WalRecordType::Commit, &payload);
        assert!(matches!(result, Err(CoreError::WalCorruption { .. })));
    }
}

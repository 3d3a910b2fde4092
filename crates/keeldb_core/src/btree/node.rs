//! B-tree node layout and (de)serialization.
//!
//! ```text
//! | kind (1) | count (2) | body |
//! leaf body:     entry*  where entry = | key_len (2) | key | updated_at (8) | value |
//!                value   = | 1 | len (2) | bytes |  or  | 2 | head (8) | len (8) |
//! internal body: | child0 (8) | (key_len (2) | key | child (8))* |
//! ```

use crate::block::{BlockStore, BLOCK_PAYLOAD};
use crate::error::{CoreError, CoreResult};
use crate::types::BlockId;

/// Bytes available to a node inside one block.
pub const NODE_CAPACITY: usize = BLOCK_PAYLOAD;

/// Values up to this many bytes live inside the leaf.
pub const INLINE_VALUE_MAX: usize = 512;

const KIND_LEAF: u8 = 1;
const KIND_INTERNAL: u8 = 2;
const NODE_HEADER: usize = 3;

const VALUE_INLINE: u8 = 1;
const VALUE_OVERFLOW: u8 = 2;

/// Where an entry's value lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueRef {
    /// Stored in the leaf itself.
    Inline(Vec<u8>),
    /// Stored in a chain of blocks starting at `head`.
    Overflow {
        /// First block of the chain.
        head: BlockId,
        /// Total value length in bytes.
        len: u64,
    },
}

impl ValueRef {
    fn encoded_len(&self) -> usize {
        match self {
            Self::Inline(bytes) => 1 + 2 + bytes.len(),
            Self::Overflow { .. } => 1 + 8 + 8,
        }
    }

    /// Length of the value this reference points to.
    #[must_use]
    pub fn value_len(&self) -> u64 {
        match self {
            Self::Inline(bytes) => bytes.len() as u64,
            Self::Overflow { len, .. } => *len,
        }
    }
}

/// One key in a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    /// Key bytes.
    pub key: Vec<u8>,
    /// Unix millis of the last write to this key.
    pub updated_at: u64,
    /// The value or its location.
    pub value: ValueRef,
}

impl LeafEntry {
    pub(crate) fn encoded_len(&self) -> usize {
        2 + self.key.len() + 8 + self.value.encoded_len()
    }
}

/// A decoded B-tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Sorted entries.
    Leaf(Vec<LeafEntry>),
    /// `children.len() == keys.len() + 1`; child `i` holds keys in
    /// `[keys[i-1], keys[i])`.
    Internal {
        /// Separator keys.
        keys: Vec<Vec<u8>>,
        /// Child blocks.
        children: Vec<BlockId>,
    },
}

impl Node {
    /// Reads and decodes the node stored in `id`.
    pub fn read(store: &BlockStore, id: BlockId) -> CoreResult<Self> {
        Self::decode(id, &store.read(id)?)
    }

    /// Serialized size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        NODE_HEADER
            + match self {
                Self::Leaf(entries) => entries.iter().map(LeafEntry::encoded_len).sum::<usize>(),
                Self::Internal { keys, .. } => {
                    8 + keys.iter().map(|k| 2 + k.len() + 8).sum::<usize>()
                }
            }
    }

    /// Whether the node fits in one block.
    #[must_use]
    pub fn fits(&self) -> bool {
        self.encoded_len() <= NODE_CAPACITY
    }

    /// Serializes the node.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        match self {
            Self::Leaf(entries) => {
                buf.push(KIND_LEAF);
                buf.extend_from_slice(&(entries.len() as u16).to_le_bytes());
                for entry in entries {
                    buf.extend_from_slice(&(entry.key.len() as u16).to_le_bytes());
                    buf.extend_from_slice(&entry.key);
                    buf.extend_from_slice(&entry.updated_at.to_le_bytes());
                    match &entry.value {
                        ValueRef::Inline(bytes) => {
                            buf.push(VALUE_INLINE);
                            buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                            buf.extend_from_slice(bytes);
                        }
                        ValueRef::Overflow { head, len } => {
                            buf.push(VALUE_OVERFLOW);
                            buf.extend_from_slice(&head.as_u64().to_le_bytes());
                            buf.extend_from_slice(&len.to_le_bytes());
                        }
                    }
                }
            }
            Self::Internal { keys, children } => {
                buf.push(KIND_INTERNAL);
                buf.extend_from_slice(&(keys.len() as u16).to_le_bytes());
                buf.extend_from_slice(&children[0].as_u64().to_le_bytes());
                for (key, child) in keys.iter().zip(&children[1..]) {
                    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
                    buf.extend_from_slice(key);
                    buf.extend_from_slice(&child.as_u64().to_le_bytes());
                }
            }
        }
        buf
    }

    /// Decodes a node read from block `id`.
    ///
    /// # Errors
    ///
    /// Returns `CorruptBlock` if the bytes do not form a valid node.
    pub fn decode(id: BlockId, data: &[u8]) -> CoreResult<Self> {
        let mut r = NodeReader { id, data, pos: 0 };
        let kind = r.u8()?;
        let count = r.u16()? as usize;

        let node = match kind {
            KIND_LEAF => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key_len = r.u16()? as usize;
                    let key = r.bytes(key_len)?.to_vec();
                    let updated_at = r.u64()?;
                    let value = match r.u8()? {
                        VALUE_INLINE => {
                            let len = r.u16()? as usize;
                            ValueRef::Inline(r.bytes(len)?.to_vec())
                        }
                        VALUE_OVERFLOW => {
                            let head = BlockId::from_raw(r.u64()?)
                                .ok_or_else(|| r.corrupt("overflow value points at block 0"))?;
                            ValueRef::Overflow {
                                head,
                                len: r.u64()?,
                            }
                        }
                        other => return Err(r.corrupt(format!("unknown value tag {other}"))),
                    };
                    entries.push(LeafEntry {
                        key,
                        updated_at,
                        value,
                    });
                }
                Self::Leaf(entries)
            }
            KIND_INTERNAL => {
                let mut keys = Vec::with_capacity(count);
                let mut children = Vec::with_capacity(count + 1);
                children.push(r.child()?);
                for _ in 0..count {
                    let key_len = r.u16()? as usize;
                    keys.push(r.bytes(key_len)?.to_vec());
                    children.push(r.child()?);
                }
                Self::Internal { keys, children }
            }
            other => return Err(r.corrupt(format!("unknown node kind {other}"))),
        };

        if r.pos != data.len() {
            return Err(r.corrupt("trailing bytes after node"));
        }
        Ok(node)
    }

    /// Splits an overfull node in two, balancing encoded bytes.
    ///
    /// Returns `(left, separator, right)`. For leaves the separator is the
    /// first key of `right`; for internal nodes it is promoted out of both.
    #[must_use]
    pub fn split(self) -> (Self, Vec<u8>, Self) {
        match self {
            Self::Leaf(mut entries) => {
                let sizes: Vec<usize> = entries.iter().map(LeafEntry::encoded_len).collect();
                let mid = split_point(&sizes);
                let right = entries.split_off(mid);
                let separator = right[0].key.clone();
                (Self::Leaf(entries), separator, Self::Leaf(right))
            }
            Self::Internal {
                mut keys,
                mut children,
            } => {
                let sizes: Vec<usize> = keys.iter().map(|k| 2 + k.len() + 8).collect();
                let mid = split_point(&sizes);
                let mut right_keys = keys.split_off(mid);
                let separator = right_keys.remove(0);
                let right_children = children.split_off(mid + 1);
                (
                    Self::Internal { keys, children },
                    separator,
                    Self::Internal {
                        keys: right_keys,
                        children: right_children,
                    },
                )
            }
        }
    }
}

/// Index at which to cut `sizes` so the larger half is as small as
/// possible, keeping both halves non-empty.
fn split_point(sizes: &[usize]) -> usize {
    debug_assert!(sizes.len() >= 2);
    let total: usize = sizes.iter().sum();
    let mut best = 1;
    let mut best_cost = usize::MAX;
    let mut prefix = 0;
    for (i, size) in sizes.iter().enumerate().take(sizes.len() - 1) {
        prefix += size;
        let cost = prefix.max(total - prefix);
        if cost < best_cost {
            best_cost = cost;
            best = i + 1;
        }
    }
    best
}

/// Index of the child of an internal node that covers `key`.
pub(crate) fn child_index(keys: &[Vec<u8>], key: &[u8]) -> usize {
    keys.partition_point(|k| k.as_slice() <= key)
}

struct NodeReader<'a> {
    id: BlockId,
    data: &'a [u8],
    pos: usize,
}

impl<'a> NodeReader<'a> {
    fn corrupt(&self, message: impl Into<String>) -> CoreError {
        CoreError::corrupt_block(self.id, message)
    }

    fn bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(self.corrupt("node truncated"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> CoreResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let mut out = [0u8; 8];
        out.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(out))
    }

    fn child(&mut self) -> CoreResult<BlockId> {
        BlockId::from_raw(self.u64()?).ok_or_else(|| self.corrupt("child points at block 0"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MAX_KEY_SIZE;

    fn entry(key: &[u8], value: &[u8]) -> LeafEntry {
        LeafEntry {
            key: key.to_vec(),
            updated_at: 42,
            value: ValueRef::Inline(value.to_vec()),
        }
    }

    #[test]
    fn leaf_encode_decode() {
        let node = Node::Leaf(vec![
            entry(b"a", b"1"),
            LeafEntry {
                key: b"big".to_vec(),
                updated_at: 7,
                value: ValueRef::Overflow {
                    head: BlockId::new(9),
                    len: 10_000,
                },
            },
            entry(b"", b""),
        ]);
        let bytes = node.encode();
        assert_eq!(bytes.len(), node.encoded_len());
        assert_eq!(Node::decode(BlockId::new(1), &bytes).unwrap(), node);
    }

    #[test]
    fn internal_encode_decode() {
        let node = Node::Internal {
            keys: vec![b"m".to_vec(), b"t".to_vec()],
            children: vec![BlockId::new(2), BlockId::new(3), BlockId::new(4)],
        };
        let bytes = node.encode();
        assert_eq!(bytes.len(), node.encoded_len());
        assert_eq!(Node::decode(BlockId::new(1), &bytes).unwrap(), node);
    }

    #[test]
    fn garbage_is_corrupt_block() {
        let err = Node::decode(BlockId::new(5), &[9, 0, 0]).unwrap_err();
        assert!(matches!(err, CoreError::CorruptBlock { block, .. } if block == BlockId::new(5)));

        let mut bytes = Node::Leaf(vec![entry(b"k", b"v")]).encode();
        bytes.push(0);
        assert!(Node::decode(BlockId::new(5), &bytes).is_err());
    }

    #[test]
    fn child_index_routes_by_separator() {
        let keys = vec![b"g".to_vec(), b"p".to_vec()];
        assert_eq!(child_index(&keys, b"a"), 0);
        assert_eq!(child_index(&keys, b"g"), 1);
        assert_eq!(child_index(&keys, b"h"), 1);
        assert_eq!(child_index(&keys, b"p"), 2);
        assert_eq!(child_index(&keys, b"z"), 2);
    }

    #[test]
    fn worst_case_leaf_split_fits() {
        // Three maximal entries overflow a block; both halves must fit.
        let big = |c: u8| LeafEntry {
            key: vec![c; MAX_KEY_SIZE],
            updated_at: 0,
            value: ValueRef::Inline(vec![c; INLINE_VALUE_MAX]),
        };
        let node = Node::Leaf(vec![big(1), big(2), big(3)]);
        assert!(!node.fits());

        let (left, sep, right) = node.split();
        assert!(left.fits());
        assert!(right.fits());
        assert_eq!(sep, vec![2u8; MAX_KEY_SIZE]);
    }

    #[test]
    fn internal_split_promotes_separator() {
        let keys: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 900]).collect();
        let children: Vec<BlockId> = (1..=7).map(BlockId::new).collect();
        let node = Node::Internal { keys, children };
        assert!(!node.fits());

        let (left, sep, right) = node.split();
        match (&left, &right) {
            (
                Node::Internal { keys: lk, children: lc },
                Node::Internal { keys: rk, children: rc },
            ) => {
                assert_eq!(lk.len() + rk.len() + 1, 6);
                assert_eq!(lc.len(), lk.len() + 1);
                assert_eq!(rc.len(), rk.len() + 1);
                assert!(lk.iter().all(|k| k < &sep));
                assert!(rk.iter().all(|k| k > &sep));
            }
            _ => panic!("split changed node kind"),
        }
        assert!(left.fits() && right.fits());
    }
}

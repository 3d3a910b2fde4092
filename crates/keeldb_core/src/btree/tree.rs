//! Copy-on-write B+ tree over blocks.
//!
//! Entries live in leaves; internal nodes hold separators only. Nodes split
//! by encoded size, so the fan-out adapts to key length. All leaves sit at
//! the same depth.

use crate::block::BlockStore;
use crate::btree::node::{child_index, LeafEntry, Node, ValueRef, NODE_CAPACITY};
use crate::btree::value::{chain_blocks, release_value, write_value};
use crate::btree::writer::TreeWriter;
use crate::error::{CoreError, CoreResult};
use crate::types::BlockId;
use std::ops::Bound;

/// Nodes smaller than this try to merge with a sibling after a removal.
const MERGE_THRESHOLD: usize = NODE_CAPACITY / 4;

/// Handle to one tree version, identified by its root block.
///
/// The handle is a plain value: mutating operations build a new version
/// through a [`TreeWriter`] and update `self` to point at it, leaving the
/// previous version readable until its blocks are freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BTree {
    root: Option<BlockId>,
}

/// Structural summary gathered by [`BTree::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeShape {
    /// Levels from root to leaves (0 for an empty tree).
    pub depth: usize,
    /// Node blocks.
    pub nodes: u64,
    /// Leaf entries.
    pub entries: u64,
    /// Overflow chain blocks.
    pub overflow_blocks: u64,
}

enum Inserted {
    Fit(BlockId),
    Split {
        left: BlockId,
        separator: Vec<u8>,
        right: BlockId,
    },
}

enum Removed {
    NotFound,
    Emptied,
    Updated { id: BlockId, len: usize },
}

impl BTree {
    /// A tree rooted at `root`, or empty.
    #[must_use]
    pub const fn with_root(root: Option<BlockId>) -> Self {
        Self { root }
    }

    /// The root block, if the tree has entries.
    #[must_use]
    pub const fn root(&self) -> Option<BlockId> {
        self.root
    }

    /// Whether the tree has no entries.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Finds the entry for `key`.
    pub fn lookup(&self, store: &BlockStore, key: &[u8]) -> CoreResult<Option<LeafEntry>> {
        let Some(mut id) = self.root else {
            return Ok(None);
        };
        loop {
            match Node::read(store, id)? {
                Node::Internal { keys, children } => id = children[child_index(&keys, key)],
                Node::Leaf(mut entries) => {
                    return Ok(entries
                        .binary_search_by(|e| e.key.as_slice().cmp(key))
                        .ok()
                        .map(|i| entries.swap_remove(i)));
                }
            }
        }
    }

    /// Inserts or replaces an entry, returning the one it replaced.
    ///
    /// The replaced entry's value blocks are not touched; see
    /// [`BTree::put`] for the variant that manages them.
    pub fn upsert(
        &mut self,
        w: &mut TreeWriter<'_>,
        entry: LeafEntry,
    ) -> CoreResult<Option<LeafEntry>> {
        let mut replaced = None;
        let root = match self.root {
            None => w.write_node(None, &Node::Leaf(vec![entry]))?,
            Some(root) => match insert_into(w, root, entry, &mut replaced)? {
                Inserted::Fit(id) => id,
                Inserted::Split {
                    left,
                    separator,
                    right,
                } => {
                    let node = Node::Internal {
                        keys: vec![separator],
                        children: vec![left, right],
                    };
                    w.write_node(None, &node)?
                }
            },
        };
        self.root = Some(root);
        Ok(replaced)
    }

    /// Removes the entry for `key`, returning it if it existed.
    pub fn remove(&mut self, w: &mut TreeWriter<'_>, key: &[u8]) -> CoreResult<Option<LeafEntry>> {
        let Some(root) = self.root else {
            return Ok(None);
        };
        let mut removed = None;
        match remove_from(w, root, key, &mut removed)? {
            Removed::NotFound => {}
            Removed::Emptied => self.root = None,
            Removed::Updated { mut id, .. } => {
                // Collapse single-child roots left behind by merges.
                while let Node::Internal { keys, children } = Node::read(w.store(), id)? {
                    if !keys.is_empty() {
                        break;
                    }
                    w.retire(id);
                    id = children[0];
                }
                self.root = Some(id);
            }
        }
        Ok(removed)
    }

    /// Stores `value` under `key`, spilling it into an overflow chain if it
    /// is too large for a leaf and releasing the chain of any value it
    /// replaces.
    pub fn put(
        &mut self,
        w: &mut TreeWriter<'_>,
        key: &[u8],
        value: &[u8],
        updated_at: u64,
    ) -> CoreResult<()> {
        let value = write_value(w, value)?;
        let entry = LeafEntry {
            key: key.to_vec(),
            updated_at,
            value,
        };
        if let Some(old) = self.upsert(w, entry)? {
            release_value(w, &old.value)?;
        }
        Ok(())
    }

    /// Removes `key` and releases its value blocks. Returns whether the key
    /// was present.
    pub fn delete(&mut self, w: &mut TreeWriter<'_>, key: &[u8]) -> CoreResult<bool> {
        match self.remove(w, key)? {
            Some(old) => {
                release_value(w, &old.value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Iterates entries with keys inside the bounds, in ascending order.
    #[must_use]
    pub fn range<'s>(
        &self,
        store: &'s BlockStore,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    ) -> Range<'s> {
        Range::new(store, self.root, lower, upper)
    }

    /// Visits every block the tree references, overflow chains included,
    /// checking key order and leaf depth on the way.
    ///
    /// # Errors
    ///
    /// Returns `CorruptBlock` for unreadable blocks, misordered keys or
    /// leaves at different depths, and propagates errors from `visit`.
    pub fn walk(
        &self,
        store: &BlockStore,
        mut visit: impl FnMut(BlockId) -> CoreResult<()>,
    ) -> CoreResult<TreeShape> {
        let mut shape = TreeShape::default();
        if let Some(root) = self.root {
            let mut leaf_depth = None;
            walk_node(
                store,
                root,
                (None, None),
                1,
                &mut leaf_depth,
                &mut shape,
                &mut visit,
            )?;
            shape.depth = leaf_depth.unwrap_or(0);
        }
        Ok(shape)
    }
}

fn write_split_or_fit(w: &mut TreeWriter<'_>, id: BlockId, node: Node) -> CoreResult<Inserted> {
    if node.fits() {
        return Ok(Inserted::Fit(w.write_node(Some(id), &node)?));
    }
    let (left, separator, right) = node.split();
    let left = w.write_node(Some(id), &left)?;
    let right = w.write_node(None, &right)?;
    Ok(Inserted::Split {
        left,
        separator,
        right,
    })
}

fn insert_into(
    w: &mut TreeWriter<'_>,
    id: BlockId,
    entry: LeafEntry,
    replaced: &mut Option<LeafEntry>,
) -> CoreResult<Inserted> {
    match Node::read(w.store(), id)? {
        Node::Leaf(mut entries) => {
            match entries.binary_search_by(|e| e.key.as_slice().cmp(&entry.key)) {
                Ok(i) => *replaced = Some(std::mem::replace(&mut entries[i], entry)),
                Err(i) => entries.insert(i, entry),
            }
            write_split_or_fit(w, id, Node::Leaf(entries))
        }
        Node::Internal {
            mut keys,
            mut children,
        } => {
            let idx = child_index(&keys, &entry.key);
            match insert_into(w, children[idx], entry, replaced)? {
                // Child rewritten in place: nothing changes here.
                Inserted::Fit(child) if child == children[idx] => return Ok(Inserted::Fit(id)),
                Inserted::Fit(child) => children[idx] = child,
                Inserted::Split {
                    left,
                    separator,
                    right,
                } => {
                    children[idx] = left;
                    keys.insert(idx, separator);
                    children.insert(idx + 1, right);
                }
            }
            write_split_or_fit(w, id, Node::Internal { keys, children })
        }
    }
}

fn remove_from(
    w: &mut TreeWriter<'_>,
    id: BlockId,
    key: &[u8],
    removed: &mut Option<LeafEntry>,
) -> CoreResult<Removed> {
    let node = match Node::read(w.store(), id)? {
        Node::Leaf(mut entries) => {
            let Ok(i) = entries.binary_search_by(|e| e.key.as_slice().cmp(key)) else {
                return Ok(Removed::NotFound);
            };
            *removed = Some(entries.remove(i));
            if entries.is_empty() {
                w.retire(id);
                return Ok(Removed::Emptied);
            }
            Node::Leaf(entries)
        }
        Node::Internal {
            mut keys,
            mut children,
        } => {
            let idx = child_index(&keys, key);
            match remove_from(w, children[idx], key, removed)? {
                Removed::NotFound => return Ok(Removed::NotFound),
                Removed::Emptied => {
                    children.remove(idx);
                    if children.is_empty() {
                        w.retire(id);
                        return Ok(Removed::Emptied);
                    }
                    keys.remove(idx.saturating_sub(1));
                }
                Removed::Updated { id: child, len } => {
                    children[idx] = child;
                    if len < MERGE_THRESHOLD && children.len() > 1 {
                        merge_with_sibling(w, &mut keys, &mut children, idx)?;
                    }
                }
            }
            Node::Internal { keys, children }
        }
    };

    let len = node.encoded_len();
    let id = w.write_node(Some(id), &node)?;
    Ok(Removed::Updated { id, len })
}

/// Folds the underfull child at `idx` into a neighbour when the pair fits
/// in one block.
fn merge_with_sibling(
    w: &mut TreeWriter<'_>,
    keys: &mut Vec<Vec<u8>>,
    children: &mut Vec<BlockId>,
    idx: usize,
) -> CoreResult<()> {
    let left_idx = if idx > 0 { idx - 1 } else { idx };
    let (left_id, right_id) = (children[left_idx], children[left_idx + 1]);

    let merged = match (Node::read(w.store(), left_id)?, Node::read(w.store(), right_id)?) {
        (Node::Leaf(mut left), Node::Leaf(right)) => {
            left.extend(right);
            Node::Leaf(left)
        }
        (
            Node::Internal {
                keys: mut left_keys,
                children: mut left_children,
            },
            Node::Internal {
                keys: right_keys,
                children: right_children,
            },
        ) => {
            left_keys.push(keys[left_idx].clone());
            left_keys.extend(right_keys);
            left_children.extend(right_children);
            Node::Internal {
                keys: left_keys,
                children: left_children,
            }
        }
        _ => {
            return Err(CoreError::corrupt_block(
                left_id,
                "sibling nodes at different levels",
            ))
        }
    };

    if !merged.fits() {
        return Ok(());
    }
    children[left_idx] = w.write_node(Some(left_id), &merged)?;
    w.retire(right_id);
    children.remove(left_idx + 1);
    keys.remove(left_idx);
    Ok(())
}

type KeyBounds<'a> = (Option<&'a [u8]>, Option<&'a [u8]>);

fn walk_node(
    store: &BlockStore,
    id: BlockId,
    (low, high): KeyBounds<'_>,
    depth: usize,
    leaf_depth: &mut Option<usize>,
    shape: &mut TreeShape,
    visit: &mut impl FnMut(BlockId) -> CoreResult<()>,
) -> CoreResult<()> {
    visit(id)?;
    shape.nodes += 1;

    let in_bounds = |key: &[u8]| low.map_or(true, |l| key >= l) && high.map_or(true, |h| key < h);

    match Node::read(store, id)? {
        Node::Leaf(entries) => {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(d) if d != depth => {
                    return Err(CoreError::corrupt_block(
                        id,
                        format!("leaf at depth {depth}, expected {d}"),
                    ))
                }
                Some(_) => {}
            }
            if entries.is_empty() {
                return Err(CoreError::corrupt_block(id, "empty leaf"));
            }
            for (i, entry) in entries.iter().enumerate() {
                if !in_bounds(&entry.key) || (i > 0 && entries[i - 1].key >= entry.key) {
                    return Err(CoreError::corrupt_block(id, "leaf keys out of order"));
                }
                if let ValueRef::Overflow { head, len } = entry.value {
                    for block in chain_blocks(store, head, len)? {
                        visit(block)?;
                        shape.overflow_blocks += 1;
                    }
                }
            }
            shape.entries += entries.len() as u64;
        }
        Node::Internal { keys, children } => {
            if children.len() != keys.len() + 1 {
                return Err(CoreError::corrupt_block(id, "child count mismatch"));
            }
            for (i, key) in keys.iter().enumerate() {
                if !in_bounds(key) || (i > 0 && keys[i - 1] >= *key) {
                    return Err(CoreError::corrupt_block(id, "separators out of order"));
                }
            }
            for (i, child) in children.iter().enumerate() {
                let child_low = if i == 0 { low } else { Some(keys[i - 1].as_slice()) };
                let child_high = keys.get(i).map(Vec::as_slice).or(high);
                walk_node(
                    store,
                    *child,
                    (child_low, child_high),
                    depth + 1,
                    leaf_depth,
                    shape,
                    visit,
                )?;
            }
        }
    }
    Ok(())
}

/// Lazy ascending cursor over a tree version.
///
/// Keeps one decoded leaf and the path of internal nodes leading to it.
pub struct Range<'s> {
    store: &'s BlockStore,
    /// Children of each internal node on the path, with the next index to
    /// descend into.
    stack: Vec<(Vec<BlockId>, usize)>,
    leaf: std::vec::IntoIter<LeafEntry>,
    upper: Bound<Vec<u8>>,
    pending: Option<CoreError>,
    done: bool,
}

impl<'s> Range<'s> {
    fn new(
        store: &'s BlockStore,
        root: Option<BlockId>,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    ) -> Self {
        let mut range = Self {
            store,
            stack: Vec::new(),
            leaf: Vec::new().into_iter(),
            upper,
            pending: None,
            done: root.is_none(),
        };
        if let Some(root) = root {
            if let Err(e) = range.seek(root, &lower) {
                range.pending = Some(e);
            }
        }
        range
    }

    /// Descends from `id` to the first leaf that may hold keys at or above
    /// `lower`, then skips the entries below it.
    fn seek(&mut self, mut id: BlockId, lower: &Bound<Vec<u8>>) -> CoreResult<()> {
        loop {
            match Node::read(self.store, id)? {
                Node::Internal { keys, children } => {
                    let idx = match lower {
                        Bound::Unbounded => 0,
                        Bound::Included(k) | Bound::Excluded(k) => child_index(&keys, k),
                    };
                    id = children[idx];
                    self.stack.push((children, idx + 1));
                }
                Node::Leaf(mut entries) => {
                    let start = match lower {
                        Bound::Unbounded => 0,
                        Bound::Included(k) => entries.partition_point(|e| e.key < *k),
                        Bound::Excluded(k) => entries.partition_point(|e| e.key <= *k),
                    };
                    self.leaf = entries.split_off(start).into_iter();
                    return Ok(());
                }
            }
        }
    }

    fn past_upper(&self, key: &[u8]) -> bool {
        match &self.upper {
            Bound::Unbounded => false,
            Bound::Included(u) => key > u.as_slice(),
            Bound::Excluded(u) => key >= u.as_slice(),
        }
    }

    /// Moves to the next leaf. Returns false once the tree is exhausted.
    fn advance(&mut self) -> CoreResult<bool> {
        loop {
            let Some((children, next)) = self.stack.last_mut() else {
                return Ok(false);
            };
            if *next < children.len() {
                let id = children[*next];
                *next += 1;
                self.seek(id, &Bound::Unbounded)?;
                return Ok(true);
            }
            self.stack.pop();
        }
    }
}

impl Iterator for Range<'_> {
    type Item = CoreResult<LeafEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Some(Err(e));
        }
        loop {
            if let Some(entry) = self.leaf.next() {
                if self.past_upper(&entry.key) {
                    self.done = true;
                    return None;
                }
                return Some(Ok(entry));
            }
            match self.advance() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

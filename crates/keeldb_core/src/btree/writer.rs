//! Copy-on-write context for building new tree versions.

use crate::block::BlockStore;
use crate::btree::node::Node;
use crate::error::CoreResult;
use crate::types::BlockId;
use std::collections::HashSet;

/// Tracks the blocks one unpublished build has touched.
///
/// Published blocks are never modified: writing a node that lives in one
/// allocates a replacement and marks the old block retired. Blocks this
/// writer allocated itself are invisible to readers, so they are rewritten
/// in place and freed immediately when superseded.
///
/// Dropping a writer without [`TreeWriter::finish`] releases everything it
/// allocated, leaving the published trees untouched.
pub struct TreeWriter<'s> {
    store: &'s BlockStore,
    owned: HashSet<BlockId>,
    retired: Vec<BlockId>,
}

impl<'s> TreeWriter<'s> {
    /// Starts a build over `store`.
    pub fn new(store: &'s BlockStore) -> Self {
        Self {
            store,
            owned: HashSet::new(),
            retired: Vec::new(),
        }
    }

    /// The underlying block store.
    #[must_use]
    pub fn store(&self) -> &'s BlockStore {
        self.store
    }

    /// Allocates a block owned by this build.
    pub fn allocate(&mut self) -> CoreResult<BlockId> {
        let id = self.store.allocate()?;
        self.owned.insert(id);
        Ok(id)
    }

    /// Writes a raw payload into a block this build owns.
    pub fn write_owned(&mut self, id: BlockId, payload: &[u8]) -> CoreResult<()> {
        debug_assert!(self.owned.contains(&id), "{id} not owned by this build");
        self.store.write(id, payload)
    }

    /// Writes `node` as the new version of `prev` and returns where it
    /// landed.
    pub fn write_node(&mut self, prev: Option<BlockId>, node: &Node) -> CoreResult<BlockId> {
        let id = match prev {
            Some(id) if self.owned.contains(&id) => id,
            other => {
                let id = self.allocate()?;
                if let Some(old) = other {
                    self.retired.push(old);
                }
                id
            }
        };
        self.store.write(id, &node.encode())?;
        Ok(id)
    }

    /// Marks a block as no longer part of the tree being built.
    pub fn retire(&mut self, id: BlockId) {
        if self.owned.remove(&id) {
            self.store.free(id);
        } else {
            self.retired.push(id);
        }
    }

    /// Number of blocks allocated so far.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.owned.len()
    }

    /// Ends the build once its roots are published. Returns the superseded
    /// published blocks, which the caller frees after the swap.
    #[must_use]
    pub fn finish(mut self) -> Vec<BlockId> {
        self.owned.clear();
        std::mem::take(&mut self.retired)
    }
}

impl Drop for TreeWriter<'_> {
    fn drop(&mut self) {
        if !self.owned.is_empty() {
            tracing::debug!(blocks = self.owned.len(), "releasing unpublished blocks");
        }
        for id in self.owned.drain() {
            self.store.free(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeldb_storage::InMemoryBackend;

    fn store() -> BlockStore {
        BlockStore::open(Box::new(InMemoryBackend::new()), None).unwrap()
    }

    #[test]
    fn published_blocks_are_copied() {
        let store = store();
        let published = store.allocate().unwrap();
        store.write(published, &Node::Leaf(vec![]).encode()).unwrap();
        store.checkpoint_complete();

        let mut w = TreeWriter::new(&store);
        let copy = w.write_node(Some(published), &Node::Leaf(vec![])).unwrap();
        assert_ne!(copy, published);

        // Second write to the copy stays in place.
        let again = w.write_node(Some(copy), &Node::Leaf(vec![])).unwrap();
        assert_eq!(again, copy);

        assert_eq!(w.finish(), vec![published]);
    }

    #[test]
    fn dropped_build_releases_its_blocks() {
        let store = store();
        {
            let mut w = TreeWriter::new(&store);
            w.write_node(None, &Node::Leaf(vec![])).unwrap();
            w.write_node(None, &Node::Leaf(vec![])).unwrap();
            assert_eq!(w.allocated(), 2);
        }
        assert_eq!(store.usage().free, 2);
    }

    #[test]
    fn retiring_owned_block_frees_it_now() {
        let store = store();
        let mut w = TreeWriter::new(&store);
        let id = w.write_node(None, &Node::Leaf(vec![])).unwrap();
        w.retire(id);
        assert_eq!(store.usage().free, 1);
        assert!(w.finish().is_empty());
    }
}

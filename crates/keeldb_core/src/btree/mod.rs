//! Ordered key index over the block store.

mod node;
mod tree;
mod value;
mod writer;

pub use node::{LeafEntry, Node, ValueRef, INLINE_VALUE_MAX, NODE_CAPACITY};
pub use tree::{BTree, Range, TreeShape};
pub use value::{chain_blocks, read_value, CHUNK_SIZE};
pub use writer::TreeWriter;

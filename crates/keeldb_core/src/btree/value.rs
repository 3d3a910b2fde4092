//! Values too large for a leaf, stored as chains of blocks.
//!
//! Each chain block carries `| next (8) | data |`; `next` is 0 in the last
//! block. The chain length follows from the value length, so a chain that
//! ends early or runs long is corruption.

use crate::block::{BlockStore, BLOCK_PAYLOAD};
use crate::btree::node::{ValueRef, INLINE_VALUE_MAX};
use crate::btree::writer::TreeWriter;
use crate::error::{CoreError, CoreResult};
use crate::types::BlockId;

/// Data bytes per chain block.
pub const CHUNK_SIZE: usize = BLOCK_PAYLOAD - 8;

fn chunk_count(len: u64) -> u64 {
    len.div_ceil(CHUNK_SIZE as u64)
}

/// Stores `value`, inline when small enough, otherwise in a new chain.
pub fn write_value(w: &mut TreeWriter<'_>, value: &[u8]) -> CoreResult<ValueRef> {
    if value.len() <= INLINE_VALUE_MAX {
        return Ok(ValueRef::Inline(value.to_vec()));
    }

    let chunks: Vec<&[u8]> = value.chunks(CHUNK_SIZE).collect();
    let mut ids = Vec::with_capacity(chunks.len());
    for _ in &chunks {
        ids.push(w.allocate()?);
    }

    let mut payload = Vec::with_capacity(BLOCK_PAYLOAD);
    for (i, chunk) in chunks.iter().enumerate() {
        let next = BlockId::to_raw(ids.get(i + 1).copied());
        payload.clear();
        payload.extend_from_slice(&next.to_le_bytes());
        payload.extend_from_slice(chunk);
        w.write_owned(ids[i], &payload)?;
    }

    Ok(ValueRef::Overflow {
        head: ids[0],
        len: value.len() as u64,
    })
}

/// Loads the full value behind `value`.
pub fn read_value(store: &BlockStore, value: &ValueRef) -> CoreResult<Vec<u8>> {
    match value {
        ValueRef::Inline(bytes) => Ok(bytes.clone()),
        ValueRef::Overflow { head, len } => {
            let mut out = Vec::with_capacity(*len as usize);
            walk_chain(store, *head, *len, |_, data| {
                out.extend_from_slice(data);
                Ok(())
            })?;
            Ok(out)
        }
    }
}

/// Lists the blocks of an overflow chain, head first.
pub fn chain_blocks(store: &BlockStore, head: BlockId, len: u64) -> CoreResult<Vec<BlockId>> {
    let mut ids = Vec::with_capacity(chunk_count(len) as usize);
    walk_chain(store, head, len, |id, _| {
        ids.push(id);
        Ok(())
    })?;
    Ok(ids)
}

/// Retires every block behind `value`.
pub fn release_value(w: &mut TreeWriter<'_>, value: &ValueRef) -> CoreResult<()> {
    if let ValueRef::Overflow { head, len } = value {
        for id in chain_blocks(w.store(), *head, *len)? {
            w.retire(id);
        }
    }
    Ok(())
}

fn walk_chain(
    store: &BlockStore,
    head: BlockId,
    len: u64,
    mut visit: impl FnMut(BlockId, &[u8]) -> CoreResult<()>,
) -> CoreResult<()> {
    let expected = chunk_count(len);
    let mut remaining = len;
    let mut current = Some(head);

    for _ in 0..expected {
        let Some(id) = current else {
            return Err(CoreError::corrupt_block(head, "overflow chain ends early"));
        };
        let payload = store.read(id)?;
        if payload.len() < 8 {
            return Err(CoreError::corrupt_block(id, "overflow block too short"));
        }
        let mut next = [0u8; 8];
        next.copy_from_slice(&payload[..8]);
        let data = &payload[8..];
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        if data.len() != want {
            return Err(CoreError::corrupt_block(
                id,
                format!("overflow block holds {} bytes, expected {want}", data.len()),
            ));
        }
        visit(id, data)?;
        remaining -= want as u64;
        current = BlockId::from_raw(u64::from_le_bytes(next));
    }

    if let Some(extra) = current {
        return Err(CoreError::corrupt_block(
            extra,
            "overflow chain longer than its value",
        ));
    }
    Ok(())
}

//! On-disk free-list stack
//!
//! The free list is a chain of free-list blocks whose head is the top of a
//! LIFO stack. Only the head's `totalFreeBlockCount` covers the whole
//! chain; every other block records the subtotal of itself and the blocks
//! after it.
//!
//! Both operations run under the allocator mutex, which the caller passes
//! in as `&mut AllocState`.

use crate::block::ContinuationBlock;
use crate::manager::{AllocState, BlockManager};
use tracing::debug;
use vdisk_common::{BlockOffset, Error, Result};

/// Free blocks recorded by the whole chain
pub(crate) fn total(manager: &BlockManager, state: &AllocState) -> Result<u32> {
    manager.get_free_list_block(state.free_list_head)?.total_free()
}

/// Pop up to `n` offsets, most recently freed first.
///
/// When the head block runs empty and has a successor, the head block
/// itself is handed out and its successor becomes the new head.
pub(crate) fn remove(
    manager: &BlockManager,
    state: &mut AllocState,
    n: usize,
) -> Result<Vec<BlockOffset>> {
    let mut taken = Vec::with_capacity(n);

    while taken.len() < n {
        let head = manager.get_free_list_block(state.free_list_head)?;
        let total = head.total_free()?;

        let popped = head.pop_many(n - taken.len())?;
        if !popped.is_empty() {
            head.set_total_free(total.saturating_sub(popped.len() as u32))?;
            taken.extend(popped);
            continue;
        }

        let Some(next) = head.next()? else {
            break;
        };
        debug!("Free-list head {} exhausted, {} becomes head", head.offset(), next);
        state.free_list_head = next;
        manager.persist_free_list_head(next)?;
        taken.push(head.offset());
    }

    Ok(taken)
}

/// Push a batch of offsets.
///
/// When the head block is full, the next offset to push becomes the new
/// head block instead, linked to the old head.
pub(crate) fn append(
    manager: &BlockManager,
    state: &mut AllocState,
    offsets: &[BlockOffset],
) -> Result<()> {
    let mut rest = offsets;

    while let Some((&first, tail)) = rest.split_first() {
        let head = manager.get_free_list_block(state.free_list_head)?;
        let total = head.total_free()?;

        let pushed = head.extend(rest)?;
        if pushed > 0 {
            head.set_total_free(total.saturating_add(pushed as u32))?;
            rest = &rest[pushed..];
            continue;
        }

        let new_head = manager.get_free_list_block(first)?;
        new_head.init(total, Some(head.offset()))?;
        debug!("Free-list head {} full, {} becomes head", head.offset(), first);
        state.free_list_head = first;
        manager.persist_free_list_head(first)?;
        rest = tail;
    }

    Ok(())
}

/// Take one specific offset off the list.
///
/// Returns `false` if the offset is not listed. The totals of every block
/// from the head down to the one that listed it drop by one.
pub(crate) fn take(
    manager: &BlockManager,
    state: &AllocState,
    offset: BlockOffset,
) -> Result<bool> {
    let mut visited = Vec::new();
    let mut current = Some(state.free_list_head);

    while let Some(at) = current {
        if at == offset {
            return Err(Error::invalid_argument(format!(
                "block {offset} holds the free list"
            )));
        }
        if visited.len() as u32 >= manager.block_count() {
            return Err(Error::corrupt(format!(
                "free list starting at {} loops",
                state.free_list_head
            )));
        }

        let block = manager.get_free_list_block(at)?;
        current = block.next()?;
        let listed = block.remove(offset)?;
        visited.push(block);
        if listed {
            for block in &visited {
                block.set_total_free(block.total_free()?.saturating_sub(1))?;
            }
            return Ok(true);
        }
    }
    Ok(false)
}

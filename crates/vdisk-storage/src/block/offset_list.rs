//! Offset-list blocks: file, file continuation and free list
//!
//! All three kinds store a signed 32-bit count followed by packed block
//! offsets. They differ only in their fixed header.

use super::{BlockRef, impl_continuation};
use crate::identity::BlockHandle;
use crate::layout;
use crate::manager::BlockManager;
use std::sync::Arc;
use vdisk_common::{BlockOffset, Error, Result};

#[derive(Clone, Copy)]
struct OffsetList {
    header: usize,
    count_pos: usize,
}

const FILE: OffsetList = OffsetList {
    header: layout::FILE_HEADER,
    count_pos: layout::FILE_COUNT_POS,
};

const FILE_CONTINUATION: OffsetList = OffsetList {
    header: layout::FILE_CONTINUATION_HEADER,
    count_pos: layout::FILE_CONTINUATION_COUNT_POS,
};

const FREE_LIST: OffsetList = OffsetList {
    header: layout::FREE_LIST_HEADER,
    count_pos: layout::FREE_LIST_COUNT_POS,
};

impl OffsetList {
    const fn capacity(self, block_size: u32) -> usize {
        layout::offset_capacity(block_size, self.header)
    }

    fn decode_count(self, bytes: &[u8], block: &BlockRef) -> Result<usize> {
        let raw = layout::read_i32(bytes, self.count_pos);
        let capacity = self.capacity(block.block_size());
        usize::try_from(raw)
            .ok()
            .filter(|&count| count <= capacity)
            .ok_or_else(|| {
                Error::corrupt(format!(
                    "block {} holds {} offsets, capacity is {}",
                    block.offset(),
                    raw,
                    capacity
                ))
            })
    }

    fn slot(self, index: usize) -> usize {
        self.header + index * layout::OFFSET_SIZE
    }

    fn encode(self, bytes: &mut [u8], offsets: &[BlockOffset]) {
        for (index, offset) in offsets.iter().enumerate() {
            let pos = self.slot(index);
            bytes[pos..pos + layout::OFFSET_SIZE].copy_from_slice(&offset.get().to_le_bytes());
        }
        let count = offsets.len() as i32;
        bytes[self.count_pos..self.count_pos + 4].copy_from_slice(&count.to_le_bytes());
    }

    fn count(self, block: &BlockRef) -> Result<usize> {
        let bytes = block.load()?;
        self.decode_count(&bytes, block)
    }

    fn offsets(self, block: &BlockRef) -> Result<Vec<BlockOffset>> {
        let bytes = block.load()?;
        let count = self.decode_count(&bytes, block)?;
        Ok((0..count)
            .map(|index| BlockOffset::new(layout::read_u32(&bytes, self.slot(index))))
            .collect())
    }

    fn extend(self, block: &BlockRef, offsets: &[BlockOffset]) -> Result<usize> {
        let mut bytes = block.load()?;
        let count = self.decode_count(&bytes, block)?;
        let room = self.capacity(block.block_size()) - count;
        let taken = room.min(offsets.len());
        if taken == 0 {
            return Ok(0);
        }

        let mut all: Vec<_> = (0..count)
            .map(|index| BlockOffset::new(layout::read_u32(&bytes, self.slot(index))))
            .collect();
        all.extend_from_slice(&offsets[..taken]);
        self.encode(&mut bytes, &all);
        block.store(&bytes)?;
        Ok(taken)
    }

    /// Remove up to `n` offsets from the end, most recently pushed first
    fn pop_many(self, block: &BlockRef, n: usize) -> Result<Vec<BlockOffset>> {
        let mut bytes = block.load()?;
        let count = self.decode_count(&bytes, block)?;
        let taken = n.min(count);
        if taken == 0 {
            return Ok(Vec::new());
        }

        let popped = (count - taken..count)
            .rev()
            .map(|index| BlockOffset::new(layout::read_u32(&bytes, self.slot(index))))
            .collect();
        bytes[self.slot(count - taken)..self.slot(count)].fill(0);
        let remaining = (count - taken) as i32;
        bytes[self.count_pos..self.count_pos + 4].copy_from_slice(&remaining.to_le_bytes());
        block.store(&bytes)?;
        Ok(popped)
    }

    /// Remove one offset wherever it sits, keeping the order of the rest
    fn remove(self, block: &BlockRef, offset: BlockOffset) -> Result<bool> {
        let mut bytes = block.load()?;
        let count = self.decode_count(&bytes, block)?;
        let mut all: Vec<_> = (0..count)
            .map(|index| BlockOffset::new(layout::read_u32(&bytes, self.slot(index))))
            .collect();
        let Some(index) = all.iter().position(|&listed| listed == offset) else {
            return Ok(false);
        };

        all.remove(index);
        bytes[self.slot(count - 1)..self.slot(count)].fill(0);
        self.encode(&mut bytes, &all);
        block.store(&bytes)?;
        Ok(true)
    }

    /// Rewrite the list wholesale, keeping the header fields outside it
    fn rewrite(
        self,
        block: &BlockRef,
        bytes: &mut [u8],
        offsets: &[BlockOffset],
        next: Option<BlockOffset>,
    ) -> Result<()> {
        let capacity = self.capacity(block.block_size());
        if offsets.len() > capacity {
            return Err(Error::invalid_argument(format!(
                "{} offsets do not fit into a block holding {}",
                offsets.len(),
                capacity
            )));
        }
        let link = layout::link_pos(block.block_size());
        bytes[self.header..link].fill(0);
        self.encode(bytes, offsets);
        bytes[link..].copy_from_slice(&BlockOffset::to_link(next).to_le_bytes());
        Ok(())
    }
}

/// Primary block of a file: its logical size and first data offsets
#[derive(Clone)]
pub struct FileBlock {
    block: BlockRef,
    handle: Arc<BlockHandle>,
}

impl FileBlock {
    pub(crate) fn new(manager: BlockManager, handle: Arc<BlockHandle>) -> Self {
        Self {
            block: BlockRef::tracked(manager, handle.offset(), Arc::clone(&handle)),
            handle,
        }
    }

    /// Identity handle of this block
    #[must_use]
    pub const fn handle(&self) -> &Arc<BlockHandle> {
        &self.handle
    }

    /// Logical file size in bytes
    pub fn size(&self) -> Result<i64> {
        self.block.read_i64(0)
    }

    pub fn set_size(&self, size: i64) -> Result<()> {
        self.block.write_field(0, &size.to_le_bytes())
    }

    /// Number of offsets this block can hold
    #[must_use]
    pub fn capacity(&self) -> usize {
        FILE.capacity(self.block.block_size())
    }

    pub fn count(&self) -> Result<usize> {
        FILE.count(&self.block)
    }

    /// Data offsets stored in this block only
    pub fn offsets(&self) -> Result<Vec<BlockOffset>> {
        FILE.offsets(&self.block)
    }

    /// Append as many offsets as fit, returning how many were stored
    pub fn extend(&self, offsets: &[BlockOffset]) -> Result<usize> {
        FILE.extend(&self.block, offsets)
    }

    /// Replace size, offsets and link in a single block write
    pub fn rewrite(
        &self,
        size: i64,
        offsets: &[BlockOffset],
        next: Option<BlockOffset>,
    ) -> Result<()> {
        let mut bytes = self.block.load()?;
        FILE.rewrite(&self.block, &mut bytes, offsets, next)?;
        bytes[..8].copy_from_slice(&size.to_le_bytes());
        self.block.store(&bytes)
    }
}

/// Overflow block of a file's offset list
#[derive(Clone)]
pub struct FileContinuationBlock {
    block: BlockRef,
    handle: Arc<BlockHandle>,
}

impl FileContinuationBlock {
    pub(crate) fn new(manager: BlockManager, handle: Arc<BlockHandle>) -> Self {
        Self {
            block: BlockRef::tracked(manager, handle.offset(), Arc::clone(&handle)),
            handle,
        }
    }

    /// Identity handle of this block
    #[must_use]
    pub const fn handle(&self) -> &Arc<BlockHandle> {
        &self.handle
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        FILE_CONTINUATION.capacity(self.block.block_size())
    }

    pub fn count(&self) -> Result<usize> {
        FILE_CONTINUATION.count(&self.block)
    }

    pub fn offsets(&self) -> Result<Vec<BlockOffset>> {
        FILE_CONTINUATION.offsets(&self.block)
    }

    pub fn extend(&self, offsets: &[BlockOffset]) -> Result<usize> {
        FILE_CONTINUATION.extend(&self.block, offsets)
    }

    /// Replace offsets and link in a single block write
    pub fn rewrite(&self, offsets: &[BlockOffset], next: Option<BlockOffset>) -> Result<()> {
        let mut bytes = self.block.load()?;
        FILE_CONTINUATION.rewrite(&self.block, &mut bytes, offsets, next)?;
        self.block.store(&bytes)
    }
}

/// One block of the free-list stack.
///
/// The head block's `totalFreeBlockCount` covers the whole chain: its own
/// count plus the total of its successor.
#[derive(Clone)]
pub struct FreeListBlock {
    block: BlockRef,
}

impl FreeListBlock {
    pub(crate) fn new(manager: BlockManager, offset: BlockOffset) -> Self {
        Self {
            block: BlockRef::untracked(manager, offset),
        }
    }

    /// Free blocks recorded in this block and its successors
    pub fn total_free(&self) -> Result<u32> {
        let raw = self.block.read_i32(0)?;
        u32::try_from(raw).map_err(|_| {
            Error::corrupt(format!(
                "free-list block {} has negative total {}",
                self.block.offset(),
                raw
            ))
        })
    }

    pub fn set_total_free(&self, total: u32) -> Result<()> {
        self.block.write_field(0, &(total as i32).to_le_bytes())
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        FREE_LIST.capacity(self.block.block_size())
    }

    pub fn count(&self) -> Result<usize> {
        FREE_LIST.count(&self.block)
    }

    pub fn is_full(&self) -> Result<bool> {
        Ok(self.count()? >= self.capacity())
    }

    pub fn offsets(&self) -> Result<Vec<BlockOffset>> {
        FREE_LIST.offsets(&self.block)
    }

    pub fn extend(&self, offsets: &[BlockOffset]) -> Result<usize> {
        FREE_LIST.extend(&self.block, offsets)
    }

    /// Pop up to `n` offsets, most recently freed first
    pub fn pop_many(&self, n: usize) -> Result<Vec<BlockOffset>> {
        FREE_LIST.pop_many(&self.block, n)
    }

    /// Drop `offset` from this block. Returns `false` if it is not listed here.
    pub fn remove(&self, offset: BlockOffset) -> Result<bool> {
        FREE_LIST.remove(&self.block, offset)
    }

    /// Turn this block into an empty list block with the given total and successor
    pub fn init(&self, total: u32, next: Option<BlockOffset>) -> Result<()> {
        let mut bytes = vec![0u8; self.block.block_size() as usize];
        FREE_LIST.rewrite(&self.block, &mut bytes, &[], next)?;
        bytes[..4].copy_from_slice(&(total as i32).to_le_bytes());
        self.block.store(&bytes)
    }
}

impl_continuation!(FileBlock, FileContinuationBlock, FreeListBlock);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ContinuationBlock;
    use crate::space::HeapSpace;
    use vdisk_common::CacheConfig;

    fn manager() -> BlockManager {
        let space = HeapSpace::new(64 * 512).unwrap();
        BlockManager::format(Box::new(space), 512, &CacheConfig::default()).unwrap()
    }

    fn offsets(raw: impl IntoIterator<Item = u32>) -> Vec<BlockOffset> {
        raw.into_iter().map(BlockOffset::new).collect()
    }

    #[test]
    fn test_file_block_fields() {
        let manager = manager();
        let file = manager.allocate_file_block().unwrap();
        assert_eq!(file.size().unwrap(), 0);
        assert_eq!(file.count().unwrap(), 0);
        assert_eq!(file.capacity(), 124);

        file.set_size(1000).unwrap();
        assert_eq!(file.extend(&offsets([10, 11])).unwrap(), 2);
        assert_eq!(file.size().unwrap(), 1000);
        assert_eq!(file.offsets().unwrap(), offsets([10, 11]));
    }

    #[test]
    fn test_extend_stops_at_capacity() {
        let manager = manager();
        let cont = manager.allocate_file_continuation_block().unwrap();
        assert_eq!(cont.capacity(), 126);

        let many = offsets(100..300);
        assert_eq!(cont.extend(&many).unwrap(), 126);
        assert_eq!(cont.extend(&many).unwrap(), 0);
        assert_eq!(cont.offsets().unwrap(), many[..126].to_vec());
    }

    #[test]
    fn test_rewrite_replaces_everything() {
        let manager = manager();
        let file = manager.allocate_file_block().unwrap();
        file.extend(&offsets([1, 2, 3])).unwrap();

        file.rewrite(7, &offsets([9]), Some(BlockOffset::new(12))).unwrap();
        assert_eq!(file.size().unwrap(), 7);
        assert_eq!(file.offsets().unwrap(), offsets([9]));
        assert_eq!(file.next().unwrap(), Some(BlockOffset::new(12)));

        let too_many = offsets(0..200);
        assert!(matches!(
            file.rewrite(0, &too_many, None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_free_list_pop_is_lifo() {
        let manager = manager();
        let head = manager.get_free_list_block(manager.meta().unwrap().free_list_head).unwrap();
        head.init(0, None).unwrap();

        head.extend(&offsets([20, 21, 22])).unwrap();
        assert_eq!(head.pop_many(2).unwrap(), offsets([22, 21]));
        head.extend(&offsets([23, 24])).unwrap();
        assert!(head.remove(BlockOffset::new(23)).unwrap());
        assert!(!head.remove(BlockOffset::new(23)).unwrap());
        assert_eq!(head.offsets().unwrap(), offsets([20, 24]));
        assert_eq!(head.pop_many(1).unwrap(), offsets([24]));
        assert_eq!(head.pop_many(5).unwrap(), offsets([20]));
        assert!(head.pop_many(1).unwrap().is_empty());
    }

    #[test]
    fn test_free_list_init() {
        let manager = manager();
        let head = manager.get_free_list_block(manager.meta().unwrap().free_list_head).unwrap();
        head.extend(&offsets([30])).unwrap();

        head.init(250, Some(BlockOffset::new(40))).unwrap();
        assert_eq!(head.total_free().unwrap(), 250);
        assert_eq!(head.count().unwrap(), 0);
        assert_eq!(head.next().unwrap(), Some(BlockOffset::new(40)));
        assert!(!head.is_full().unwrap());
    }

    #[test]
    fn test_corrupt_count() {
        let manager = manager();
        let file = manager.allocate_file_block().unwrap();
        let mut bytes = vec![0u8; 512];
        bytes[layout::FILE_COUNT_POS..layout::FILE_COUNT_POS + 4]
            .copy_from_slice(&500i32.to_le_bytes());
        manager.write_raw(file.offset(), &bytes).unwrap();

        assert!(matches!(file.offsets(), Err(Error::DiskCorrupt(_))));
    }

    #[test]
    fn test_file_views_journal_changes() {
        let manager = manager();
        let file = manager.allocate_file_block().unwrap();
        let before = manager.journal_len().unwrap();

        file.set_size(42).unwrap();
        assert_eq!(manager.journal_len().unwrap(), before + 1);

        // Free-list bookkeeping never reaches the journal
        let head = manager.get_free_list_block(manager.meta().unwrap().free_list_head).unwrap();
        head.set_total_free(0).unwrap();
        assert_eq!(manager.journal_len().unwrap(), before + 1);
    }
}

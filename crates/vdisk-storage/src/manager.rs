//! Block manager
//!
//! Owns the persistence space and provides:
//! - Block allocation from the free list, then from the space break
//! - Freeing with eager reclamation of the trailing block
//! - Typed views over blocks
//! - Raw data block I/O and the change journal hook
//!
//! Lock order inside the manager is journal, then allocator, then identity
//! cache. The allocator never journals, so journal growth may allocate.

use crate::block::{
    BlockKind, BlockView, DirectoryBlock, DirectoryContinuationBlock, FileBlock,
    FileContinuationBlock, FreeListBlock, JournalBlock, JournalEntry,
};
use crate::free_list;
use crate::identity::IdentityCache;
use crate::journal::{Journal, JournalReservation};
use crate::layout::{self, MetaBlock, meta};
use crate::space::PersistenceSpace;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info};
use vdisk_common::config::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use vdisk_common::{BlockOffset, CacheConfig, Error, Result};

/// Allocator state guarded by the allocator mutex
#[derive(Clone, Debug)]
pub(crate) struct AllocState {
    /// Every offset below the break has been handed out at least once
    pub(crate) space_break: u32,
    pub(crate) free_list_head: BlockOffset,
}

/// Block manager statistics
#[derive(Debug, Default)]
pub struct ManagerStats {
    pub allocations: AtomicU64,
    pub frees: AtomicU64,
    /// Frees answered by lowering the space break
    pub reclaimed: AtomicU64,
    pub journal_records: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

struct Shared {
    space: Box<dyn PersistenceSpace>,
    block_size: u32,
    block_count: AtomicU32,
    root_directory: BlockOffset,
    journal_head: BlockOffset,
    identity: IdentityCache,
    alloc: Mutex<AllocState>,
    journal: Journal,
    stats: ManagerStats,
}

/// Allocates, frees and interprets the blocks of one disk.
///
/// Cheap to clone; all clones share the same space and state.
#[derive(Clone)]
pub struct BlockManager {
    shared: Arc<Shared>,
}

fn check_block_size(block_size: u32) -> Result<()> {
    if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(Error::Configuration(format!(
            "block size {block_size} must be a power of two between {MIN_BLOCK_SIZE} and \
             {MAX_BLOCK_SIZE}"
        )));
    }
    Ok(())
}

fn blocks_in(capacity: u64, block_size: u32) -> Result<u32> {
    u32::try_from(capacity / u64::from(block_size)).map_err(|_| {
        Error::invalid_argument(format!(
            "capacity {capacity} holds more than {} blocks",
            u32::MAX
        ))
    })
}

impl BlockManager {
    /// Format a space as an empty disk
    pub fn format(
        space: Box<dyn PersistenceSpace>,
        block_size: u32,
        cache: &CacheConfig,
    ) -> Result<Self> {
        check_block_size(block_size)?;
        let capacity = space.capacity()?;
        let block_count = blocks_in(capacity, block_size)?;
        if block_count <= layout::FIRST_CONTENT_OFFSET {
            return Err(Error::invalid_argument(format!(
                "capacity {capacity} is too small for a disk of {block_size} byte blocks"
            )));
        }

        let meta_block = MetaBlock::new(block_count, block_size);
        let reserved = layout::FIRST_CONTENT_OFFSET as usize * block_size as usize;
        space.zero_at(0, reserved)?;
        space.write_at(0, &meta_block.to_bytes()?)?;

        let manager = Self::from_meta(space, &meta_block, cache);
        manager.shared.journal.recover(&manager)?;
        info!(
            "Formatted disk: {} blocks of {} bytes",
            block_count, block_size
        );
        Ok(manager)
    }

    /// Load a previously formatted space
    pub fn load(space: Box<dyn PersistenceSpace>, cache: &CacheConfig) -> Result<Self> {
        let capacity = space.capacity()?;
        if capacity < meta::SIZE as u64 {
            return Err(Error::corrupt("space too small to hold a meta block"));
        }

        let mut bytes = [0u8; meta::SIZE];
        space.read_at(0, &mut bytes)?;
        let meta_block = MetaBlock::from_bytes(&bytes)?;
        meta_block.validate(capacity)?;
        check_block_size(meta_block.block_size).map_err(|_| {
            Error::corrupt(format!("unsupported block size {}", meta_block.block_size))
        })?;

        let manager = Self::from_meta(space, &meta_block, cache);
        manager.shared.journal.recover(&manager)?;

        info!(
            "Loaded disk: {} blocks of {} bytes, space break {}",
            meta_block.block_count, meta_block.block_size, meta_block.space_break
        );
        Ok(manager)
    }

    fn from_meta(
        space: Box<dyn PersistenceSpace>,
        meta_block: &MetaBlock,
        cache: &CacheConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                space,
                block_size: meta_block.block_size,
                block_count: AtomicU32::new(meta_block.block_count),
                root_directory: meta_block.root_directory,
                journal_head: meta_block.journal_head,
                identity: IdentityCache::new(cache),
                alloc: Mutex::new(AllocState {
                    space_break: meta_block.space_break,
                    free_list_head: meta_block.free_list_head,
                }),
                journal: Journal::new(meta_block.journal_head),
                stats: ManagerStats::default(),
            }),
        }
    }

    /// Block size in bytes
    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.shared.block_size
    }

    /// Total number of blocks, including the meta block
    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.shared.block_count.load(Ordering::Acquire)
    }

    /// Offset of the root directory
    #[must_use]
    pub fn root_offset(&self) -> BlockOffset {
        self.shared.root_directory
    }

    /// Offset of the first journal block
    #[must_use]
    pub fn journal_head(&self) -> BlockOffset {
        self.shared.journal_head
    }

    /// Current high-water mark
    #[must_use]
    pub fn space_break(&self) -> u32 {
        self.shared.alloc.lock().space_break
    }

    /// Free blocks on the free list (not counting blocks above the space break)
    pub fn free_block_count(&self) -> Result<u32> {
        let alloc = self.shared.alloc.lock();
        free_list::total(self, &alloc)
    }

    /// Blocks that can still be allocated
    pub fn available_blocks(&self) -> Result<u32> {
        let alloc = self.shared.alloc.lock();
        let free = free_list::total(self, &alloc)?;
        Ok(free.saturating_add(self.block_count() - alloc.space_break))
    }

    /// Identity cache of this disk
    #[must_use]
    pub fn identity(&self) -> &IdentityCache {
        &self.shared.identity
    }

    /// Get manager statistics
    #[must_use]
    pub fn stats(&self) -> &ManagerStats {
        &self.shared.stats
    }

    /// Read and decode the meta block
    pub fn meta(&self) -> Result<MetaBlock> {
        let mut bytes = [0u8; meta::SIZE];
        self.shared.space.read_at(0, &mut bytes)?;
        MetaBlock::from_bytes(&bytes)
    }

    fn write_meta(&self, pos: usize, field: &[u8]) -> Result<()> {
        self.shared.space.write_at(pos as u64, field)
    }

    pub(crate) fn persist_free_list_head(&self, head: BlockOffset) -> Result<()> {
        self.write_meta(meta::FREE_LIST_HEAD, &head.get().to_le_bytes())
    }

    fn persist_space_break(&self, space_break: u32) -> Result<()> {
        self.write_meta(meta::SPACE_BREAK, &space_break.to_le_bytes())
    }

    /// Server association name
    pub fn association(&self) -> Result<Option<String>> {
        Ok(self.meta()?.association)
    }

    /// Store or clear the server association name
    pub fn set_association(&self, name: Option<&str>) -> Result<()> {
        let field = layout::encode_association(name)?;
        self.write_meta(meta::ASSOCIATION, &field)?;
        info!("Disk association set to {:?}", name);
        Ok(())
    }

    /// Time of the last completed synchronization
    pub fn last_synchronized(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.meta()?.last_synchronized)
    }

    pub fn set_last_synchronized(&self, at: DateTime<Utc>) -> Result<()> {
        self.write_meta(meta::LAST_SYNCHRONIZED, &layout::encode_date(at).to_le_bytes())
    }

    fn check_offset(&self, offset: BlockOffset) -> Result<()> {
        if offset.is_meta() || offset.get() >= self.block_count() {
            return Err(Error::invalid_argument(format!(
                "block offset {} outside 1..{}",
                offset,
                self.block_count()
            )));
        }
        Ok(())
    }

    fn check_range(&self, pos: usize, len: usize) -> Result<()> {
        let block_size = self.block_size() as usize;
        if pos.checked_add(len).is_none_or(|end| end > block_size) {
            return Err(Error::OutOfBounds {
                pos: pos as u64,
                len: len as u64,
                capacity: block_size as u64,
            });
        }
        Ok(())
    }

    fn address(&self, offset: BlockOffset, pos: usize) -> u64 {
        offset.byte_address(self.block_size()) + pos as u64
    }

    /// Copy a whole block
    pub fn read_block(&self, offset: BlockOffset) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; self.block_size() as usize];
        self.read_range(offset, 0, &mut bytes)?;
        Ok(bytes)
    }

    /// Read `buf.len()` bytes starting at `pos` within a block
    pub fn read_range(&self, offset: BlockOffset, pos: usize, buf: &mut [u8]) -> Result<()> {
        self.check_offset(offset)?;
        self.check_range(pos, buf.len())?;
        self.shared.space.read_at(self.address(offset, pos), buf)?;
        self.shared
            .stats
            .bytes_read
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Write `data` starting at `pos` within a block, without journaling
    pub(crate) fn write_range(&self, offset: BlockOffset, pos: usize, data: &[u8]) -> Result<()> {
        self.check_offset(offset)?;
        self.check_range(pos, data.len())?;
        self.shared.space.write_at(self.address(offset, pos), data)?;
        self.shared
            .stats
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn zero_block(&self, offset: BlockOffset) -> Result<()> {
        self.check_offset(offset)?;
        self.shared
            .space
            .zero_at(self.address(offset, 0), self.block_size() as usize)
    }

    /// Overwrite a whole block, zero padding short payloads. Not journaled.
    pub fn write_raw(&self, offset: BlockOffset, data: &[u8]) -> Result<()> {
        let block_size = self.block_size() as usize;
        if data.len() > block_size {
            return Err(Error::invalid_argument(format!(
                "{} bytes do not fit into a {} byte block",
                data.len(),
                block_size
            )));
        }
        self.write_range(offset, 0, data)?;
        if data.len() < block_size {
            self.shared
                .space
                .zero_at(self.address(offset, data.len()), block_size - data.len())?;
        }
        Ok(())
    }

    /// Copy `count` bytes of a data block, starting at `block_index`, into
    /// `dest[dest_index..]`
    pub fn read_data(
        &self,
        offset: BlockOffset,
        dest: &mut [u8],
        dest_index: usize,
        block_index: usize,
        count: usize,
    ) -> Result<()> {
        let end = dest_index
            .checked_add(count)
            .filter(|&end| end <= dest.len())
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "destination of {} bytes cannot take {} bytes at {}",
                    dest.len(),
                    count,
                    dest_index
                ))
            })?;
        self.read_range(offset, block_index, &mut dest[dest_index..end])
    }

    /// Overwrite a data block, zero padding short payloads, and journal it
    pub fn write_data(&self, offset: BlockOffset, data: &[u8]) -> Result<()> {
        self.check_offset(offset)?;
        self.check_range(0, data.len())?;
        self.record_change(offset)?;
        self.write_raw(offset, data)
    }

    /// Append `(now, offset)` to the journal
    pub fn record_change(&self, offset: BlockOffset) -> Result<()> {
        self.record_change_at(offset, Utc::now())
    }

    /// Append a journal record with an explicit date
    pub fn record_change_at(&self, offset: BlockOffset, at: DateTime<Utc>) -> Result<()> {
        self.shared.journal.append(self, JournalEntry { at, offset })?;
        self.shared
            .stats
            .journal_records
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Changed offsets with a date after `since`, one per offset at its latest date
    pub fn changes_since(&self, since: DateTime<Utc>) -> Result<Vec<JournalEntry>> {
        self.shared.journal.changes_since(self, since)
    }

    /// Number of records in the journal chain
    pub fn journal_len(&self) -> Result<usize> {
        self.shared.journal.len(self)
    }

    /// Hold room for `records` journal appends, growing the journal now if needed.
    ///
    /// Appends covered by the reservation never allocate, so an operation
    /// that reserves up front cannot run out of space halfway through.
    pub(crate) fn reserve_journal(&self, records: usize) -> Result<JournalReservation<'_>> {
        self.shared.journal.reserve(self, records)
    }

    /// Allocate one block and zero it
    pub fn allocate_block(&self) -> Result<BlockOffset> {
        let offset = {
            let mut alloc = self.shared.alloc.lock();
            self.allocate_locked(&mut alloc)?
        };
        self.zero_block(offset)?;
        self.shared.stats.allocations.fetch_add(1, Ordering::Relaxed);
        debug!("Allocated block {}", offset);
        Ok(offset)
    }

    fn allocate_locked(&self, alloc: &mut AllocState) -> Result<BlockOffset> {
        if let Some(offset) = free_list::remove(self, alloc, 1)?.pop() {
            return Ok(offset);
        }
        if alloc.space_break < self.block_count() {
            let offset = BlockOffset::new(alloc.space_break);
            alloc.space_break += 1;
            self.persist_space_break(alloc.space_break)?;
            return Ok(offset);
        }
        Err(Error::OutOfDiskSpace)
    }

    /// Allocate `n` zeroed blocks, or none at all
    pub fn allocate_blocks(&self, n: usize) -> Result<Vec<BlockOffset>> {
        let taken = {
            let mut alloc = self.shared.alloc.lock();
            let mut taken = Vec::with_capacity(n);
            while taken.len() < n {
                match self.allocate_locked(&mut alloc) {
                    Ok(offset) => taken.push(offset),
                    Err(err) => {
                        debug!(
                            "Bulk allocation of {} failed after {}, rolling back",
                            n,
                            taken.len()
                        );
                        taken.reverse();
                        self.free_locked(&mut alloc, &taken)?;
                        return Err(err);
                    }
                }
            }
            taken
        };

        for &offset in &taken {
            self.zero_block(offset)?;
        }
        self.shared
            .stats
            .allocations
            .fetch_add(taken.len() as u64, Ordering::Relaxed);
        Ok(taken)
    }

    /// Allocate a zeroed data block
    pub fn allocate_data_block(&self) -> Result<BlockOffset> {
        self.allocate_block()
    }

    /// Allocate a content block and journal its zeroed state
    fn allocate_content_block(&self) -> Result<BlockOffset> {
        let offset = self.allocate_block()?;
        self.record_change(offset)?;
        Ok(offset)
    }

    pub fn allocate_directory_block(&self) -> Result<DirectoryBlock> {
        let offset = self.allocate_content_block()?;
        self.get_directory_block(offset)
    }

    pub fn allocate_directory_continuation_block(&self) -> Result<DirectoryContinuationBlock> {
        let offset = self.allocate_content_block()?;
        self.get_directory_continuation_block(offset)
    }

    pub fn allocate_file_block(&self) -> Result<FileBlock> {
        let offset = self.allocate_content_block()?;
        self.get_file_block(offset)
    }

    pub fn allocate_file_continuation_block(&self) -> Result<FileContinuationBlock> {
        let offset = self.allocate_content_block()?;
        self.get_file_continuation_block(offset)
    }

    fn check_freeable(&self, alloc: &AllocState, offset: BlockOffset) -> Result<()> {
        if offset.is_meta() || offset.get() >= alloc.space_break {
            return Err(Error::invalid_argument(format!(
                "block {} was never allocated",
                offset
            )));
        }
        if offset == self.shared.root_directory
            || offset == self.shared.journal_head
            || offset == alloc.free_list_head
        {
            return Err(Error::invalid_argument(format!(
                "block {} is a structural block",
                offset
            )));
        }
        Ok(())
    }

    /// Free one block. Views of it fail with `BlockDeallocated` from now on.
    pub fn free(&self, offset: BlockOffset) -> Result<()> {
        self.free_all(&[offset])
    }

    /// Free a batch of blocks.
    ///
    /// Offsets are released from highest to lowest so a run of trailing
    /// blocks below the space break is reclaimed in one go.
    pub fn free_all(&self, offsets: &[BlockOffset]) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        let mut sorted = offsets.to_vec();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        sorted.dedup();

        let mut alloc = self.shared.alloc.lock();
        for &offset in &sorted {
            self.check_freeable(&alloc, offset)?;
        }
        self.free_locked(&mut alloc, &sorted)
    }

    fn free_locked(&self, alloc: &mut AllocState, offsets: &[BlockOffset]) -> Result<()> {
        let mut pushed = Vec::new();
        for &offset in offsets {
            self.shared.identity.invalidate(offset);
            if offset.get() + 1 == alloc.space_break && pushed.is_empty() {
                alloc.space_break -= 1;
                self.shared.stats.reclaimed.fetch_add(1, Ordering::Relaxed);
            } else {
                pushed.push(offset);
            }
            self.shared.stats.frees.fetch_add(1, Ordering::Relaxed);
        }
        self.persist_space_break(alloc.space_break)?;
        free_list::append(self, alloc, &pushed)?;
        debug!(
            "Freed {} blocks ({} pushed), space break {}",
            offsets.len(),
            pushed.len(),
            alloc.space_break
        );
        Ok(())
    }

    /// Claim `offset` for a block received from another replica.
    ///
    /// The offset is taken off the free list, or the space break is raised
    /// past it, so local allocation never hands it out. Blocks holding the
    /// journal or the free list are refused.
    pub(crate) fn claim_received(&self, offset: BlockOffset) -> Result<()> {
        self.check_offset(offset)?;
        self.shared.journal.with_blocks(self, |journal| {
            if journal.contains(&offset) {
                return Err(Error::invalid_argument(format!(
                    "block {offset} belongs to the journal"
                )));
            }

            let mut alloc = self.shared.alloc.lock();
            if offset.get() >= alloc.space_break {
                alloc.space_break = offset.get() + 1;
                self.persist_space_break(alloc.space_break)?;
                debug!("Space break raised to {}", alloc.space_break);
            } else if free_list::take(self, &alloc, offset)? {
                debug!("Took received block {} off the free list", offset);
            }
            Ok(())
        })
    }

    /// Grow or shrink the disk. Fails if blocks at or above the new end are in use.
    pub fn resize(&self, new_capacity: u64) -> Result<()> {
        let new_count = blocks_in(new_capacity, self.block_size())?;
        let alloc = self.shared.alloc.lock();
        if new_count < alloc.space_break {
            return Err(Error::invalid_argument(format!(
                "cannot shrink to {} blocks, {} are in use",
                new_count, alloc.space_break
            )));
        }

        self.shared.space.resize(new_capacity)?;
        self.shared.block_count.store(new_count, Ordering::Release);
        self.write_meta(meta::BLOCK_COUNT, &new_count.to_le_bytes())?;
        info!("Disk resized to {} blocks", new_count);
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.shared.space.flush()
    }

    /// Release the persistence space. Every later access fails with `Disposed`.
    pub fn close(&self) -> Result<()> {
        self.shared.space.close()?;
        info!("Disk closed");
        Ok(())
    }

    pub fn get_directory_block(&self, offset: BlockOffset) -> Result<DirectoryBlock> {
        self.check_offset(offset)?;
        Ok(DirectoryBlock::new(self.clone(), self.shared.identity.handle(offset)))
    }

    pub fn get_directory_continuation_block(
        &self,
        offset: BlockOffset,
    ) -> Result<DirectoryContinuationBlock> {
        self.check_offset(offset)?;
        Ok(DirectoryContinuationBlock::new(
            self.clone(),
            self.shared.identity.handle(offset),
        ))
    }

    pub fn get_file_block(&self, offset: BlockOffset) -> Result<FileBlock> {
        self.check_offset(offset)?;
        Ok(FileBlock::new(self.clone(), self.shared.identity.handle(offset)))
    }

    pub fn get_file_continuation_block(
        &self,
        offset: BlockOffset,
    ) -> Result<FileContinuationBlock> {
        self.check_offset(offset)?;
        Ok(FileContinuationBlock::new(
            self.clone(),
            self.shared.identity.handle(offset),
        ))
    }

    pub fn get_free_list_block(&self, offset: BlockOffset) -> Result<FreeListBlock> {
        self.check_offset(offset)?;
        Ok(FreeListBlock::new(self.clone(), offset))
    }

    pub fn get_journal_block(&self, offset: BlockOffset) -> Result<JournalBlock> {
        self.check_offset(offset)?;
        Ok(JournalBlock::new(self.clone(), offset))
    }

    /// Interpret a block as the given kind. The kind is not verified.
    pub fn view(&self, offset: BlockOffset, kind: BlockKind) -> Result<BlockView> {
        Ok(match kind {
            BlockKind::Directory => BlockView::Directory(self.get_directory_block(offset)?),
            BlockKind::DirectoryContinuation => {
                BlockView::DirectoryContinuation(self.get_directory_continuation_block(offset)?)
            }
            BlockKind::File => BlockView::File(self.get_file_block(offset)?),
            BlockKind::FileContinuation => {
                BlockView::FileContinuation(self.get_file_continuation_block(offset)?)
            }
            BlockKind::FreeList => BlockView::FreeList(self.get_free_list_block(offset)?),
            BlockKind::Journal => BlockView::Journal(self.get_journal_block(offset)?),
        })
    }

    #[cfg(test)]
    pub(crate) fn alloc_state(&self) -> AllocState {
        self.shared.alloc.lock().clone()
    }
}

//! Typed block views
//!
//! A view is a non-owning projection of one block: the block manager, the
//! block offset and, for content blocks, the block's identity handle.
//! Content views (directory, directory continuation, file, file
//! continuation) refuse every access once their block has been freed.
//!
//! Mutations are read-modify-write of the whole block, so a single logical
//! change produces a single journal entry. The entry is appended before
//! the block is written.

pub mod directory;
pub mod journal;
pub mod offset_list;

pub use directory::{DirectoryBlock, DirectoryContinuationBlock, DirectoryEntries, DirectoryEntry};
pub use journal::{JournalBlock, JournalEntry};
pub use offset_list::{FileBlock, FileContinuationBlock, FreeListBlock};

use crate::identity::BlockHandle;
use crate::layout;
use crate::manager::BlockManager;
use std::fmt;
use std::sync::Arc;
use vdisk_common::{BlockOffset, Result};

/// Capability shared by every block kind that can be chained
pub trait ContinuationBlock {
    /// Offset of this block
    fn offset(&self) -> BlockOffset;

    /// Offset of the next block in the chain
    fn next(&self) -> Result<Option<BlockOffset>>;

    /// Link (or unlink) the next block in the chain
    fn set_next(&self, next: Option<BlockOffset>) -> Result<()>;
}

/// Kinds of typed blocks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Directory,
    DirectoryContinuation,
    File,
    FileContinuation,
    FreeList,
    Journal,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Directory => "directory",
            Self::DirectoryContinuation => "directory-continuation",
            Self::File => "file",
            Self::FileContinuation => "file-continuation",
            Self::FreeList => "free-list",
            Self::Journal => "journal",
        };
        f.write_str(name)
    }
}

/// A block interpreted as one of the typed kinds
#[derive(Clone)]
pub enum BlockView {
    Directory(DirectoryBlock),
    DirectoryContinuation(DirectoryContinuationBlock),
    File(FileBlock),
    FileContinuation(FileContinuationBlock),
    FreeList(FreeListBlock),
    Journal(JournalBlock),
}

impl BlockView {
    /// Kind of this view
    #[must_use]
    pub const fn kind(&self) -> BlockKind {
        match self {
            Self::Directory(_) => BlockKind::Directory,
            Self::DirectoryContinuation(_) => BlockKind::DirectoryContinuation,
            Self::File(_) => BlockKind::File,
            Self::FileContinuation(_) => BlockKind::FileContinuation,
            Self::FreeList(_) => BlockKind::FreeList,
            Self::Journal(_) => BlockKind::Journal,
        }
    }

    fn as_continuation(&self) -> &dyn ContinuationBlock {
        match self {
            Self::Directory(block) => block,
            Self::DirectoryContinuation(block) => block,
            Self::File(block) => block,
            Self::FileContinuation(block) => block,
            Self::FreeList(block) => block,
            Self::Journal(block) => block,
        }
    }
}

impl ContinuationBlock for BlockView {
    fn offset(&self) -> BlockOffset {
        self.as_continuation().offset()
    }

    fn next(&self) -> Result<Option<BlockOffset>> {
        self.as_continuation().next()
    }

    fn set_next(&self, next: Option<BlockOffset>) -> Result<()> {
        self.as_continuation().set_next(next)
    }
}

/// Shared plumbing of every typed view
#[derive(Clone)]
pub(crate) struct BlockRef {
    manager: BlockManager,
    offset: BlockOffset,
    handle: Option<Arc<BlockHandle>>,
    journaled: bool,
}

impl BlockRef {
    /// A content block: guarded by its handle and journaled on change
    pub(crate) const fn tracked(
        manager: BlockManager,
        offset: BlockOffset,
        handle: Arc<BlockHandle>,
    ) -> Self {
        Self {
            manager,
            offset,
            handle: Some(handle),
            journaled: true,
        }
    }

    /// A bookkeeping block (free list, journal): neither guarded nor journaled
    pub(crate) const fn untracked(manager: BlockManager, offset: BlockOffset) -> Self {
        Self {
            manager,
            offset,
            handle: None,
            journaled: false,
        }
    }

    pub(crate) const fn offset(&self) -> BlockOffset {
        self.offset
    }

    pub(crate) const fn manager(&self) -> &BlockManager {
        &self.manager
    }

    pub(crate) fn block_size(&self) -> u32 {
        self.manager.block_size()
    }

    pub(crate) fn check(&self) -> Result<()> {
        match &self.handle {
            Some(handle) => handle.ensure_live(),
            None => Ok(()),
        }
    }

    /// Copy the whole block
    pub(crate) fn load(&self) -> Result<Vec<u8>> {
        self.check()?;
        self.manager.read_block(self.offset)
    }

    /// Write back the whole block
    pub(crate) fn store(&self, bytes: &[u8]) -> Result<()> {
        self.check()?;
        self.journal()?;
        self.manager.write_range(self.offset, 0, bytes)?;
        self.bump();
        Ok(())
    }

    /// Zero the whole block
    pub(crate) fn clear(&self) -> Result<()> {
        self.check()?;
        self.journal()?;
        self.manager.zero_block(self.offset)?;
        self.bump();
        Ok(())
    }

    pub(crate) fn read_u32(&self, pos: usize) -> Result<u32> {
        let mut field = [0u8; 4];
        self.check()?;
        self.manager.read_range(self.offset, pos, &mut field)?;
        Ok(u32::from_le_bytes(field))
    }

    pub(crate) fn read_i32(&self, pos: usize) -> Result<i32> {
        let mut field = [0u8; 4];
        self.check()?;
        self.manager.read_range(self.offset, pos, &mut field)?;
        Ok(i32::from_le_bytes(field))
    }

    pub(crate) fn read_i64(&self, pos: usize) -> Result<i64> {
        let mut field = [0u8; 8];
        self.check()?;
        self.manager.read_range(self.offset, pos, &mut field)?;
        Ok(i64::from_le_bytes(field))
    }

    pub(crate) fn write_field(&self, pos: usize, field: &[u8]) -> Result<()> {
        self.check()?;
        self.journal()?;
        self.manager.write_range(self.offset, pos, field)?;
        self.bump();
        Ok(())
    }

    pub(crate) fn next(&self) -> Result<Option<BlockOffset>> {
        let raw = self.read_u32(layout::link_pos(self.block_size()))?;
        Ok(BlockOffset::from_link(raw))
    }

    pub(crate) fn set_next(&self, next: Option<BlockOffset>) -> Result<()> {
        let raw = BlockOffset::to_link(next);
        self.write_field(layout::link_pos(self.block_size()), &raw.to_le_bytes())
    }

    /// Journal the coming write. A full journal that cannot grow fails
    /// here, before the block is touched.
    fn journal(&self) -> Result<()> {
        if self.journaled {
            self.manager.record_change(self.offset)?;
        }
        Ok(())
    }

    fn bump(&self) {
        if let Some(handle) = &self.handle {
            handle.bump_version();
        }
    }
}

/// Implement `ContinuationBlock` for a view wrapping a `BlockRef` in `self.block`
macro_rules! impl_continuation {
    ($($view:ty),+ $(,)?) => {
        $(
            impl $crate::block::ContinuationBlock for $view {
                fn offset(&self) -> vdisk_common::BlockOffset {
                    self.block.offset()
                }

                fn next(&self) -> vdisk_common::Result<Option<vdisk_common::BlockOffset>> {
                    self.block.next()
                }

                fn set_next(
                    &self,
                    next: Option<vdisk_common::BlockOffset>,
                ) -> vdisk_common::Result<()> {
                    self.block.set_next(next)
                }
            }
        )+
    };
}

pub(crate) use impl_continuation;

//! Directory and directory-continuation blocks
//!
//! Both kinds hold packed `[nameLen:1][flags:1][targetOffset:4][name]`
//! entries terminated by a zero length byte. A directory block prefixes
//! them with its cached `totalSize`; a continuation block starts with the
//! entries directly. Names are unique across a directory's whole chain,
//! which callers enforce while holding the directory lock.

use super::{BlockRef, ContinuationBlock, impl_continuation};
use crate::identity::BlockHandle;
use crate::layout::{self, EntryFlags};
use crate::manager::BlockManager;
use std::collections::VecDeque;
use std::sync::Arc;
use vdisk_common::{BlockOffset, Error, Result};

/// A directory entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Entry name
    pub name: String,
    /// Block the entry points at
    pub target: BlockOffset,
    /// Entry flags
    pub flags: EntryFlags,
}

impl DirectoryEntry {
    /// Check if the entry names a directory
    #[must_use]
    pub const fn is_directory(&self) -> bool {
        self.flags.contains(EntryFlags::DIRECTORY)
    }
}

fn region_end(block: &BlockRef) -> usize {
    layout::link_pos(block.block_size())
}

fn entries(block: &BlockRef, header: usize) -> Result<Vec<DirectoryEntry>> {
    let bytes = block.load()?;
    let packed = layout::decode_entries(&bytes[header..region_end(block)])?;
    Ok(packed
        .into_iter()
        .map(|entry| DirectoryEntry {
            name: entry.name,
            target: entry.target,
            flags: entry.flags,
        })
        .collect())
}

fn find(block: &BlockRef, header: usize, name: &str) -> Result<Option<DirectoryEntry>> {
    Ok(entries(block, header)?
        .into_iter()
        .find(|entry| entry.name == name))
}

fn try_add(
    block: &BlockRef,
    header: usize,
    name: &str,
    flags: EntryFlags,
    target: BlockOffset,
) -> Result<bool> {
    let mut bytes = block.load()?;
    let end = region_end(block);
    if !layout::try_append_entry(&mut bytes[header..end], name, flags, target)? {
        return Ok(false);
    }
    block.store(&bytes)?;
    Ok(true)
}

fn remove(block: &BlockRef, header: usize, name: &str) -> Result<Option<DirectoryEntry>> {
    let mut bytes = block.load()?;
    let end = region_end(block);
    let region = &mut bytes[header..end];

    let Some(entry) = layout::decode_entries(region)?
        .into_iter()
        .find(|entry| entry.name == name)
    else {
        return Ok(None);
    };

    layout::remove_entry(region, entry.pos, entry.len);
    block.store(&bytes)?;
    Ok(Some(DirectoryEntry {
        name: entry.name,
        target: entry.target,
        flags: entry.flags,
    }))
}

/// Primary block of a directory
#[derive(Clone)]
pub struct DirectoryBlock {
    block: BlockRef,
    handle: Arc<BlockHandle>,
}

impl DirectoryBlock {
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

    /// Aggregate logical size of the files below this directory
    pub fn total_size(&self) -> Result<i64> {
        self.block.read_i64(0)
    }

    /// Overwrite the cached aggregate size
    pub fn set_total_size(&self, size: i64) -> Result<()> {
        self.block.write_field(0, &size.to_le_bytes())
    }

    /// Entries stored in this block only
    pub fn entries(&self) -> Result<Vec<DirectoryEntry>> {
        entries(&self.block, layout::DIRECTORY_HEADER)
    }

    /// Find an entry in this block only
    pub fn find(&self, name: &str) -> Result<Option<DirectoryEntry>> {
        find(&self.block, layout::DIRECTORY_HEADER, name)
    }

    /// Append an entry. Returns `false` if this block has no room for it.
    pub fn try_add(&self, name: &str, flags: EntryFlags, target: BlockOffset) -> Result<bool> {
        try_add(&self.block, layout::DIRECTORY_HEADER, name, flags, target)
    }

    /// Remove an entry from this block, returning it if it was present
    pub fn remove(&self, name: &str) -> Result<Option<DirectoryEntry>> {
        remove(&self.block, layout::DIRECTORY_HEADER, name)
    }

    /// Lazily enumerate the entries of the whole chain
    #[must_use]
    pub fn chain_entries(&self) -> DirectoryEntries {
        DirectoryEntries {
            primary: self.clone(),
            pending: VecDeque::new(),
            next_block: None,
            visited: 0,
            started: false,
            done: false,
        }
    }
}

/// Overflow block of a directory
#[derive(Clone)]
pub struct DirectoryContinuationBlock {
    block: BlockRef,
    handle: Arc<BlockHandle>,
}

impl DirectoryContinuationBlock {
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

    /// Entries stored in this block
    pub fn entries(&self) -> Result<Vec<DirectoryEntry>> {
        entries(&self.block, layout::DIRECTORY_CONTINUATION_HEADER)
    }

    /// Find an entry in this block
    pub fn find(&self, name: &str) -> Result<Option<DirectoryEntry>> {
        find(&self.block, layout::DIRECTORY_CONTINUATION_HEADER, name)
    }

    /// Append an entry. Returns `false` if this block has no room for it.
    pub fn try_add(&self, name: &str, flags: EntryFlags, target: BlockOffset) -> Result<bool> {
        try_add(
            &self.block,
            layout::DIRECTORY_CONTINUATION_HEADER,
            name,
            flags,
            target,
        )
    }

    /// Remove an entry from this block, returning it if it was present
    pub fn remove(&self, name: &str) -> Result<Option<DirectoryEntry>> {
        remove(&self.block, layout::DIRECTORY_CONTINUATION_HEADER, name)
    }
}

impl_continuation!(DirectoryBlock, DirectoryContinuationBlock);

/// Lazy iterator over every entry of a directory chain.
///
/// The primary block's deallocation state is re-checked before every
/// yielded entry, so freeing the directory mid-enumeration surfaces as
/// `BlockDeallocated` instead of stale entries. A chain visiting more
/// blocks than the disk holds is reported as `DiskCorrupt`.
pub struct DirectoryEntries {
    primary: DirectoryBlock,
    pending: VecDeque<DirectoryEntry>,
    next_block: Option<BlockOffset>,
    /// Continuation blocks loaded so far
    visited: u32,
    started: bool,
    done: bool,
}

impl DirectoryEntries {
    fn load_next(&mut self) -> Result<bool> {
        let (entries, next) = if self.started {
            let Some(offset) = self.next_block.take() else {
                return Ok(false);
            };
            let manager = self.primary.block.manager();
            self.visited += 1;
            if self.visited >= manager.block_count() {
                return Err(Error::corrupt(format!(
                    "directory chain starting at {} loops",
                    self.primary.offset()
                )));
            }
            let block = manager.get_directory_continuation_block(offset)?;
            (block.entries()?, block.next()?)
        } else {
            self.started = true;
            (self.primary.entries()?, self.primary.next()?)
        };

        if next == Some(self.primary.offset()) {
            return Err(Error::corrupt(format!(
                "directory {} links back to itself",
                self.primary.offset()
            )));
        }
        self.pending.extend(entries);
        self.next_block = next;
        Ok(true)
    }
}

impl Iterator for DirectoryEntries {
    type Item = Result<DirectoryEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Err(err) = self.primary.handle.ensure_live() {
                self.done = true;
                return Some(Err(err));
            }
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok(entry));
            }
            match self.load_next() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

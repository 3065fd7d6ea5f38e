//! Chain helpers for directories and files.
//!
//! None of these take locks. Callers hold the primary block lock of the
//! directory or file whose chain they walk.

use crate::block::{ContinuationBlock, DirectoryBlock, DirectoryEntry, FileBlock};
use crate::identity::BlockHandle;
use crate::layout::EntryFlags;
use crate::manager::BlockManager;
use std::sync::Arc;
use vdisk_common::{BlockOffset, Error, Result};

/// Journal records [`insert`] may append: a new continuation block, the entry and its link
pub(crate) const INSERT_RECORDS: usize = 3;

/// Journal records [`remove`] may append: the entry and an unlink
pub(crate) const REMOVE_RECORDS: usize = 2;

/// Continuation offsets of a chain, guarding against loops
fn links(
    manager: &BlockManager,
    first: &dyn ContinuationBlock,
    mut step: impl FnMut(BlockOffset) -> Result<Option<BlockOffset>>,
) -> Result<Vec<BlockOffset>> {
    let mut offsets = Vec::new();
    let mut next = first.next()?;
    while let Some(offset) = next {
        if offsets.len() as u32 >= manager.block_count() || offset == first.offset() {
            return Err(Error::corrupt(format!(
                "chain starting at {} loops",
                first.offset()
            )));
        }
        offsets.push(offset);
        next = step(offset)?;
    }
    Ok(offsets)
}

/// Offsets of a directory's continuation blocks, in chain order
pub(crate) fn directory_continuations(
    manager: &BlockManager,
    dir: &DirectoryBlock,
) -> Result<Vec<BlockOffset>> {
    links(manager, dir, |offset| {
        manager.get_directory_continuation_block(offset)?.next()
    })
}

pub(crate) fn entries(dir: &DirectoryBlock) -> Result<Vec<DirectoryEntry>> {
    dir.chain_entries().collect()
}

pub(crate) fn find(dir: &DirectoryBlock, name: &str) -> Result<Option<DirectoryEntry>> {
    for entry in dir.chain_entries() {
        let entry = entry?;
        if entry.name == name {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

/// Add an entry to the first block of the chain with room for it.
///
/// If no block has room, a continuation block is allocated, filled and
/// only then linked to the end of the chain.
pub(crate) fn insert(
    manager: &BlockManager,
    dir: &DirectoryBlock,
    name: &str,
    flags: EntryFlags,
    target: BlockOffset,
) -> Result<()> {
    if dir.try_add(name, flags, target)? {
        return Ok(());
    }

    let mut last: Box<dyn ContinuationBlock> = Box::new(dir.clone());
    for offset in directory_continuations(manager, dir)? {
        let cont = manager.get_directory_continuation_block(offset)?;
        if cont.try_add(name, flags, target)? {
            return Ok(());
        }
        last = Box::new(cont);
    }

    let cont = manager.allocate_directory_continuation_block()?;
    let linked = cont
        .try_add(name, flags, target)
        .and_then(|added| {
            if added {
                Ok(())
            } else {
                Err(Error::illegal_name(name))
            }
        })
        .and_then(|()| last.set_next(Some(cont.offset())));
    if let Err(err) = linked {
        manager.free(cont.offset())?;
        return Err(err);
    }
    Ok(())
}

/// Remove an entry from the chain.
///
/// A continuation block left empty is unlinked and freed.
pub(crate) fn remove(
    manager: &BlockManager,
    dir: &DirectoryBlock,
    name: &str,
) -> Result<Option<DirectoryEntry>> {
    if let Some(entry) = dir.remove(name)? {
        return Ok(Some(entry));
    }

    let mut previous: Box<dyn ContinuationBlock> = Box::new(dir.clone());
    for offset in directory_continuations(manager, dir)? {
        let cont = manager.get_directory_continuation_block(offset)?;
        if let Some(entry) = cont.remove(name)? {
            if cont.entries()?.is_empty() {
                previous.set_next(cont.next()?)?;
                manager.free(offset)?;
            }
            return Ok(Some(entry));
        }
        previous = Box::new(cont);
    }
    Ok(None)
}

/// Data and continuation offsets of a file, in chain order
pub(crate) struct FileChain {
    pub(crate) data: Vec<BlockOffset>,
    pub(crate) continuations: Vec<BlockOffset>,
}

pub(crate) fn file_chain(manager: &BlockManager, file: &FileBlock) -> Result<FileChain> {
    let mut data = file.offsets()?;
    let continuations = links(manager, file, |offset| {
        let cont = manager.get_file_continuation_block(offset)?;
        data.extend(cont.offsets()?);
        cont.next()
    })?;
    Ok(FileChain {
        data,
        continuations,
    })
}

/// Every block owned by a subtree, plus the primary handles to lock
#[derive(Default)]
pub(crate) struct Subtree {
    pub(crate) handles: Vec<Arc<BlockHandle>>,
    pub(crate) blocks: Vec<BlockOffset>,
}

impl Subtree {
    fn add_file(&mut self, manager: &BlockManager, file: &FileBlock) -> Result<()> {
        let chain = file_chain(manager, file)?;
        self.handles.push(Arc::clone(file.handle()));
        self.blocks.push(file.offset());
        self.blocks.extend(chain.continuations);
        self.blocks.extend(chain.data);
        Ok(())
    }

    fn add_directory(&mut self, manager: &BlockManager, dir: &DirectoryBlock) -> Result<()> {
        self.handles.push(Arc::clone(dir.handle()));
        self.blocks.push(dir.offset());
        self.blocks.extend(directory_continuations(manager, dir)?);
        for entry in entries(dir)? {
            if entry.is_directory() {
                self.add_directory(manager, &manager.get_directory_block(entry.target)?)?;
            } else {
                self.add_file(manager, &manager.get_file_block(entry.target)?)?;
            }
        }
        Ok(())
    }
}

pub(crate) fn file_subtree(manager: &BlockManager, file: &FileBlock) -> Result<Subtree> {
    let mut subtree = Subtree::default();
    subtree.add_file(manager, file)?;
    Ok(subtree)
}

pub(crate) fn directory_subtree(
    manager: &BlockManager,
    dir: &DirectoryBlock,
) -> Result<Subtree> {
    let mut subtree = Subtree::default();
    subtree.add_directory(manager, dir)?;
    Ok(subtree)
}

/// Add `delta` to the cached total size of every directory given
pub(crate) fn adjust_total_sizes<'a>(
    dirs: impl IntoIterator<Item = &'a DirectoryBlock>,
    delta: i64,
) -> Result<()> {
    if delta == 0 {
        return Ok(());
    }
    for dir in dirs {
        dir.set_total_size(dir.total_size()? + delta)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::HeapSpace;
    use vdisk_common::CacheConfig;

    fn manager() -> BlockManager {
        let space = HeapSpace::new(256 * 512).unwrap();
        BlockManager::format(Box::new(space), 512, &CacheConfig::default()).unwrap()
    }

    fn long_name(n: usize) -> String {
        format!("{n:0>200}")
    }

    #[test]
    fn test_insert_overflows_into_continuation() {
        let manager = manager();
        let dir = manager.allocate_directory_block().unwrap();

        // 206 byte entries: two fit into the 500 byte primary region
        for n in 0..2 {
            insert(&manager, &dir, &long_name(n), EntryFlags::empty(), BlockOffset::new(9))
                .unwrap();
        }
        assert!(directory_continuations(&manager, &dir).unwrap().is_empty());

        insert(&manager, &dir, &long_name(2), EntryFlags::empty(), BlockOffset::new(9)).unwrap();
        let conts = directory_continuations(&manager, &dir).unwrap();
        assert_eq!(conts.len(), 1);
        assert_eq!(entries(&dir).unwrap().len(), 3);
        assert!(find(&dir, &long_name(2)).unwrap().is_some());
    }

    #[test]
    fn test_insert_reuses_room_in_primary() {
        let manager = manager();
        let dir = manager.allocate_directory_block().unwrap();
        for n in 0..3 {
            insert(&manager, &dir, &long_name(n), EntryFlags::empty(), BlockOffset::new(9))
                .unwrap();
        }

        remove(&manager, &dir, &long_name(0)).unwrap().unwrap();
        insert(&manager, &dir, "short", EntryFlags::empty(), BlockOffset::new(10)).unwrap();
        assert!(dir.find("short").unwrap().is_some());
        assert_eq!(directory_continuations(&manager, &dir).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_frees_empty_continuation() {
        let manager = manager();
        let dir = manager.allocate_directory_block().unwrap();
        for n in 0..3 {
            insert(&manager, &dir, &long_name(n), EntryFlags::empty(), BlockOffset::new(9))
                .unwrap();
        }
        let cont = directory_continuations(&manager, &dir).unwrap()[0];
        let cont_handle = manager.identity().handle(cont);

        let removed = remove(&manager, &dir, &long_name(2)).unwrap().unwrap();
        assert_eq!(removed.target, BlockOffset::new(9));
        assert!(directory_continuations(&manager, &dir).unwrap().is_empty());
        assert!(cont_handle.is_freed());
        assert!(remove(&manager, &dir, "missing").unwrap().is_none());
    }

    #[test]
    fn test_file_chain_spans_continuations() {
        let manager = manager();
        let file = manager.allocate_file_block().unwrap();
        let cont = manager.allocate_file_continuation_block().unwrap();

        let first: Vec<_> = (100..224).map(BlockOffset::new).collect();
        file.rewrite(0, &first, Some(cont.offset())).unwrap();
        cont.rewrite(&[BlockOffset::new(224), BlockOffset::new(225)], None).unwrap();

        let chain = file_chain(&manager, &file).unwrap();
        assert_eq!(chain.data.len(), 126);
        assert_eq!(chain.data[125], BlockOffset::new(225));
        assert_eq!(chain.continuations, vec![cont.offset()]);
    }

    #[test]
    fn test_chain_loop_detected() {
        let manager = manager();
        let dir = manager.allocate_directory_block().unwrap();
        let cont = manager.allocate_directory_continuation_block().unwrap();
        dir.set_next(Some(cont.offset())).unwrap();
        cont.set_next(Some(cont.offset())).unwrap();

        assert!(matches!(
            directory_continuations(&manager, &dir),
            Err(Error::DiskCorrupt(_))
        ));
    }

    #[test]
    fn test_adjust_total_sizes() {
        let manager = manager();
        let a = manager.allocate_directory_block().unwrap();
        let b = manager.allocate_directory_block().unwrap();
        adjust_total_sizes([&a, &b], 300).unwrap();
        adjust_total_sizes([&b], -100).unwrap();
        assert_eq!(a.total_size().unwrap(), 300);
        assert_eq!(b.total_size().unwrap(), 200);
    }
}

use super::{Location, Node, TreeNode, VirtualFile, VirtualPath, chain, non_negative};
use crate::block::{DirectoryBlock, DirectoryEntry};
use crate::identity::BlockHandle;
use crate::layout::{self, EntryFlags};
use crate::lock;
use crate::manager::BlockManager;
use std::sync::Arc;
use tracing::debug;
use vdisk_common::{BlockOffset, Error, Result};

/// A directory of the virtual tree
#[derive(Clone)]
pub struct VirtualDirectory {
    manager: BlockManager,
    block: DirectoryBlock,
    location: Location,
}

impl VirtualDirectory {
    pub(crate) const fn new(
        manager: BlockManager,
        block: DirectoryBlock,
        location: Location,
    ) -> Self {
        Self {
            manager,
            block,
            location,
        }
    }

    /// The root directory of a disk
    pub fn root(manager: &BlockManager) -> Result<Self> {
        let block = manager.get_directory_block(manager.root_offset())?;
        Ok(Self::new(manager.clone(), block, Location::root()))
    }

    /// Directory name; empty for the root
    #[must_use]
    pub fn name(&self) -> &str {
        self.location.name()
    }

    /// Absolute path this directory was resolved at
    #[must_use]
    pub fn path(&self) -> &str {
        self.location.path()
    }

    #[must_use]
    pub fn offset(&self) -> BlockOffset {
        self.block.handle().offset()
    }

    #[must_use]
    pub fn handle(&self) -> &Arc<BlockHandle> {
        self.block.handle()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.location.ancestors().is_empty()
    }

    /// Primary block of this directory
    #[must_use]
    pub const fn block(&self) -> &DirectoryBlock {
        &self.block
    }

    pub(crate) const fn location(&self) -> &Location {
        &self.location
    }

    fn read_locked<T>(&self, read: impl FnOnce() -> Result<T>) -> Result<T> {
        let _locks = lock::enter(&[Arc::clone(self.block.handle())], &[])?;
        read()
    }

    /// Total size of every file below this directory
    pub fn total_size(&self) -> Result<u64> {
        let size = self.read_locked(|| self.block.total_size())?;
        non_negative(size, "directory total size")
    }

    /// Entries of the whole chain
    pub fn entries(&self) -> Result<Vec<DirectoryEntry>> {
        self.read_locked(|| chain::entries(&self.block))
    }

    /// Child nodes of the whole chain
    pub fn children(&self) -> Result<Vec<Node>> {
        self.read_locked(|| {
            chain::entries(&self.block)?
                .iter()
                .map(|entry| Node::from_entry(&self.manager, &self.block, &self.location, entry))
                .collect()
        })
    }

    /// Look up a direct child by name
    pub fn get(&self, name: &str) -> Result<Option<Node>> {
        self.read_locked(|| {
            chain::find(&self.block, name)?
                .map(|entry| Node::from_entry(&self.manager, &self.block, &self.location, &entry))
                .transpose()
        })
    }

    /// Resolve a path. Absolute paths start over from the root.
    pub fn navigate(&self, path: &str) -> Result<Node> {
        let parsed = VirtualPath::parse(path)?;
        let mut current = if parsed.absolute {
            Self::root(&self.manager)?
        } else {
            self.clone()
        };

        let Some((last, parents)) = parsed.segments.split_last() else {
            return Ok(Node::Directory(current));
        };
        for segment in parents {
            current = match current.get(segment)? {
                Some(Node::Directory(dir)) => dir,
                _ => return Err(Error::PathNotFound(path.to_string())),
            };
        }
        current
            .get(last)?
            .ok_or_else(|| Error::PathNotFound(path.to_string()))
    }

    fn create_entry(
        &self,
        name: &str,
        flags: EntryFlags,
        allocate: impl FnOnce() -> Result<BlockOffset>,
    ) -> Result<BlockOffset> {
        layout::validate_name(name)?;
        let _locks = lock::enter(&[], &[Arc::clone(self.block.handle())])?;

        if chain::find(&self.block, name)?.is_some() {
            return Err(Error::PathAlreadyExists(
                self.location.child(&self.block, name).path().to_string(),
            ));
        }

        // One record for the new block, the rest for its entry
        let _journal = self.manager.reserve_journal(1 + chain::INSERT_RECORDS)?;
        let offset = allocate()?;
        if let Err(err) = chain::insert(&self.manager, &self.block, name, flags, offset) {
            self.manager.free(offset)?;
            return Err(err);
        }
        debug!("Created {} at block {} in {}", name, offset, self.path());
        Ok(offset)
    }

    /// Create an empty subdirectory
    pub fn create_directory(&self, name: &str) -> Result<Self> {
        let offset = self.create_entry(name, EntryFlags::DIRECTORY, || {
            Ok(self.manager.allocate_directory_block()?.handle().offset())
        })?;
        Ok(Self::new(
            self.manager.clone(),
            self.manager.get_directory_block(offset)?,
            self.location.child(&self.block, name),
        ))
    }

    /// Create an empty file
    pub fn create_file(&self, name: &str) -> Result<VirtualFile> {
        let offset = self.create_entry(name, EntryFlags::empty(), || {
            Ok(self.manager.allocate_file_block()?.handle().offset())
        })?;
        Ok(VirtualFile::new(
            self.manager.clone(),
            self.manager.get_file_block(offset)?,
            self.location.child(&self.block, name),
        ))
    }

    pub fn rename(&mut self, new_name: &str) -> Result<()> {
        super::rename_node(self, new_name)
    }

    /// Move this directory into `dest`, keeping its name
    pub fn move_to(&mut self, dest: &Self) -> Result<()> {
        super::move_node(self, dest)
    }

    /// Delete this directory and everything below it
    pub fn delete(self) -> Result<()> {
        super::delete_node(&self)
    }
}

impl TreeNode for VirtualDirectory {
    fn manager(&self) -> &BlockManager {
        &self.manager
    }

    fn location(&self) -> &Location {
        &self.location
    }

    fn location_mut(&mut self) -> &mut Location {
        &mut self.location
    }

    fn node_handle(&self) -> &Arc<BlockHandle> {
        self.block.handle()
    }

    fn contributed_size(&self) -> Result<i64> {
        self.block.total_size()
    }

    fn subtree(&self) -> Result<chain::Subtree> {
        chain::directory_subtree(&self.manager, &self.block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ContinuationBlock;
    use crate::disk::VirtualDisk;
    use std::sync::atomic::Ordering;
    use vdisk_common::DiskConfig;

    fn disk() -> VirtualDisk {
        VirtualDisk::create_in_memory(256 * 512, &DiskConfig::with_block_size(512)).unwrap()
    }

    #[test]
    fn test_create_and_list() {
        let disk = disk();
        let root = disk.root().unwrap();
        root.create_directory("docs").unwrap();
        root.create_file("readme").unwrap();

        let mut names: Vec<_> = root.entries().unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, vec!["docs", "readme"]);

        let children = root.children().unwrap();
        assert_eq!(children.iter().filter(|node| node.is_directory()).count(), 1);
    }

    #[test]
    fn test_create_existing_fails() {
        let disk = disk();
        let root = disk.root().unwrap();
        root.create_directory("a").unwrap();
        assert!(matches!(root.create_file("a"), Err(Error::PathAlreadyExists(p)) if p == "/a"));
        assert!(matches!(root.create_directory("a/b"), Err(Error::IllegalPathOrName(_))));
    }

    #[test]
    fn test_navigate_nested() {
        let disk = disk();
        let root = disk.root().unwrap();
        let a = root.create_directory("a").unwrap();
        let b = a.create_directory("b").unwrap();
        b.create_file("c.txt").unwrap();
        assert_eq!(b.path(), "/a/b");

        let node = a.navigate("b/c.txt").unwrap();
        assert_eq!(node.path(), "/a/b/c.txt");
        assert!(!node.is_directory());

        let same = b.navigate("/a/b/c.txt").unwrap();
        assert_eq!(same.offset(), node.offset());
        assert!(root.navigate("/").unwrap().is_directory());

        assert!(matches!(root.navigate("/a/missing"), Err(Error::PathNotFound(_))));
        assert!(matches!(root.navigate("/a/b/c.txt/d"), Err(Error::PathNotFound(_))));
        assert!(matches!(root.navigate("/a//b"), Err(Error::IllegalPathOrName(_))));
    }

    #[test]
    fn test_navigate_shares_identity() {
        let disk = disk();
        disk.root().unwrap().create_directory("shared").unwrap();

        let first = disk.navigate("/shared").unwrap();
        let second = disk.navigate("/shared").unwrap();
        assert!(Arc::ptr_eq(first.handle(), second.handle()));
        assert!(Arc::ptr_eq(first.handle().lock(), second.handle().lock()));
    }

    #[test]
    fn test_many_entries_spill_into_continuations() {
        let disk = disk();
        let root = disk.root().unwrap();
        for n in 0..120 {
            root.create_file(&format!("file-{n:03}")).unwrap();
        }
        assert_eq!(root.entries().unwrap().len(), 120);
        assert!(root.block().next().is_ok_and(|next| next.is_some()));
        assert!(disk.navigate("/file-119").is_ok());
    }

    #[test]
    fn test_rename() {
        let disk = disk();
        let root = disk.root().unwrap();
        let mut dir = root.create_directory("old").unwrap();
        root.create_directory("taken").unwrap();

        assert!(matches!(dir.rename("taken"), Err(Error::PathAlreadyExists(_))));
        dir.rename("new").unwrap();
        assert_eq!(dir.path(), "/new");
        assert!(disk.navigate("/old").is_err());
        assert_eq!(disk.navigate("/new").unwrap().offset(), dir.offset());

        let mut root = disk.root().unwrap();
        assert!(matches!(root.rename("x"), Err(Error::IllegalPathOrName(_))));
    }

    #[test]
    fn test_move_updates_total_sizes() {
        let disk = disk();
        let root = disk.root().unwrap();
        let src = root.create_directory("src").unwrap();
        let dst = root.create_directory("dst").unwrap();
        let mut inner = src.create_directory("inner").unwrap();
        inner.create_file("data").unwrap().write_all(&[7u8; 1000]).unwrap();

        assert_eq!(src.total_size().unwrap(), 1000);
        assert_eq!(root.total_size().unwrap(), 1000);

        inner.move_to(&dst).unwrap();
        assert_eq!(inner.path(), "/dst/inner");
        assert_eq!(src.total_size().unwrap(), 0);
        assert_eq!(dst.total_size().unwrap(), 1000);
        assert_eq!(root.total_size().unwrap(), 1000);

        let file = disk.navigate("/dst/inner/data").unwrap().into_file().unwrap();
        assert_eq!(file.read_all().unwrap(), vec![7u8; 1000]);
    }

    #[test]
    fn test_move_into_descendant_rejected() {
        let disk = disk();
        let root = disk.root().unwrap();
        let mut a = root.create_directory("a").unwrap();
        let b = a.create_directory("b").unwrap();

        assert!(matches!(a.move_to(&b), Err(Error::IllegalPathOrName(_))));
        let same = disk.navigate("/a").unwrap().into_directory().unwrap();
        assert!(matches!(a.move_to(&same), Err(Error::IllegalPathOrName(_))));
    }

    #[test]
    fn test_move_name_clash() {
        let disk = disk();
        let root = disk.root().unwrap();
        let dst = root.create_directory("dst").unwrap();
        dst.create_file("x").unwrap();
        let mut x = root.create_file("x").unwrap();

        assert!(matches!(x.move_to(&dst), Err(Error::PathAlreadyExists(p)) if p == "/dst/x"));
        assert!(disk.navigate("/x").is_ok());
    }

    #[test]
    fn test_move_into_stale_destination_rejected() {
        let disk = disk();
        let root = disk.root().unwrap();
        let mut a = root.create_directory("a").unwrap();
        let mut b = root.create_directory("b").unwrap();
        let a_stale = a.clone();

        a.move_to(&b).unwrap();
        assert!(matches!(b.move_to(&a_stale), Err(Error::PathNotFound(p)) if p == "/a"));

        // Nothing was unlinked: b stays under the root and still holds a
        assert_eq!(b.path(), "/b");
        let names: Vec<_> = root.entries().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["b"]);
        assert_eq!(disk.navigate("/b/a").unwrap().offset(), a.offset());
    }

    #[test]
    fn test_full_disk_journal_growth_leaves_tree_intact() {
        let disk =
            VirtualDisk::create_in_memory(16 * 512, &DiskConfig::with_block_size(512)).unwrap();
        let root = disk.root().unwrap();

        let mut created = 0;
        loop {
            match root.create_file(&format!("f{created}")) {
                Ok(_) => created += 1,
                Err(err) => {
                    assert!(matches!(err, Error::OutOfDiskSpace), "{err}");
                    break;
                }
            }
        }
        assert!(created > 0);
        assert_eq!(root.entries().unwrap().len(), created);

        // Renames keep journaling until the journal needs a block it cannot get
        let mut file = disk.navigate("/f0").unwrap();
        let mut failure = None;
        for n in 0..1_000 {
            let name = if n % 2 == 0 { "g" } else { "f0" };
            if let Err(err) = file.rename(name) {
                failure = Some(err);
                break;
            }
        }
        assert!(matches!(failure, Some(Error::OutOfDiskSpace)));

        let names: Vec<_> = root.entries().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names.len(), created);
        assert!(names.iter().any(|name| name == file.name()));
        assert_eq!(disk.navigate(file.path()).unwrap().offset(), file.offset());
    }

    #[test]
    fn test_recursive_delete_frees_everything() {
        let disk = disk();
        let root = disk.root().unwrap();
        let frees = || disk.manager().stats().frees.load(Ordering::Relaxed);

        let top = root.create_directory("top").unwrap();
        let sub = top.create_directory("sub").unwrap();
        sub.create_file("f").unwrap().write_all(&vec![1u8; 512 * 130]).unwrap();
        for n in 0..60 {
            top.create_file(&format!("empty-{n:02}")).unwrap();
        }
        assert_eq!(root.total_size().unwrap(), 512 * 130);

        let sub_handle = Arc::clone(sub.handle());
        let before = frees();
        top.delete().unwrap();

        // top + its continuation, sub, f + its continuation, 130 data blocks, 60 files
        assert_eq!(frees() - before, 2 + 1 + 2 + 130 + 60);
        assert!(sub_handle.is_freed());
        assert_eq!(root.total_size().unwrap(), 0);
        assert!(root.entries().unwrap().is_empty());
        assert!(matches!(sub.entries(), Err(Error::BlockDeallocated { .. })));
    }

    #[test]
    fn test_delete_root_rejected() {
        let disk = disk();
        assert!(matches!(disk.root().unwrap().delete(), Err(Error::IllegalPathOrName(_))));
    }
}

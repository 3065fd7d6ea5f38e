//! Virtual directory tree
//!
//! Nodes are snapshots of a resolved path: the node's own block plus the
//! directory blocks from the root down to its parent. The ancestor chain
//! is what keeps cached `TotalSize` values correct when a file changes
//! size, so every size-changing operation write-locks it together with
//! the node through a single [`lock::enter`] call.
//!
//! A node that was moved by another handle keeps its old ancestry;
//! navigate again to get a fresh one.

mod chain;
mod directory;
mod file;
pub mod path;

pub use directory::VirtualDirectory;
pub use file::{FileReader, VirtualFile};
pub use path::VirtualPath;

use crate::block::{DirectoryBlock, DirectoryEntry};
use crate::identity::BlockHandle;
use crate::layout;
use crate::lock;
use crate::manager::BlockManager;
use chain::Subtree;
use std::collections::BTreeMap;
use std::iter;
use std::sync::Arc;
use tracing::debug;
use vdisk_common::{BlockOffset, Error, Result};

/// Where a node sits in the tree
#[derive(Clone)]
pub(crate) struct Location {
    name: String,
    path: String,
    /// Directories from the root down to the parent
    ancestors: Vec<DirectoryBlock>,
}

impl Location {
    pub(crate) fn root() -> Self {
        Self {
            name: String::new(),
            path: path::SEPARATOR.to_string(),
            ancestors: Vec::new(),
        }
    }

    /// Location of the entry `name` inside the directory at `self`
    pub(crate) fn child(&self, dir: &DirectoryBlock, name: &str) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(dir.clone());
        let path = if self.ancestors.is_empty() {
            format!("{}{}", path::SEPARATOR, name)
        } else {
            format!("{}{}{}", self.path, path::SEPARATOR, name)
        };
        Self {
            name: name.to_string(),
            path,
            ancestors,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn ancestors(&self) -> &[DirectoryBlock] {
        &self.ancestors
    }

    fn parent(&self) -> Result<&DirectoryBlock> {
        self.ancestors
            .last()
            .ok_or_else(|| Error::IllegalPathOrName(self.path.clone()))
    }

    fn ancestor_handles(&self) -> impl Iterator<Item = Arc<BlockHandle>> + '_ {
        self.ancestors.iter().map(|dir| Arc::clone(dir.handle()))
    }

    fn rename(&mut self, name: &str) {
        let cut = self.path.len() - self.name.len();
        self.path.truncate(cut);
        self.path.push_str(name);
        self.name = name.to_string();
    }

    /// Location of this node's name inside `dest`
    fn child_of(&self, dest: &VirtualDirectory) -> Self {
        dest.location().child(dest.block(), &self.name)
    }

    /// Find this node's entry in its parent, checking it still names `offset`
    fn entry_in_parent(&self, offset: BlockOffset) -> Result<DirectoryEntry> {
        chain::find(self.parent()?, &self.name)?
            .filter(|entry| entry.target == offset)
            .ok_or_else(|| Error::PathNotFound(self.path.clone()))
    }

    /// Check that the recorded path from the root still leads to `offset`.
    ///
    /// Every ancestor must still list the next one under the same name.
    /// Callers hold the ancestors' locks.
    fn verify(&self, offset: BlockOffset) -> Result<()> {
        let names = self
            .path
            .split(path::SEPARATOR)
            .filter(|segment| !segment.is_empty());
        let targets = self
            .ancestors
            .iter()
            .skip(1)
            .map(|dir| dir.handle().offset())
            .chain(iter::once(offset));

        for ((dir, name), target) in self.ancestors.iter().zip(names).zip(targets) {
            let linked = chain::find(dir, name)?.is_some_and(|entry| entry.target == target);
            if !linked {
                return Err(Error::PathNotFound(self.path.clone()));
            }
        }
        Ok(())
    }
}

/// Node-specific pieces of the shared rename / move / delete logic
pub(crate) trait TreeNode {
    fn manager(&self) -> &BlockManager;
    fn location(&self) -> &Location;
    fn location_mut(&mut self) -> &mut Location;
    fn node_handle(&self) -> &Arc<BlockHandle>;
    /// Bytes this node contributes to its ancestors' total size
    fn contributed_size(&self) -> Result<i64>;
    /// Every block owned by this node and its descendants
    fn subtree(&self) -> Result<Subtree>;

    fn node_offset(&self) -> BlockOffset {
        self.node_handle().offset()
    }
}

pub(crate) fn rename_node(node: &mut impl TreeNode, new_name: &str) -> Result<()> {
    layout::validate_name(new_name)?;
    let parent = node.location().parent()?.clone();
    let _locks = lock::enter(&[], &[Arc::clone(parent.handle())])?;

    let entry = node.location().entry_in_parent(node.node_offset())?;
    if entry.name == new_name {
        return Ok(());
    }
    if chain::find(&parent, new_name)?.is_some() {
        let mut taken = node.location().clone();
        taken.rename(new_name);
        return Err(Error::PathAlreadyExists(taken.path));
    }

    let manager = node.manager().clone();
    let _journal = manager.reserve_journal(chain::REMOVE_RECORDS + 2 * chain::INSERT_RECORDS)?;
    chain::remove(&manager, &parent, &entry.name)?;
    if let Err(err) = chain::insert(&manager, &parent, new_name, entry.flags, entry.target) {
        chain::insert(&manager, &parent, &entry.name, entry.flags, entry.target)?;
        return Err(err);
    }

    debug!("Renamed {} to {}", node.location().path(), new_name);
    node.location_mut().rename(new_name);
    Ok(())
}

fn refuse_move_into_itself(
    offset: BlockOffset,
    source: &Location,
    dest: &VirtualDirectory,
) -> Result<()> {
    let into_itself = dest.offset() == offset
        || dest
            .location()
            .ancestors()
            .iter()
            .any(|dir| dir.handle().offset() == offset);
    if into_itself {
        return Err(Error::IllegalPathOrName(format!(
            "cannot move {} into {}",
            source.path(),
            dest.path()
        )));
    }
    Ok(())
}

pub(crate) fn move_node(node: &mut impl TreeNode, dest: &VirtualDirectory) -> Result<()> {
    let offset = node.node_offset();
    let source = node.location().clone();
    let parent = source.parent()?.clone();

    refuse_move_into_itself(offset, &source, dest)?;
    if dest.offset() == parent.handle().offset() {
        return Ok(());
    }

    let mut writes: Vec<_> = source.ancestor_handles().collect();
    writes.extend(dest.location().ancestor_handles());
    writes.push(Arc::clone(dest.handle()));
    writes.push(Arc::clone(node.node_handle()));
    let _locks = lock::enter(&[], &writes)?;

    // Either snapshot may predate a move made through another handle
    source.verify(offset)?;
    dest.location().verify(dest.offset())?;
    refuse_move_into_itself(offset, &source, dest)?;

    let entry = source.entry_in_parent(offset)?;
    let target = source.child_of(dest);
    if chain::find(dest.block(), source.name())?.is_some() {
        return Err(Error::PathAlreadyExists(target.path().to_string()));
    }

    let size = node.contributed_size()?;
    let manager = node.manager().clone();
    let adjusted = source.ancestors().len() + target.ancestors().len();
    let _journal =
        manager.reserve_journal(chain::INSERT_RECORDS + chain::REMOVE_RECORDS + adjusted)?;
    chain::insert(&manager, dest.block(), &entry.name, entry.flags, entry.target)?;
    chain::remove(&manager, &parent, &entry.name)?;

    let mut deltas: BTreeMap<BlockOffset, (&DirectoryBlock, i64)> = BTreeMap::new();
    for dir in source.ancestors() {
        deltas.entry(dir.handle().offset()).or_insert((dir, 0)).1 -= size;
    }
    for dir in target.ancestors() {
        deltas.entry(dir.handle().offset()).or_insert((dir, 0)).1 += size;
    }
    for (dir, delta) in deltas.into_values() {
        chain::adjust_total_sizes([dir], delta)?;
    }

    debug!("Moved {} to {}", source.path(), target.path());
    *node.location_mut() = target;
    Ok(())
}

pub(crate) fn delete_node(node: &impl TreeNode) -> Result<()> {
    let location = node.location();
    let offset = node.node_offset();
    location.parent()?;

    // The subtree is collected before locking so it can join the single
    // lock request, then collected again under the locks to verify it.
    loop {
        let subtree = node.subtree()?;
        let mut writes: Vec<_> = location.ancestor_handles().collect();
        writes.extend(subtree.handles.iter().cloned());

        let _locks = match lock::enter(&[], &writes) {
            Ok(locks) => locks,
            Err(Error::BlockDeallocated { offset: freed })
                if freed != offset && subtree.blocks.contains(&freed) =>
            {
                debug!(
                    "Block {} freed while locking {}, retrying",
                    freed,
                    location.path()
                );
                continue;
            }
            Err(err) => return Err(err),
        };
        if node.subtree()?.blocks != subtree.blocks {
            debug!("Subtree of {} changed while locking, retrying", location.path());
            continue;
        }

        location.entry_in_parent(offset)?;
        let size = node.contributed_size()?;
        let manager = node.manager();
        let _journal =
            manager.reserve_journal(chain::REMOVE_RECORDS + location.ancestors().len())?;
        chain::remove(manager, location.parent()?, location.name())?;
        chain::adjust_total_sizes(location.ancestors(), -size)?;
        manager.free_all(&subtree.blocks)?;

        debug!("Deleted {} ({} blocks)", location.path(), subtree.blocks.len());
        return Ok(());
    }
}

/// A resolved tree node
#[derive(Clone)]
pub enum Node {
    Directory(VirtualDirectory),
    File(VirtualFile),
}

impl Node {
    pub(crate) fn from_entry(
        manager: &BlockManager,
        parent: &DirectoryBlock,
        location: &Location,
        entry: &DirectoryEntry,
    ) -> Result<Self> {
        let location = location.child(parent, &entry.name);
        Ok(if entry.is_directory() {
            Self::Directory(VirtualDirectory::new(
                manager.clone(),
                manager.get_directory_block(entry.target)?,
                location,
            ))
        } else {
            Self::File(VirtualFile::new(
                manager.clone(),
                manager.get_file_block(entry.target)?,
                location,
            ))
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Directory(dir) => dir.name(),
            Self::File(file) => file.name(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Directory(dir) => dir.path(),
            Self::File(file) => file.path(),
        }
    }

    #[must_use]
    pub fn offset(&self) -> BlockOffset {
        match self {
            Self::Directory(dir) => dir.offset(),
            Self::File(file) => file.offset(),
        }
    }

    /// Identity handle of the node's primary block
    #[must_use]
    pub fn handle(&self) -> &Arc<BlockHandle> {
        match self {
            Self::Directory(dir) => dir.handle(),
            Self::File(file) => file.handle(),
        }
    }

    #[must_use]
    pub const fn is_directory(&self) -> bool {
        matches!(self, Self::Directory(_))
    }

    /// File size, or the total size of the files below a directory
    pub fn size(&self) -> Result<u64> {
        match self {
            Self::Directory(dir) => dir.total_size(),
            Self::File(file) => file.size(),
        }
    }

    pub fn rename(&mut self, new_name: &str) -> Result<()> {
        match self {
            Self::Directory(dir) => dir.rename(new_name),
            Self::File(file) => file.rename(new_name),
        }
    }

    pub fn move_to(&mut self, dest: &VirtualDirectory) -> Result<()> {
        match self {
            Self::Directory(dir) => dir.move_to(dest),
            Self::File(file) => file.move_to(dest),
        }
    }

    pub fn delete(self) -> Result<()> {
        match self {
            Self::Directory(dir) => dir.delete(),
            Self::File(file) => file.delete(),
        }
    }

    pub fn into_directory(self) -> Result<VirtualDirectory> {
        match self {
            Self::Directory(dir) => Ok(dir),
            Self::File(file) => Err(Error::PathNotFound(format!(
                "{} is not a directory",
                file.path()
            ))),
        }
    }

    pub fn into_file(self) -> Result<VirtualFile> {
        match self {
            Self::File(file) => Ok(file),
            Self::Directory(dir) => Err(Error::PathNotFound(format!(
                "{} is not a file",
                dir.path()
            ))),
        }
    }
}

pub(crate) fn non_negative(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::corrupt(format!("{what} is negative: {value}")))
}

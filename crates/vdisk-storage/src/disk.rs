//! Virtual disk
//!
//! The entry point of the engine: creates or opens a disk over a
//! persistence space and hands out the root of its tree.

use crate::manager::BlockManager;
use crate::space::{HeapSpace, MappedSpace, PersistenceSpace};
use crate::tree::{Node, VirtualDirectory};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::info;
use vdisk_common::{DiskConfig, Result};

/// An open virtual disk
pub struct VirtualDisk {
    manager: BlockManager,
    config: DiskConfig,
    path: Option<PathBuf>,
}

impl VirtualDisk {
    /// Create a memory-mapped disk file of `capacity` bytes
    pub fn create(path: impl AsRef<Path>, capacity: u64, config: &DiskConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let space = MappedSpace::create(&path, capacity)?;
        let disk = Self::format(Box::new(space), config, Some(path))?;
        info!("Created disk {}", disk.describe());
        Ok(disk)
    }

    /// Open an existing disk file
    pub fn open(path: impl AsRef<Path>, config: &DiskConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let space = MappedSpace::open(&path)?;
        let disk = Self::load(Box::new(space), config, Some(path))?;
        info!("Opened disk {}", disk.describe());
        Ok(disk)
    }

    /// Create a growable in-memory disk
    pub fn create_in_memory(capacity: u64, config: &DiskConfig) -> Result<Self> {
        config.validate()?;
        let space = HeapSpace::new(capacity)?;
        Self::format(Box::new(space), config, None)
    }

    /// Format an arbitrary persistence space
    pub fn format(
        space: Box<dyn PersistenceSpace>,
        config: &DiskConfig,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        let manager = BlockManager::format(space, config.block_size, &config.cache)?;
        Ok(Self {
            manager,
            config: config.clone(),
            path,
        })
    }

    /// Load a disk from an arbitrary persistence space.
    ///
    /// The block size is taken from the meta block, not from `config`.
    pub fn load(
        space: Box<dyn PersistenceSpace>,
        config: &DiskConfig,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        let manager = BlockManager::load(space, &config.cache)?;
        Ok(Self {
            manager,
            config: config.clone(),
            path,
        })
    }

    fn describe(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => "<memory>".to_string(),
        }
    }

    /// Backing file, if the disk is file-backed
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub const fn manager(&self) -> &BlockManager {
        &self.manager
    }

    #[must_use]
    pub const fn config(&self) -> &DiskConfig {
        &self.config
    }

    pub fn root(&self) -> Result<VirtualDirectory> {
        VirtualDirectory::root(&self.manager)
    }

    /// Resolve an absolute or root-relative path
    pub fn navigate(&self, path: &str) -> Result<Node> {
        self.root()?.navigate(path)
    }

    /// Bind the disk to a server, or clear the binding with `None`
    pub fn associate(&self, name: Option<&str>) -> Result<()> {
        self.manager.set_association(name)
    }

    pub fn association(&self) -> Result<Option<String>> {
        self.manager.association()
    }

    pub fn last_synchronized(&self) -> Result<Option<DateTime<Utc>>> {
        self.manager.last_synchronized()
    }

    /// Change the capacity. Only in-memory disks can be resized.
    pub fn resize(&self, new_capacity: u64) -> Result<()> {
        self.manager.resize(new_capacity)
    }

    pub fn flush(&self) -> Result<()> {
        self.manager.flush()
    }

    /// Close the disk, flushing first unless configured otherwise
    pub fn close(self) -> Result<()> {
        if self.config.flush_on_close {
            self.manager.flush()?;
        }
        self.manager.close()?;
        info!("Closed disk {}", self.describe());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ContinuationBlock;
    use std::sync::Arc;
    use tempfile::tempdir;
    use vdisk_common::{BlockOffset, Error};

    fn config() -> DiskConfig {
        DiskConfig::with_block_size(512)
    }

    #[test]
    fn test_create_close_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.vdisk");

        let disk = VirtualDisk::create(&path, 128 * 512, &config()).unwrap();
        let docs = disk.root().unwrap().create_directory("docs").unwrap();
        docs.create_file("note").unwrap().write_all(b"persisted").unwrap();
        disk.associate(Some("server-a")).unwrap();
        assert_eq!(disk.path(), Some(path.as_path()));
        disk.close().unwrap();

        let disk = VirtualDisk::open(&path, &DiskConfig::default()).unwrap();
        assert_eq!(disk.manager().block_size(), 512);
        assert_eq!(disk.association().unwrap().as_deref(), Some("server-a"));
        let note = disk.navigate("/docs/note").unwrap().into_file().unwrap();
        assert_eq!(note.read_all().unwrap(), b"persisted");
        assert_eq!(disk.root().unwrap().total_size().unwrap(), 9);

        // allocation resumes above the persisted space break
        let other = disk.root().unwrap().create_file("other").unwrap();
        assert!(other.offset().get() >= 4);
        assert_ne!(other.offset(), note.offset());
    }

    #[test]
    fn test_open_garbage_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.vdisk");
        std::fs::write(&path, vec![0xAB; 4096]).unwrap();
        assert!(matches!(
            VirtualDisk::open(&path, &config()),
            Err(Error::DiskCorrupt(_))
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            VirtualDisk::create_in_memory(64 * 512, &DiskConfig::with_block_size(300)),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_too_small_capacity() {
        assert!(matches!(
            VirtualDisk::create_in_memory(4 * 512, &config()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_fresh_layout() {
        let disk = VirtualDisk::create_in_memory(64 * 512, &config()).unwrap();
        let manager = disk.manager();
        assert_eq!(manager.root_offset(), BlockOffset::new(1));
        assert_eq!(manager.journal_head(), BlockOffset::new(3));
        assert_eq!(manager.space_break(), 4);
        assert_eq!(manager.block_count(), 64);
        assert_eq!(manager.free_block_count().unwrap(), 0);
        assert!(disk.root().unwrap().entries().unwrap().is_empty());
        assert_eq!(disk.last_synchronized().unwrap(), None);
    }

    #[test]
    fn test_resize_in_memory() {
        let disk = VirtualDisk::create_in_memory(16 * 512, &config()).unwrap();
        let root = disk.root().unwrap();
        let file = root.create_file("f").unwrap();
        assert!(matches!(
            file.write_all(&[1u8; 512 * 20]),
            Err(Error::OutOfDiskSpace)
        ));

        disk.resize(64 * 512).unwrap();
        assert_eq!(disk.manager().block_count(), 64);
        file.write_all(&[1u8; 512 * 20]).unwrap();

        let result = disk.resize(8 * 512);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(file.read_all().unwrap(), vec![1u8; 512 * 20]);
    }

    #[test]
    fn test_resize_mapped_unsupported() {
        let dir = tempdir().unwrap();
        let disk =
            VirtualDisk::create(dir.path().join("fixed.vdisk"), 32 * 512, &config()).unwrap();
        assert!(matches!(
            disk.resize(64 * 512),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_navigate_shares_identity() {
        let disk = VirtualDisk::create_in_memory(64 * 512, &config()).unwrap();
        disk.root().unwrap().create_directory("a").unwrap();

        let first = disk.navigate("/a").unwrap();
        let second = disk.navigate("a").unwrap();
        assert!(Arc::ptr_eq(first.handle(), second.handle()));
        assert!(Arc::ptr_eq(first.handle().lock(), second.handle().lock()));
    }

    #[test]
    fn test_associate_and_clear() {
        let disk = VirtualDisk::create_in_memory(64 * 512, &config()).unwrap();
        disk.associate(Some("backup")).unwrap();
        assert_eq!(disk.association().unwrap().as_deref(), Some("backup"));
        disk.associate(None).unwrap();
        assert_eq!(disk.association().unwrap(), None);

        let long = "x".repeat(64);
        assert!(matches!(
            disk.associate(Some(&long)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_use_after_close() {
        let disk = VirtualDisk::create_in_memory(64 * 512, &config()).unwrap();
        let manager = disk.manager().clone();
        let root = disk.root().unwrap();
        disk.close().unwrap();

        assert!(matches!(manager.read_block(BlockOffset::new(1)), Err(Error::Disposed)));
        assert!(matches!(root.entries(), Err(Error::Disposed)));
        assert!(matches!(root.block().next(), Err(Error::Disposed)));
    }
}

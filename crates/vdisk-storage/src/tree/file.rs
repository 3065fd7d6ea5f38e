use super::{Location, TreeNode, VirtualDirectory, chain, non_negative};
use crate::block::FileBlock;
use crate::identity::BlockHandle;
use crate::layout;
use crate::lock;
use crate::manager::BlockManager;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use tracing::debug;
use vdisk_common::{BlockOffset, Error, Result};

/// A file of the virtual tree
#[derive(Clone)]
pub struct VirtualFile {
    manager: BlockManager,
    block: FileBlock,
    location: Location,
}

impl VirtualFile {
    pub(crate) const fn new(manager: BlockManager, block: FileBlock, location: Location) -> Self {
        Self {
            manager,
            block,
            location,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.location.name()
    }

    /// Absolute path this file was resolved at
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

    /// Logical size in bytes
    pub fn size(&self) -> Result<u64> {
        let _locks = lock::enter(&[Arc::clone(self.block.handle())], &[])?;
        non_negative(self.block.size()?, "file size")
    }

    /// Offsets of the data blocks, in file order
    fn data_offsets(&self) -> Result<(u64, Vec<BlockOffset>)> {
        let size = non_negative(self.block.size()?, "file size")?;
        let data = chain::file_chain(&self.manager, &self.block)?.data;
        let block_size = u64::from(self.manager.block_size());
        if size.div_ceil(block_size) > data.len() as u64 {
            return Err(Error::corrupt(format!(
                "file at block {} is {} bytes long but owns {} data blocks",
                self.offset(),
                size,
                data.len()
            )));
        }
        Ok((size, data))
    }

    /// Read the whole content
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let _locks = lock::enter(&[Arc::clone(self.block.handle())], &[])?;
        let (size, data) = self.data_offsets()?;
        let size = usize::try_from(size)
            .map_err(|_| Error::unsupported(format!("{size} bytes do not fit into memory")))?;

        let block_size = self.manager.block_size() as usize;
        let mut content = vec![0u8; size];
        for (index, &offset) in data.iter().enumerate() {
            let start = index * block_size;
            if start >= size {
                break;
            }
            let count = block_size.min(size - start);
            self.manager.read_data(offset, &mut content, start, 0, count)?;
        }
        Ok(content)
    }

    /// Open a seekable reader positioned at the start
    #[must_use]
    pub fn open(&self) -> FileReader {
        FileReader {
            file: self.clone(),
            position: 0,
            cache: None,
        }
    }

    /// Replace the content.
    ///
    /// New blocks are allocated before anything is written, so running out
    /// of space leaves the old content in place. The file and every
    /// ancestor directory are write-locked for the whole replacement.
    pub fn write_all(&self, content: &[u8]) -> Result<()> {
        let size = i64::try_from(content.len())
            .map_err(|_| Error::invalid_argument("content larger than i64::MAX bytes"))?;
        let mut writes: Vec<_> = self.location.ancestor_handles().collect();
        writes.push(Arc::clone(self.block.handle()));
        let _locks = lock::enter(&[], &writes)?;

        let old = chain::file_chain(&self.manager, &self.block)?;
        let old_size = self.block.size()?;

        let block_size = self.manager.block_size();
        let data_count = content.len().div_ceil(block_size as usize);
        let per_continuation =
            layout::offset_capacity(block_size, layout::FILE_CONTINUATION_HEADER);
        let continuation_count = data_count
            .saturating_sub(self.block.capacity())
            .div_ceil(per_continuation);

        let fresh = self.manager.allocate_blocks(data_count + continuation_count)?;
        // Every fresh block, the primary block and each ancestor's total size
        let records = fresh.len() + 1 + self.location.ancestors().len();
        let _journal = match self.manager.reserve_journal(records) {
            Ok(journal) => journal,
            Err(err) => {
                self.manager.free_all(&fresh)?;
                return Err(err);
            }
        };

        let (data, continuations) = fresh.split_at(data_count);
        if let Err(err) = self.fill(content, size, data, continuations) {
            self.manager.free_all(&fresh)?;
            return Err(err);
        }

        let mut stale = old.data;
        stale.extend(old.continuations);
        self.manager.free_all(&stale)?;
        chain::adjust_total_sizes(self.location.ancestors(), size - old_size)?;

        debug!(
            "Wrote {} bytes to {} ({} data blocks, {} continuations)",
            content.len(),
            self.path(),
            data.len(),
            continuations.len()
        );
        Ok(())
    }

    /// Write data and continuation blocks, then switch the primary block over
    fn fill(
        &self,
        content: &[u8],
        size: i64,
        data: &[BlockOffset],
        continuations: &[BlockOffset],
    ) -> Result<()> {
        for (chunk, &offset) in content
            .chunks(self.manager.block_size() as usize)
            .zip(data)
        {
            self.manager.write_data(offset, chunk)?;
        }

        let (head, rest) = data.split_at(data.len().min(self.block.capacity()));
        let per_continuation =
            layout::offset_capacity(self.manager.block_size(), layout::FILE_CONTINUATION_HEADER);
        let chunks = rest.chunks(per_continuation).zip(continuations);
        for (index, (offsets, &offset)) in chunks.enumerate() {
            let next = continuations.get(index + 1).copied();
            self.manager
                .get_file_continuation_block(offset)?
                .rewrite(offsets, next)?;
        }
        self.block.rewrite(size, head, continuations.first().copied())
    }

    pub fn rename(&mut self, new_name: &str) -> Result<()> {
        super::rename_node(self, new_name)
    }

    /// Move this file into `dest`, keeping its name
    pub fn move_to(&mut self, dest: &VirtualDirectory) -> Result<()> {
        super::move_node(self, dest)
    }

    /// Delete the file and free all its blocks
    pub fn delete(self) -> Result<()> {
        super::delete_node(&self)
    }
}

impl TreeNode for VirtualFile {
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
        self.block.size()
    }

    fn subtree(&self) -> Result<chain::Subtree> {
        chain::file_subtree(&self.manager, &self.block)
    }
}

struct ChainCache {
    version: u64,
    size: u64,
    data: Vec<BlockOffset>,
}

/// Sequential, seekable reader over a file.
///
/// Every call read-locks the file block. The offset list is cached and
/// reloaded whenever the file block changed since the previous call.
pub struct FileReader {
    file: VirtualFile,
    position: u64,
    cache: Option<ChainCache>,
}

impl FileReader {
    /// Current read position
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    fn refresh(&mut self) -> Result<&ChainCache> {
        let version = self.file.handle().version();
        let cache = match self.cache.take() {
            Some(cache) if cache.version == version => cache,
            _ => {
                let (size, data) = self.file.data_offsets()?;
                ChainCache {
                    version,
                    size,
                    data,
                }
            }
        };
        Ok(self.cache.insert(cache))
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let _locks = lock::enter(&[Arc::clone(self.file.handle())], &[])?;
        let position = self.position;
        let manager = self.file.manager.clone();
        let cache = self.refresh()?;
        if buf.is_empty() || position >= cache.size {
            return Ok(0);
        }

        let block_size = u64::from(manager.block_size());
        let index = usize::try_from(position / block_size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "position out of range"))?;
        let offset = *cache
            .data
            .get(index)
            .ok_or_else(|| Error::corrupt(format!("data block {index} missing")))?;
        let within = position % block_size;
        let count = (buf.len() as u64)
            .min(block_size - within)
            .min(cache.size - position);

        // Bounded by the block size, so both fit into usize
        #[allow(clippy::cast_possible_truncation)]
        let (within, count) = (within as usize, count as usize);
        manager.read_data(offset, buf, 0, within, count)?;
        self.position += count as u64;
        Ok(count)
    }
}

impl Seek for FileReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(target) => Some(target),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.file.size()?.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before the start of the file")
        })?;
        self.position = target;
        Ok(target)
    }
}

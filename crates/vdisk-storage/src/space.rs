//! Persistence spaces
//!
//! A persistence space is the raw, capacity-addressable byte region a
//! virtual disk lives in. Two backings exist:
//! - [`HeapSpace`]: a growable in-memory buffer
//! - [`MappedSpace`]: a memory-mapped file of fixed capacity
//!
//! Access goes through bounds-checked `read_at` / `write_at` calls instead
//! of a raw base pointer, so a block view is just `(space, byte range)`.

use memmap2::MmapMut;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use vdisk_common::{Error, Result};

/// Raw byte region backing a virtual disk
pub trait PersistenceSpace: Send + Sync {
    /// Current capacity in bytes
    fn capacity(&self) -> Result<u64>;

    /// Copy `buf.len()` bytes starting at `pos` into `buf`
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()>;

    /// Copy `data` into the space starting at `pos`
    fn write_at(&self, pos: u64, data: &[u8]) -> Result<()>;

    /// Fill `len` bytes starting at `pos` with zeros
    fn zero_at(&self, pos: u64, len: usize) -> Result<()> {
        self.write_at(pos, &vec![0u8; len])
    }

    /// Change the capacity. Fixed-size backings answer `Unsupported`.
    fn resize(&self, new_size: u64) -> Result<()>;

    /// Force durable write-back
    fn flush(&self) -> Result<()>;

    /// Release the backing. Every later call fails with `Disposed`.
    fn close(&self) -> Result<()>;
}

/// A shared space, so a disk can be reopened over the same backing
impl<S: PersistenceSpace + ?Sized> PersistenceSpace for Arc<S> {
    fn capacity(&self) -> Result<u64> {
        (**self).capacity()
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(pos, buf)
    }

    fn write_at(&self, pos: u64, data: &[u8]) -> Result<()> {
        (**self).write_at(pos, data)
    }

    fn zero_at(&self, pos: u64, len: usize) -> Result<()> {
        (**self).zero_at(pos, len)
    }

    fn resize(&self, new_size: u64) -> Result<()> {
        (**self).resize(new_size)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

/// Translate `(pos, len)` into a checked index range
fn checked_range(capacity: usize, pos: u64, len: usize) -> Result<Range<usize>> {
    let out_of_bounds = || Error::OutOfBounds {
        pos,
        len: len as u64,
        capacity: capacity as u64,
    };
    let start = usize::try_from(pos).map_err(|_| out_of_bounds())?;
    let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
    if end > capacity {
        return Err(out_of_bounds());
    }
    Ok(start..end)
}

/// Growable in-memory persistence space
pub struct HeapSpace {
    bytes: RwLock<Option<Vec<u8>>>,
}

impl HeapSpace {
    /// Largest capacity a heap space may grow to
    pub const MAX_CAPACITY: u64 = isize::MAX as u64;

    /// Allocate a zero-filled space of `capacity` bytes
    pub fn new(capacity: u64) -> Result<Self> {
        let len = Self::checked_capacity(capacity)?;
        debug!("Allocated heap space of {} bytes", len);
        Ok(Self {
            bytes: RwLock::new(Some(vec![0u8; len])),
        })
    }

    fn checked_capacity(capacity: u64) -> Result<usize> {
        if capacity > Self::MAX_CAPACITY {
            return Err(Error::unsupported(format!(
                "heap space of {capacity} bytes exceeds the addressable range"
            )));
        }
        usize::try_from(capacity).map_err(|_| {
            Error::unsupported(format!(
                "heap space of {capacity} bytes exceeds the addressable range"
            ))
        })
    }
}

impl PersistenceSpace for HeapSpace {
    fn capacity(&self) -> Result<u64> {
        let bytes = self.bytes.read();
        let bytes = bytes.as_ref().ok_or(Error::Disposed)?;
        Ok(bytes.len() as u64)
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let bytes = bytes.as_ref().ok_or(Error::Disposed)?;
        let range = checked_range(bytes.len(), pos, buf.len())?;
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write_at(&self, pos: u64, data: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let bytes = bytes.as_mut().ok_or(Error::Disposed)?;
        let range = checked_range(bytes.len(), pos, data.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn zero_at(&self, pos: u64, len: usize) -> Result<()> {
        let mut bytes = self.bytes.write();
        let bytes = bytes.as_mut().ok_or(Error::Disposed)?;
        let range = checked_range(bytes.len(), pos, len)?;
        bytes[range].fill(0);
        Ok(())
    }

    fn resize(&self, new_size: u64) -> Result<()> {
        let len = Self::checked_capacity(new_size)?;
        let mut bytes = self.bytes.write();
        let bytes = bytes.as_mut().ok_or(Error::Disposed)?;
        debug!("Resizing heap space from {} to {} bytes", bytes.len(), len);
        bytes.resize(len, 0);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if self.bytes.read().is_none() {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.bytes.write().take().ok_or(Error::Disposed)?;
        Ok(())
    }
}

struct Mapping {
    map: MmapMut,
    // Keeps the descriptor open for the lifetime of the mapping
    _file: File,
}

/// Memory-mapped file persistence space with fixed capacity
pub struct MappedSpace {
    path: PathBuf,
    mapping: RwLock<Option<Mapping>>,
}

impl MappedSpace {
    /// Create (or truncate) a file of `capacity` bytes and map it
    pub fn create(path: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if capacity == 0 {
            return Err(Error::invalid_argument("mapped space capacity must be non-zero"));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(capacity)?;

        info!("Created mapped space {} ({} bytes)", path.display(), capacity);
        Self::map(path, file)
    }

    /// Map an existing file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if file.metadata()?.len() == 0 {
            return Err(Error::corrupt(format!("{} is empty", path.display())));
        }

        info!("Opened mapped space {}", path.display());
        Self::map(path, file)
    }

    #[allow(unsafe_code)]
    fn map(path: PathBuf, file: File) -> Result<Self> {
        // SAFETY: the file is opened read-write by this process and the
        // mapping is only accessed through the bounds-checked methods below.
        // Concurrent modification by other processes is not supported.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            path,
            mapping: RwLock::new(Some(Mapping { map, _file: file })),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistenceSpace for MappedSpace {
    fn capacity(&self) -> Result<u64> {
        let mapping = self.mapping.read();
        let mapping = mapping.as_ref().ok_or(Error::Disposed)?;
        Ok(mapping.map.len() as u64)
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let mapping = self.mapping.read();
        let mapping = mapping.as_ref().ok_or(Error::Disposed)?;
        let range = checked_range(mapping.map.len(), pos, buf.len())?;
        buf.copy_from_slice(&mapping.map[range]);
        Ok(())
    }

    fn write_at(&self, pos: u64, data: &[u8]) -> Result<()> {
        let mut mapping = self.mapping.write();
        let mapping = mapping.as_mut().ok_or(Error::Disposed)?;
        let range = checked_range(mapping.map.len(), pos, data.len())?;
        mapping.map[range].copy_from_slice(data);
        Ok(())
    }

    fn zero_at(&self, pos: u64, len: usize) -> Result<()> {
        let mut mapping = self.mapping.write();
        let mapping = mapping.as_mut().ok_or(Error::Disposed)?;
        let range = checked_range(mapping.map.len(), pos, len)?;
        mapping.map[range].fill(0);
        Ok(())
    }

    fn resize(&self, _new_size: u64) -> Result<()> {
        if self.mapping.read().is_none() {
            return Err(Error::Disposed);
        }
        Err(Error::unsupported(
            "memory-mapped spaces have a fixed capacity",
        ))
    }

    fn flush(&self) -> Result<()> {
        let mapping = self.mapping.read();
        let mapping = mapping.as_ref().ok_or(Error::Disposed)?;
        mapping.map.flush()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mapping = self.mapping.write().take().ok_or(Error::Disposed)?;
        mapping.map.flush()?;
        info!("Closed mapped space {}", self.path.display());
        Ok(())
    }
}

//! On-disk layout definitions
//!
//! Disk Layout:
//! ```text
//! +------------------+  Block 0
//! |   Meta block     |  counts, block size, root / free list / journal heads
//! +------------------+  Block 1
//! |  Root directory  |
//! +------------------+  Block 2
//! | Free-list head   |
//! +------------------+  Block 3
//! |  Journal head    |
//! +------------------+  Block 4 .. space break
//! |  Content blocks  |  directories, files, offset lists, data
//! +------------------+
//! ```
//!
//! All integers are little endian. Every block kind except the meta block
//! and raw data blocks keeps its continuation link in the last 4 bytes.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tracing::warn;
use vdisk_common::{BlockOffset, Error, Result};

/// Magic marker stored after the meta fields
pub const MAGIC: [u8; 4] = *b"VDSK";

/// Size of a continuation link field
pub const LINK_SIZE: usize = 4;

/// Size of a packed block offset
pub const OFFSET_SIZE: usize = 4;

/// Maximum length of an entry name in bytes
pub const MAX_NAME_LEN: usize = 255;

/// Size of the association name field (length byte + name bytes)
pub const ASSOCIATION_FIELD_SIZE: usize = 64;

/// Maximum length of an association name in bytes
pub const MAX_ASSOCIATION_LEN: usize = ASSOCIATION_FIELD_SIZE - 1;

/// Offsets of the meta block fields
pub mod meta {
    pub const BLOCK_COUNT: usize = 0;
    pub const BLOCK_SIZE: usize = 4;
    pub const ROOT_DIRECTORY: usize = 8;
    pub const FREE_LIST_HEAD: usize = 12;
    pub const JOURNAL_HEAD: usize = 16;
    pub const ASSOCIATION: usize = 20;
    pub const LAST_SYNCHRONIZED: usize = 84;
    pub const SPACE_BREAK: usize = 92;
    pub const MAGIC: usize = 96;
    /// Total encoded size of the meta fields
    pub const SIZE: usize = 100;
}

/// Directory block: `totalSize i64`, then entries
pub const DIRECTORY_HEADER: usize = 8;

/// Directory continuation block: entries only
pub const DIRECTORY_CONTINUATION_HEADER: usize = 0;

/// File block: `size i64`, `count i32`, then offsets
pub const FILE_HEADER: usize = 12;
/// Position of the count field in a file block
pub const FILE_COUNT_POS: usize = 8;

/// File continuation block: `count i32`, then offsets
pub const FILE_CONTINUATION_HEADER: usize = 4;
/// Position of the count field in a file continuation block
pub const FILE_CONTINUATION_COUNT_POS: usize = 0;

/// Free-list block: `totalFreeBlockCount i32`, `count i32`, then offsets
pub const FREE_LIST_HEADER: usize = 8;
/// Position of the count field in a free-list block
pub const FREE_LIST_COUNT_POS: usize = 4;

/// Directory entry header: `[nameLen:1][flags:1][targetOffset:4]`
pub const ENTRY_HEADER_SIZE: usize = 6;

/// Journal record: `[binaryDate:i64][blockOffset:u32]`
pub const JOURNAL_RECORD_SIZE: usize = 12;

/// Well-known offsets of a freshly formatted disk
pub const ROOT_DIRECTORY_OFFSET: BlockOffset = BlockOffset::new(1);
pub const FREE_LIST_HEAD_OFFSET: BlockOffset = BlockOffset::new(2);
pub const JOURNAL_HEAD_OFFSET: BlockOffset = BlockOffset::new(3);
/// First offset handed out by the space break on a fresh disk
pub const FIRST_CONTENT_OFFSET: u32 = 4;

/// Position of the continuation link inside a block
#[inline]
#[must_use]
pub const fn link_pos(block_size: u32) -> usize {
    block_size as usize - LINK_SIZE
}

/// Number of offsets an offset-list block with the given header can hold
#[inline]
#[must_use]
pub const fn offset_capacity(block_size: u32, header: usize) -> usize {
    (link_pos(block_size) - header) / OFFSET_SIZE
}

/// Number of journal records a journal block can hold
#[inline]
#[must_use]
pub const fn journal_capacity(block_size: u32) -> usize {
    link_pos(block_size) / JOURNAL_RECORD_SIZE
}

/// Encode a timestamp as stored on disk (microseconds since the epoch)
#[must_use]
pub fn encode_date(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

/// Decode an on-disk timestamp; 0 means "no date"
#[must_use]
pub fn decode_date(raw: i64) -> Option<DateTime<Utc>> {
    if raw == 0 {
        None
    } else {
        DateTime::from_timestamp_micros(raw)
    }
}

#[inline]
pub(crate) fn read_u32(bytes: &[u8], pos: usize) -> u32 {
    let mut field = [0u8; 4];
    field.copy_from_slice(&bytes[pos..pos + 4]);
    u32::from_le_bytes(field)
}

#[inline]
pub(crate) fn read_i32(bytes: &[u8], pos: usize) -> i32 {
    let mut field = [0u8; 4];
    field.copy_from_slice(&bytes[pos..pos + 4]);
    i32::from_le_bytes(field)
}

#[inline]
pub(crate) fn read_i64(bytes: &[u8], pos: usize) -> i64 {
    let mut field = [0u8; 8];
    field.copy_from_slice(&bytes[pos..pos + 8]);
    i64::from_le_bytes(field)
}

/// Meta block stored at offset 0
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaBlock {
    /// Total number of blocks, including the meta block
    pub block_count: u32,
    /// Block size in bytes
    pub block_size: u32,
    /// Offset of the root directory block
    pub root_directory: BlockOffset,
    /// Offset of the head free-list block
    pub free_list_head: BlockOffset,
    /// Offset of the first journal block
    pub journal_head: BlockOffset,
    /// Name of the server this disk is associated with
    pub association: Option<String>,
    /// Time of the last completed synchronization
    pub last_synchronized: Option<DateTime<Utc>>,
    /// High-water mark: every offset below it has been handed out at least once
    pub space_break: u32,
}

impl MetaBlock {
    /// Meta block of a freshly formatted disk
    #[must_use]
    pub const fn new(block_count: u32, block_size: u32) -> Self {
        Self {
            block_count,
            block_size,
            root_directory: ROOT_DIRECTORY_OFFSET,
            free_list_head: FREE_LIST_HEAD_OFFSET,
            journal_head: JOURNAL_HEAD_OFFSET,
            association: None,
            last_synchronized: None,
            space_break: FIRST_CONTENT_OFFSET,
        }
    }

    /// Serialize the meta fields
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(meta::SIZE);

        buf.put_u32_le(self.block_count);
        buf.put_u32_le(self.block_size);
        buf.put_u32_le(self.root_directory.get());
        buf.put_u32_le(self.free_list_head.get());
        buf.put_u32_le(self.journal_head.get());
        buf.put_slice(&encode_association(self.association.as_deref())?);
        buf.put_i64_le(self.last_synchronized.map_or(0, encode_date));
        buf.put_u32_le(self.space_break);
        buf.put_slice(&MAGIC);

        Ok(buf.freeze())
    }

    /// Parse the meta fields
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < meta::SIZE {
            return Err(Error::corrupt("meta block too small"));
        }

        let mut buf = data;
        let block_count = buf.get_u32_le();
        let block_size = buf.get_u32_le();
        let root_directory = BlockOffset::new(buf.get_u32_le());
        let free_list_head = BlockOffset::new(buf.get_u32_le());
        let journal_head = BlockOffset::new(buf.get_u32_le());

        let mut association = [0u8; ASSOCIATION_FIELD_SIZE];
        buf.copy_to_slice(&mut association);
        let association = decode_association(&association)?;

        let last_synchronized = decode_date(buf.get_i64_le());
        let space_break = buf.get_u32_le();

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(Error::corrupt("invalid meta block magic"));
        }

        Ok(Self {
            block_count,
            block_size,
            root_directory,
            free_list_head,
            journal_head,
            association,
            last_synchronized,
            space_break,
        })
    }

    /// Validate meta block consistency against the backing capacity
    pub fn validate(&self, capacity: u64) -> Result<()> {
        if !self.block_size.is_power_of_two() || (self.block_size as usize) < meta::SIZE {
            return Err(Error::corrupt(format!(
                "invalid block size {}",
                self.block_size
            )));
        }
        if u64::from(self.block_count) * u64::from(self.block_size) > capacity {
            return Err(Error::corrupt(format!(
                "{} blocks of {} bytes exceed capacity {}",
                self.block_count, self.block_size, capacity
            )));
        }
        if self.space_break > self.block_count {
            return Err(Error::corrupt("space break beyond block count"));
        }
        for (what, offset) in [
            ("root directory", self.root_directory),
            ("free list head", self.free_list_head),
            ("journal head", self.journal_head),
        ] {
            if offset.is_meta() || offset.get() >= self.space_break {
                return Err(Error::corrupt(format!("{what} offset {offset} out of range")));
            }
        }
        Ok(())
    }
}

/// Encode the fixed-width association field
pub fn encode_association(name: Option<&str>) -> Result<[u8; ASSOCIATION_FIELD_SIZE]> {
    let mut field = [0u8; ASSOCIATION_FIELD_SIZE];
    if let Some(name) = name {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > MAX_ASSOCIATION_LEN {
            return Err(Error::invalid_argument(format!(
                "association name must be 1..={MAX_ASSOCIATION_LEN} bytes"
            )));
        }
        field[0] = bytes.len() as u8;
        field[1..=bytes.len()].copy_from_slice(bytes);
    }
    Ok(field)
}

fn decode_association(field: &[u8; ASSOCIATION_FIELD_SIZE]) -> Result<Option<String>> {
    let len = field[0] as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_ASSOCIATION_LEN {
        return Err(Error::corrupt("association name length out of range"));
    }
    String::from_utf8(field[1..=len].to_vec())
        .map(Some)
        .map_err(|_| Error::corrupt("association name is not valid UTF-8"))
}

bitflags! {
    /// Flags of a directory entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntryFlags: u8 {
        /// Entry names a directory block
        const DIRECTORY = 0b0000_0001;
    }
}

/// A decoded directory entry together with its position in the region
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedEntry {
    pub name: String,
    pub flags: EntryFlags,
    pub target: BlockOffset,
    /// Start of the entry relative to the region
    pub pos: usize,
    /// Encoded length of the entry
    pub len: usize,
}

/// Validate an entry name
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name == "."
        || name == ".."
        || name.contains(['/', '\0'])
    {
        return Err(Error::illegal_name(name));
    }
    Ok(())
}

/// Decode every entry of a packed entry region
pub fn decode_entries(region: &[u8]) -> Result<Vec<PackedEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0;

    while pos < region.len() {
        let name_len = region[pos] as usize;
        if name_len == 0 {
            break;
        }
        let len = ENTRY_HEADER_SIZE + name_len;
        if pos + len > region.len() {
            return Err(Error::corrupt(format!(
                "directory entry at {} with length {} exceeds block bounds",
                pos, len
            )));
        }

        let raw_flags = region[pos + 1];
        let flags = EntryFlags::from_bits_retain(raw_flags);
        if flags.bits() & !EntryFlags::all().bits() != 0 {
            warn!("Directory entry at {} carries unknown flag bits {:#04x}", pos, raw_flags);
        }
        let target = BlockOffset::new(read_u32(region, pos + 2));
        let name = std::str::from_utf8(&region[pos + ENTRY_HEADER_SIZE..pos + len])
            .map_err(|_| Error::corrupt(format!("directory entry at {pos} has a non UTF-8 name")))?
            .to_string();

        entries.push(PackedEntry {
            name,
            flags,
            target,
            pos,
            len,
        });
        pos += len;
    }

    Ok(entries)
}

/// Find the end of the packed entries in a region
pub fn entries_end(region: &[u8]) -> Result<usize> {
    Ok(decode_entries(region)?
        .last()
        .map_or(0, |entry| entry.pos + entry.len))
}

/// Append an entry to a region. Returns `false` if the region is full.
pub fn try_append_entry(
    region: &mut [u8],
    name: &str,
    flags: EntryFlags,
    target: BlockOffset,
) -> Result<bool> {
    validate_name(name)?;
    let end = entries_end(region)?;
    let len = ENTRY_HEADER_SIZE + name.len();
    if end + len > region.len() {
        return Ok(false);
    }

    region[end] = name.len() as u8;
    region[end + 1] = flags.bits();
    region[end + 2..end + ENTRY_HEADER_SIZE].copy_from_slice(&target.get().to_le_bytes());
    region[end + ENTRY_HEADER_SIZE..end + len].copy_from_slice(name.as_bytes());
    if end + len < region.len() {
        region[end + len] = 0;
    }
    Ok(true)
}

/// Remove the entry at `pos` with encoded length `len`, compacting the tail
pub fn remove_entry(region: &mut [u8], pos: usize, len: usize) {
    region.copy_within(pos + len.., pos);
    let tail = region.len() - len;
    region[tail..].fill(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(region: &mut [u8], name: &str, flags: EntryFlags, target: u32) -> bool {
        try_append_entry(region, name, flags, BlockOffset::new(target)).unwrap()
    }

    #[test]
    fn test_meta_roundtrip() {
        let mut meta = MetaBlock::new(1024, 4096);
        meta.association = Some("backup-server".into());
        meta.last_synchronized = DateTime::from_timestamp_micros(1_700_000_000_123_456);
        meta.space_break = 77;

        let bytes = meta.to_bytes().unwrap();
        assert_eq!(bytes.len(), meta::SIZE);
        assert_eq!(&bytes[meta::MAGIC..meta::MAGIC + 4], b"VDSK");

        let parsed = MetaBlock::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_meta_field_positions() {
        let meta = MetaBlock::new(10, 512);
        let bytes = meta.to_bytes().unwrap();
        assert_eq!(read_u32(&bytes, meta::BLOCK_COUNT), 10);
        assert_eq!(read_u32(&bytes, meta::BLOCK_SIZE), 512);
        assert_eq!(read_u32(&bytes, meta::ROOT_DIRECTORY), 1);
        assert_eq!(read_u32(&bytes, meta::FREE_LIST_HEAD), 2);
        assert_eq!(read_u32(&bytes, meta::JOURNAL_HEAD), 3);
        assert_eq!(read_u32(&bytes, meta::SPACE_BREAK), 4);
        assert_eq!(read_i64(&bytes, meta::LAST_SYNCHRONIZED), 0);
    }

    #[test]
    fn test_meta_bad_magic() {
        let mut bytes = MetaBlock::new(10, 512).to_bytes().unwrap().to_vec();
        bytes[meta::MAGIC] = b'X';
        assert!(matches!(MetaBlock::from_bytes(&bytes), Err(Error::DiskCorrupt(_))));
    }

    #[test]
    fn test_meta_validate() {
        let meta = MetaBlock::new(16, 512);
        assert!(meta.validate(16 * 512).is_ok());
        assert!(meta.validate(15 * 512).is_err());

        let mut broken = meta.clone();
        broken.root_directory = BlockOffset::new(9);
        assert!(broken.validate(16 * 512).is_err());
    }

    #[test]
    fn test_association_too_long() {
        let name = "x".repeat(MAX_ASSOCIATION_LEN + 1);
        assert!(encode_association(Some(&name)).is_err());
        assert!(encode_association(Some("")).is_err());
        assert_eq!(encode_association(None).unwrap(), [0u8; ASSOCIATION_FIELD_SIZE]);
    }

    #[test]
    fn test_entry_layout() {
        let mut region = vec![0u8; 64];
        assert!(append(&mut region, "ab", EntryFlags::DIRECTORY, 9));

        assert_eq!(region[0], 2);
        assert_eq!(region[1], EntryFlags::DIRECTORY.bits());
        assert_eq!(read_u32(&region, 2), 9);
        assert_eq!(&region[6..8], b"ab");
        assert_eq!(region[8], 0);
    }

    #[test]
    fn test_entries_append_until_full() {
        // Each entry takes 6 + 1 bytes
        let mut region = vec![0u8; 20];
        assert!(append(&mut region, "a", EntryFlags::empty(), 1));
        assert!(append(&mut region, "b", EntryFlags::empty(), 2));
        assert!(!append(&mut region, "c", EntryFlags::empty(), 3));

        let entries = decode_entries(&region).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_exact_fit_without_sentinel() {
        let mut region = vec![0u8; 14];
        assert!(append(&mut region, "a", EntryFlags::empty(), 1));
        assert!(append(&mut region, "b", EntryFlags::empty(), 2));
        assert_eq!(decode_entries(&region).unwrap().len(), 2);
    }

    #[test]
    fn test_remove_entry_compacts() {
        let mut region = vec![0u8; 64];
        for (name, target) in [("one", 1), ("two", 2), ("three", 3)] {
            append(&mut region, name, EntryFlags::empty(), target);
        }

        let entries = decode_entries(&region).unwrap();
        remove_entry(&mut region, entries[1].pos, entries[1].len);

        let entries = decode_entries(&region).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["one", "three"]);
        assert_eq!(entries[1].target, BlockOffset::new(3));
    }

    #[test]
    fn test_corrupt_entry_length() {
        let mut region = vec![0u8; 16];
        region[0] = 200;
        assert!(matches!(decode_entries(&region), Err(Error::DiskCorrupt(_))));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("file.txt").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name(&"n".repeat(256)).is_err());
        assert!(validate_name(&"n".repeat(255)).is_ok());
    }

    #[test]
    fn test_capacities() {
        assert_eq!(link_pos(512), 508);
        assert_eq!(offset_capacity(512, FILE_HEADER), 124);
        assert_eq!(offset_capacity(512, FILE_CONTINUATION_HEADER), 126);
        assert_eq!(offset_capacity(512, FREE_LIST_HEADER), 125);
        assert_eq!(journal_capacity(512), 42);
    }
}

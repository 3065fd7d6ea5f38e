//! Journal blocks
//!
//! Packed 12-byte `(date, offset)` records. A record with a zero date is an
//! empty slot; appends fill the first empty slot.

use super::{BlockRef, impl_continuation};
use crate::layout;
use crate::manager::BlockManager;
use chrono::{DateTime, Utc};
use vdisk_common::{BlockOffset, Error, Result};

/// One journal record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    pub at: DateTime<Utc>,
    pub offset: BlockOffset,
}

/// One block of the journal chain
#[derive(Clone)]
pub struct JournalBlock {
    block: BlockRef,
}

impl JournalBlock {
    pub(crate) fn new(manager: BlockManager, offset: BlockOffset) -> Self {
        Self {
            block: BlockRef::untracked(manager, offset),
        }
    }

    /// Number of records this block can hold
    #[must_use]
    pub fn capacity(&self) -> usize {
        layout::journal_capacity(self.block.block_size())
    }

    fn first_free_slot(&self, bytes: &[u8]) -> Option<usize> {
        (0..self.capacity())
            .find(|slot| layout::read_i64(bytes, slot * layout::JOURNAL_RECORD_SIZE) == 0)
    }

    /// Records stored in this block, in slot order
    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        let bytes = self.block.load()?;
        let mut entries = Vec::new();
        for slot in 0..self.capacity() {
            let pos = slot * layout::JOURNAL_RECORD_SIZE;
            let raw = layout::read_i64(&bytes, pos);
            if raw == 0 {
                continue;
            }
            let at = layout::decode_date(raw).ok_or_else(|| {
                Error::corrupt(format!(
                    "journal block {} slot {} has invalid date {}",
                    self.block.offset(),
                    slot,
                    raw
                ))
            })?;
            entries.push(JournalEntry {
                at,
                offset: BlockOffset::new(layout::read_u32(&bytes, pos + 8)),
            });
        }
        Ok(entries)
    }

    /// Check if every slot is taken
    pub fn is_full(&self) -> Result<bool> {
        let bytes = self.block.load()?;
        Ok(self.first_free_slot(&bytes).is_none())
    }

    /// Empty slots left in this block
    pub fn free_slots(&self) -> Result<usize> {
        let bytes = self.block.load()?;
        Ok(self
            .first_free_slot(&bytes)
            .map_or(0, |slot| self.capacity() - slot))
    }

    /// Store a record in the first empty slot. Returns `false` if the block is full.
    pub fn try_append(&self, entry: JournalEntry) -> Result<bool> {
        let raw = layout::encode_date(entry.at);
        if raw == 0 {
            return Err(Error::invalid_argument(
                "journal dates must differ from the epoch",
            ));
        }

        let bytes = self.block.load()?;
        let Some(slot) = self.first_free_slot(&bytes) else {
            return Ok(false);
        };

        let mut record = [0u8; layout::JOURNAL_RECORD_SIZE];
        record[..8].copy_from_slice(&raw.to_le_bytes());
        record[8..].copy_from_slice(&entry.offset.get().to_le_bytes());
        self.block
            .write_field(slot * layout::JOURNAL_RECORD_SIZE, &record)?;
        Ok(true)
    }

    /// Empty every slot and drop the successor link
    pub fn reset(&self) -> Result<()> {
        self.block.clear()
    }
}

impl_continuation!(JournalBlock);

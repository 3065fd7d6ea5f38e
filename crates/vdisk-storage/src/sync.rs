//! Journal-based synchronization
//!
//! A replica ships the blocks its journal names as changed since the last
//! synchronization; the receiver writes them verbatim without journaling
//! them again, so changes never bounce back. Conflicting writes are
//! resolved by whoever writes last.

use crate::block::JournalEntry;
use crate::disk::VirtualDisk;
use crate::lock;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};
use vdisk_common::{BlockOffset, Error, Result};

/// The synchronization surface of a disk
pub trait Synchronizer {
    /// Offsets changed after `since`, once each at their latest date
    fn changes_since(&self, since: DateTime<Utc>) -> Result<Vec<JournalEntry>>;

    /// Overwrite a block with bytes shipped from another replica.
    ///
    /// Applying the same change twice leaves the same bytes behind, and
    /// nothing is appended to the journal. The offset is claimed from the
    /// local allocator first; journal and free-list blocks are refused.
    fn receive_change(&self, offset: BlockOffset, bytes: &[u8]) -> Result<()>;

    /// Raw content of a block, for shipping
    fn direct_read(&self, offset: BlockOffset) -> Result<Vec<u8>>;

    /// Record that every change up to now has been shipped
    fn notify_synchronized(&self) -> Result<()>;
}

impl Synchronizer for VirtualDisk {
    fn changes_since(&self, since: DateTime<Utc>) -> Result<Vec<JournalEntry>> {
        self.manager().changes_since(since)
    }

    fn receive_change(&self, offset: BlockOffset, bytes: &[u8]) -> Result<()> {
        let manager = self.manager();
        if offset.is_meta() {
            return Err(Error::invalid_argument("the meta block is not synchronized"));
        }
        if bytes.len() > manager.block_size() as usize {
            return Err(Error::invalid_argument(format!(
                "change of {} bytes exceeds the {} byte block size",
                bytes.len(),
                manager.block_size()
            )));
        }

        manager.claim_received(offset)?;
        let handle = manager.identity().handle(offset);
        let _locks = lock::enter(&[], &[Arc::clone(&handle)])?;
        manager.write_raw(offset, bytes)?;
        handle.bump_version();
        debug!("Applied change to block {} ({} bytes)", offset, bytes.len());
        Ok(())
    }

    fn direct_read(&self, offset: BlockOffset) -> Result<Vec<u8>> {
        let manager = self.manager();
        let handle = manager.identity().handle(offset);
        let _locks = lock::enter(&[handle], &[])?;
        manager.read_block(offset)
    }

    fn notify_synchronized(&self) -> Result<()> {
        let now = Utc::now();
        self.manager().set_last_synchronized(now)?;
        info!("Synchronized at {}", now);
        Ok(())
    }
}

/// Ship every change of `source` made after `since` into `target`.
///
/// Returns the number of blocks shipped. Both sides are marked
/// synchronized afterwards.
pub fn replicate(
    source: &impl Synchronizer,
    target: &impl Synchronizer,
    since: DateTime<Utc>,
) -> Result<usize> {
    let changes = source.changes_since(since)?;
    for change in &changes {
        let bytes = source.direct_read(change.offset)?;
        target.receive_change(change.offset, &bytes)?;
    }
    source.notify_synchronized()?;
    target.notify_synchronized()?;
    info!("Replicated {} changed blocks", changes.len());
    Ok(changes.len())
}

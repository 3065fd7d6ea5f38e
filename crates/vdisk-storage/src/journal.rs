//! Change journal
//!
//! An append-only chain of journal blocks starting at the journal head.
//! Records are appended to the tail block; when it is full the append moves
//! on to the next linked block, growing the chain if there is none. New
//! blocks are allocated and zeroed before they are linked, so a reader never
//! follows a link into an unwritten block.
//!
//! A tree operation reserves the slots it may need before it changes
//! anything. Growth then happens at reservation time, where running out of
//! space still leaves the tree untouched.

use crate::block::{ContinuationBlock, JournalBlock, JournalEntry};
use crate::layout;
use crate::manager::BlockManager;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::debug;
use vdisk_common::{BlockOffset, Error, Result};

struct JournalTail {
    head: BlockOffset,
    /// Block the next record goes to
    tail: BlockOffset,
    /// Last block of the chain
    end: BlockOffset,
    /// Empty slots from the tail to the end of the chain
    spare: usize,
    /// Slots promised to running operations
    reserved: usize,
}

pub(crate) struct Journal {
    state: Mutex<JournalTail>,
}

/// Journal slots held for one operation, released on drop
pub(crate) struct JournalReservation<'a> {
    journal: &'a Journal,
    slots: usize,
}

impl Drop for JournalReservation<'_> {
    fn drop(&mut self) {
        let mut state = self.journal.state.lock();
        state.reserved = state.reserved.saturating_sub(self.slots);
    }
}

impl Journal {
    pub(crate) const fn new(head: BlockOffset) -> Self {
        Self {
            state: Mutex::new(JournalTail {
                head,
                tail: head,
                end: head,
                spare: 0,
                reserved: 0,
            }),
        }
    }

    /// Visit every block of the chain in order
    fn walk(
        manager: &BlockManager,
        head: BlockOffset,
        mut visit: impl FnMut(&JournalBlock) -> Result<()>,
    ) -> Result<BlockOffset> {
        let mut offset = head;
        let mut visited = 0u32;
        loop {
            visited += 1;
            if visited > manager.block_count() {
                return Err(Error::corrupt(format!(
                    "journal chain starting at {head} loops"
                )));
            }
            let block = manager.get_journal_block(offset)?;
            visit(&block)?;
            match block.next()? {
                Some(next) => offset = next,
                None => return Ok(offset),
            }
        }
    }

    /// Locate the tail block of an existing chain and count its spare slots
    pub(crate) fn recover(&self, manager: &BlockManager) -> Result<()> {
        let mut state = self.state.lock();
        let mut tail = None;
        let mut spare = 0;
        state.end = Self::walk(manager, state.head, |block| {
            let free = block.free_slots()?;
            if free > 0 && tail.is_none() {
                tail = Some(block.offset());
            }
            if tail.is_some() {
                spare += free;
            }
            Ok(())
        })?;
        state.tail = tail.unwrap_or(state.end);
        state.spare = spare;
        debug!("Journal tail at block {}, {} spare slots", state.tail, spare);
        Ok(())
    }

    /// Allocate `blocks` empty journal blocks and link them to the end of the chain
    fn grow(manager: &BlockManager, state: &mut JournalTail, blocks: usize) -> Result<()> {
        let fresh = manager.allocate_blocks(blocks)?;
        let (Some(&first), Some(&last)) = (fresh.first(), fresh.last()) else {
            return Ok(());
        };
        for pair in fresh.windows(2) {
            manager.get_journal_block(pair[0])?.set_next(Some(pair[1]))?;
        }
        manager.get_journal_block(state.end)?.set_next(Some(first))?;
        state.end = last;
        state.spare += blocks * layout::journal_capacity(manager.block_size());
        debug!("Journal grew by {} blocks, now ends at {}", blocks, last);
        Ok(())
    }

    /// Make sure `records` appends succeed without allocating
    pub(crate) fn reserve<'a>(
        &'a self,
        manager: &BlockManager,
        records: usize,
    ) -> Result<JournalReservation<'a>> {
        let mut state = self.state.lock();
        let wanted = state.reserved + records;
        if state.spare < wanted {
            let per_block = layout::journal_capacity(manager.block_size());
            let blocks = (wanted - state.spare).div_ceil(per_block);
            Self::grow(manager, &mut state, blocks)?;
        }
        state.reserved = wanted;
        Ok(JournalReservation {
            journal: self,
            slots: records,
        })
    }

    pub(crate) fn append(&self, manager: &BlockManager, entry: JournalEntry) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            let tail = manager.get_journal_block(state.tail)?;
            if tail.try_append(entry)? {
                state.spare = state.spare.saturating_sub(1);
                return Ok(());
            }
            match tail.next()? {
                Some(next) => state.tail = next,
                None => Self::grow(manager, &mut state, 1)?,
            }
        }
    }

    /// Run `check` on the offsets of every journal block while the chain
    /// cannot grow
    pub(crate) fn with_blocks<T>(
        &self,
        manager: &BlockManager,
        check: impl FnOnce(&[BlockOffset]) -> Result<T>,
    ) -> Result<T> {
        let state = self.state.lock();
        let mut blocks = Vec::new();
        Self::walk(manager, state.head, |block| {
            blocks.push(block.offset());
            Ok(())
        })?;
        check(&blocks)
    }

    /// Every record of the chain, in append order
    pub(crate) fn entries(&self, manager: &BlockManager) -> Result<Vec<JournalEntry>> {
        let state = self.state.lock();
        let mut entries = Vec::new();
        Self::walk(manager, state.head, |block| {
            entries.extend(block.entries()?);
            Ok(())
        })?;
        Ok(entries)
    }

    pub(crate) fn len(&self, manager: &BlockManager) -> Result<usize> {
        Ok(self.entries(manager)?.len())
    }

    /// Offsets changed after `since`, each with its most recent date, ordered by offset
    pub(crate) fn changes_since(
        &self,
        manager: &BlockManager,
        since: DateTime<Utc>,
    ) -> Result<Vec<JournalEntry>> {
        let mut latest: BTreeMap<BlockOffset, DateTime<Utc>> = BTreeMap::new();
        for entry in self.entries(manager)? {
            if entry.at <= since {
                continue;
            }
            latest
                .entry(entry.offset)
                .and_modify(|at| *at = (*at).max(entry.at))
                .or_insert(entry.at);
        }
        Ok(latest
            .into_iter()
            .map(|(offset, at)| JournalEntry { at, offset })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::block::ContinuationBlock;
    use crate::manager::BlockManager;
    use crate::space::HeapSpace;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::Arc;
    use vdisk_common::{BlockOffset, CacheConfig, Error};

    fn manager(blocks: u64) -> BlockManager {
        let space = HeapSpace::new(blocks * 512).unwrap();
        BlockManager::format(Box::new(space), 512, &CacheConfig::default()).unwrap()
    }

    fn at(micros: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(micros).unwrap()
    }

    #[test]
    fn test_dedup_keeps_latest() {
        let manager = manager(32);
        let offset = BlockOffset::new(9);
        manager.record_change_at(offset, at(2_000)).unwrap();
        manager.record_change_at(offset, at(3_000)).unwrap();

        let changes = manager.changes_since(at(1_000)).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].offset, offset);
        assert_eq!(changes[0].at, at(3_000));
    }

    #[test]
    fn test_changes_strictly_after() {
        let manager = manager(32);
        manager.record_change_at(BlockOffset::new(5), at(1_000)).unwrap();
        manager.record_change_at(BlockOffset::new(6), at(2_000)).unwrap();
        manager.record_change_at(BlockOffset::new(7), at(3_000)).unwrap();

        let changes = manager.changes_since(at(2_000)).unwrap();
        let offsets: Vec<_> = changes.iter().map(|change| change.offset.get()).collect();
        assert_eq!(offsets, vec![7]);
        assert!(manager.changes_since(at(3_000)).unwrap().is_empty());
    }

    #[test]
    fn test_journal_grows_into_new_block() {
        let manager = manager(64);
        let start = Utc::now();
        // 42 records fit into one 512 byte journal block
        for n in 0..100u32 {
            let at = start + Duration::seconds(i64::from(n));
            manager
                .record_change_at(BlockOffset::new(10 + n % 20), at)
                .unwrap();
        }
        assert_eq!(manager.journal_len().unwrap(), 100);

        let head = manager.get_journal_block(manager.journal_head()).unwrap();
        let second = head.next().unwrap().unwrap();
        let third = manager.get_journal_block(second).unwrap().next().unwrap();
        assert!(third.is_some());

        let changes = manager.changes_since(start - Duration::seconds(1)).unwrap();
        assert_eq!(changes.len(), 20);
        assert!(changes.iter().all(|change| change.at >= start + Duration::seconds(80)));
    }

    fn chain_len(manager: &BlockManager) -> usize {
        let mut len = 1;
        let mut block = manager.get_journal_block(manager.journal_head()).unwrap();
        while let Some(next) = block.next().unwrap() {
            block = manager.get_journal_block(next).unwrap();
            len += 1;
        }
        len
    }

    #[test]
    fn test_reservation_grows_up_front() {
        let manager = manager(64);
        let start = Utc::now();

        // 42 spare slots in the head, so 100 records need two more blocks
        let reservation = manager.reserve_journal(100).unwrap();
        assert_eq!(chain_len(&manager), 3);
        for n in 0..100 {
            manager
                .record_change_at(BlockOffset::new(9), start + Duration::seconds(n))
                .unwrap();
        }
        assert_eq!(chain_len(&manager), 3);
        drop(reservation);

        // Nothing outstanding and 26 spare slots left: no growth
        drop(manager.reserve_journal(26).unwrap());
        assert_eq!(chain_len(&manager), 3);
    }

    #[test]
    fn test_failed_reservation_changes_nothing() {
        // Blocks 4 and 5 are the only free ones
        let manager = manager(6);
        assert!(matches!(
            manager.reserve_journal(200),
            Err(Error::OutOfDiskSpace)
        ));
        assert_eq!(chain_len(&manager), 1);
        assert_eq!(manager.allocate_blocks(2).unwrap().len(), 2);

        // The failed request left no slots promised
        drop(manager.reserve_journal(42).unwrap());
        assert_eq!(chain_len(&manager), 1);
    }

    #[test]
    fn test_tail_recovered_on_load() {
        let space = Arc::new(HeapSpace::new(64 * 512).unwrap());
        let manager = BlockManager::format(
            Box::new(Arc::clone(&space)),
            512,
            &CacheConfig::default(),
        )
        .unwrap();
        for n in 0..50 {
            manager.record_change_at(BlockOffset::new(4), at(1_000 + n)).unwrap();
        }

        let reloaded = BlockManager::load(Box::new(space), &CacheConfig::default()).unwrap();
        reloaded.record_change_at(BlockOffset::new(5), at(9_000)).unwrap();
        assert_eq!(reloaded.journal_len().unwrap(), 51);

        // The new record landed in the tail block, not in the full head
        let head = reloaded.get_journal_block(reloaded.journal_head()).unwrap();
        let tail = reloaded.get_journal_block(head.next().unwrap().unwrap()).unwrap();
        assert_eq!(tail.entries().unwrap().last().unwrap().offset, BlockOffset::new(5));
    }
}

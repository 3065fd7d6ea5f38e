//! Multi-block locking policy
//!
//! Composite operations (create, rename, move, delete, file writes) lock
//! every block they touch through a single [`enter`] call. Requests are
//! merged and sorted by offset, with a write request for an offset placed
//! before (and suppressing) a read request for the same offset. Locks are
//! always taken in that order, so two operations can never wait on each
//! other in a cycle.
//!
//! If a lock cannot be taken because its block was freed, the locks
//! acquired so far are released in reverse order before the error is
//! returned.

use crate::identity::BlockHandle;
use parking_lot::RawRwLock;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use std::sync::Arc;
use tracing::trace;
use vdisk_common::{BlockOffset, Result};

/// How a block is locked
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockIntent {
    /// Exclusive access. Sorts before `Read` for the same offset.
    Write,
    /// Shared access
    Read,
}

enum HeldLock {
    Read(ArcRwLockReadGuard<RawRwLock, ()>),
    Write(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// Compute the acquisition order for a lock request
pub fn plan(
    reads: &[Arc<BlockHandle>],
    writes: &[Arc<BlockHandle>],
) -> Vec<(Arc<BlockHandle>, LockIntent)> {
    let mut requests: Vec<_> = writes
        .iter()
        .map(|handle| (Arc::clone(handle), LockIntent::Write))
        .chain(
            reads
                .iter()
                .map(|handle| (Arc::clone(handle), LockIntent::Read)),
        )
        .collect();

    requests.sort_by_key(|(handle, intent)| (handle.offset(), *intent));
    requests.dedup_by_key(|(handle, _)| handle.offset());
    requests
}

/// Acquire every requested lock in global order
pub fn enter(reads: &[Arc<BlockHandle>], writes: &[Arc<BlockHandle>]) -> Result<LockSet> {
    let mut set = LockSet {
        held: Vec::new(),
        order: Vec::new(),
    };

    for (handle, intent) in plan(reads, writes) {
        let guard = match intent {
            LockIntent::Read => HeldLock::Read(handle.lock().read_arc()),
            LockIntent::Write => HeldLock::Write(handle.lock().write_arc()),
        };
        if let Err(err) = handle.ensure_live() {
            drop(guard);
            trace!(
                "Lock on block {} refused, releasing {} held locks",
                handle.offset(),
                set.held.len()
            );
            set.release();
            return Err(err);
        }
        trace!("Locked block {} ({:?})", handle.offset(), intent);
        set.held.push(guard);
        set.order.push((handle.offset(), intent));
    }

    Ok(set)
}

/// Locks held by one composite operation.
///
/// Releases every lock in reverse acquisition order on [`LockSet::release`]
/// or on drop, whichever comes first.
pub struct LockSet {
    held: Vec<HeldLock>,
    order: Vec<(BlockOffset, LockIntent)>,
}

impl LockSet {
    /// The order in which locks were acquired
    pub fn order(&self) -> &[(BlockOffset, LockIntent)] {
        &self.order
    }

    /// Number of locks still held
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// Check if no lock is held
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Release all held locks in reverse order. Idempotent.
    pub fn release(&mut self) {
        while let Some(lock) = self.held.pop() {
            match lock {
                HeldLock::Read(guard) => drop(guard),
                HeldLock::Write(guard) => drop(guard),
            }
        }
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityCache;
    use rand::seq::SliceRandom;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use vdisk_common::{CacheConfig, Error};

    fn handles(cache: &IdentityCache, raw: &[u32]) -> Vec<Arc<BlockHandle>> {
        raw.iter()
            .map(|&offset| cache.handle(BlockOffset::new(offset)))
            .collect()
    }

    fn offsets(order: &[(Arc<BlockHandle>, LockIntent)]) -> Vec<(u32, LockIntent)> {
        order
            .iter()
            .map(|(handle, intent)| (handle.offset().get(), *intent))
            .collect()
    }

    #[test]
    fn test_plan_sorted_and_write_wins() {
        let cache = IdentityCache::new(&CacheConfig::default());
        let reads = handles(&cache, &[7, 3, 5]);
        let writes = handles(&cache, &[5, 1]);

        let order = offsets(&plan(&reads, &writes));
        assert_eq!(
            order,
            vec![
                (1, LockIntent::Write),
                (3, LockIntent::Read),
                (5, LockIntent::Write),
                (7, LockIntent::Read),
            ]
        );
    }

    #[test]
    fn test_plan_deterministic_across_orders() {
        let cache = IdentityCache::new(&CacheConfig::default());
        let mut reads = handles(&cache, &[10, 2, 8, 4, 6]);
        let mut writes = handles(&cache, &[9, 4, 1]);
        let expected = offsets(&plan(&reads, &writes));

        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            reads.shuffle(&mut rng);
            writes.shuffle(&mut rng);
            assert_eq!(offsets(&plan(&reads, &writes)), expected);
        }
    }

    #[test]
    fn test_enter_and_release() {
        let cache = IdentityCache::new(&CacheConfig::default());
        let blocks = handles(&cache, &[1, 2]);

        let mut set = enter(&blocks[..1], &blocks[1..]).unwrap();
        assert_eq!(set.len(), 2);
        assert!(blocks.iter().all(|handle| handle.is_locked()));
        assert_eq!(
            set.order(),
            &[
                (BlockOffset::new(1), LockIntent::Read),
                (BlockOffset::new(2), LockIntent::Write)
            ]
        );

        set.release();
        set.release();
        assert!(set.is_empty());
        assert!(blocks.iter().all(|handle| !handle.is_locked()));
    }

    #[test]
    fn test_duplicate_requests_locked_once() {
        let cache = IdentityCache::new(&CacheConfig::default());
        let block = cache.handle(BlockOffset::new(4));
        let both = vec![Arc::clone(&block), Arc::clone(&block)];

        let set = enter(&both, &both).unwrap();
        assert_eq!(set.order(), &[(BlockOffset::new(4), LockIntent::Write)]);
    }

    #[test]
    fn test_no_partial_lock_leak() {
        let cache = IdentityCache::new(&CacheConfig::default());
        let blocks = handles(&cache, &[1, 2, 3]);
        cache.invalidate(BlockOffset::new(3));

        let err = enter(&[], &blocks).err().unwrap();
        assert!(matches!(err, Error::BlockDeallocated { offset } if offset == BlockOffset::new(3)));
        assert!(blocks.iter().all(|handle| !handle.is_locked()));

        // The surviving blocks can be locked again right away
        let set = enter(&[], &blocks[..2]).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_readers_share_writers_exclude() {
        let cache = IdentityCache::new(&CacheConfig::default());
        let block = vec![cache.handle(BlockOffset::new(1))];

        let first = enter(&block, &[]).unwrap();
        let second = enter(&block, &[]).unwrap();
        assert!(block[0].lock().try_write().is_none());
        drop(first);
        drop(second);
        assert!(block[0].lock().try_write().is_some());
    }

    #[test]
    fn test_opposite_orders_do_not_deadlock() {
        let cache = Arc::new(IdentityCache::new(&CacheConfig::default()));
        let counter = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let cache = Arc::clone(&cache);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    let raw: &[u32] = if worker % 2 == 0 { &[1, 2] } else { &[2, 1] };
                    for _ in 0..500 {
                        let blocks = handles(&cache, raw);
                        let _set = enter(&[], &blocks).unwrap();
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2000);
    }
}

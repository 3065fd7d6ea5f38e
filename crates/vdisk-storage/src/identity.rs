//! Object-identity cache
//!
//! Guarantees at most one live [`BlockHandle`] per block offset, so every
//! caller that reaches the same block shares the same lock and the same
//! deallocation state.
//!
//! The offset map only holds weak references. A bounded keep-alive queue
//! (most recently used at the back) holds strong references to recently
//! touched handles so they survive between calls. Dead weak entries are
//! swept every `sweep_interval` lookups.
//!
//! The internal mutex is held for bookkeeping only, never across I/O.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;
use vdisk_common::{BlockOffset, CacheConfig, Error, Result};

/// In-memory identity of one block: its lock and its lifetime state
#[derive(Debug)]
pub struct BlockHandle {
    offset: BlockOffset,
    lock: Arc<RwLock<()>>,
    freed: AtomicBool,
    version: AtomicU64,
}

impl BlockHandle {
    fn new(offset: BlockOffset) -> Self {
        Self {
            offset,
            lock: Arc::new(RwLock::new(())),
            freed: AtomicBool::new(false),
            version: AtomicU64::new(0),
        }
    }

    /// Offset of the block
    #[must_use]
    pub const fn offset(&self) -> BlockOffset {
        self.offset
    }

    /// Reader/writer lock guarding the block
    #[must_use]
    pub const fn lock(&self) -> &Arc<RwLock<()>> {
        &self.lock
    }

    /// Check whether any reader or writer currently holds the block lock
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Check whether the backing block has been freed
    #[must_use]
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    /// Fail with `BlockDeallocated` if the backing block has been freed
    pub fn ensure_live(&self) -> Result<()> {
        if self.is_freed() {
            return Err(Error::BlockDeallocated {
                offset: self.offset,
            });
        }
        Ok(())
    }

    /// Modification counter, bumped on every content change
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    fn mark_freed(&self) {
        self.freed.store(true, Ordering::Release);
    }
}

/// Identity cache statistics
#[derive(Debug, Default)]
pub struct IdentityStats {
    /// Lookups answered by a live handle
    pub hits: AtomicU64,
    /// Lookups that created a new handle
    pub misses: AtomicU64,
    /// Number of sweeps performed
    pub sweeps: AtomicU64,
    /// Dead weak entries removed by sweeps
    pub swept: AtomicU64,
}

struct IdentityState {
    handles: HashMap<BlockOffset, Weak<BlockHandle>>,
    keep_alive: VecDeque<Arc<BlockHandle>>,
    lookups_since_sweep: u32,
}

impl IdentityState {
    fn touch(&mut self, handle: &Arc<BlockHandle>, capacity: usize) {
        if let Some(pos) = self
            .keep_alive
            .iter()
            .position(|kept| Arc::ptr_eq(kept, handle))
        {
            self.keep_alive.remove(pos);
        }
        if capacity == 0 {
            return;
        }
        while self.keep_alive.len() >= capacity {
            self.keep_alive.pop_front();
        }
        self.keep_alive.push_back(Arc::clone(handle));
    }

    fn sweep(&mut self) -> usize {
        let before = self.handles.len();
        self.handles.retain(|_, weak| weak.strong_count() > 0);
        before - self.handles.len()
    }
}

/// Single-instance cache of block handles keyed by offset
pub struct IdentityCache {
    state: Mutex<IdentityState>,
    keep_alive: usize,
    sweep_interval: u32,
    stats: IdentityStats,
}

impl IdentityCache {
    /// Create a cache from its configuration
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            state: Mutex::new(IdentityState {
                handles: HashMap::new(),
                keep_alive: VecDeque::with_capacity(config.keep_alive),
                lookups_since_sweep: 0,
            }),
            keep_alive: config.keep_alive,
            sweep_interval: config.sweep_interval.max(1),
            stats: IdentityStats::default(),
        }
    }

    /// Get cache statistics
    pub const fn stats(&self) -> &IdentityStats {
        &self.stats
    }

    /// Return the live handle for `offset`, creating one if none exists
    pub fn handle(&self, offset: BlockOffset) -> Arc<BlockHandle> {
        let mut state = self.state.lock();

        state.lookups_since_sweep += 1;
        if state.lookups_since_sweep >= self.sweep_interval {
            state.lookups_since_sweep = 0;
            let swept = state.sweep();
            self.stats.sweeps.fetch_add(1, Ordering::Relaxed);
            self.stats.swept.fetch_add(swept as u64, Ordering::Relaxed);
            if swept > 0 {
                debug!("Identity sweep removed {} dead entries", swept);
            }
        }

        let handle = match state.handles.get(&offset).and_then(Weak::upgrade) {
            Some(handle) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                handle
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                let handle = Arc::new(BlockHandle::new(offset));
                state.handles.insert(offset, Arc::downgrade(&handle));
                handle
            }
        };

        state.touch(&handle, self.keep_alive);
        handle
    }

    /// Invalidate the handle of a freed block.
    ///
    /// The live handle (if any) is marked freed and dropped from both the
    /// offset map and the keep-alive queue, so the next lookup of the same
    /// offset yields a fresh handle.
    pub fn invalidate(&self, offset: BlockOffset) {
        let mut state = self.state.lock();
        if let Some(handle) = state.handles.remove(&offset).and_then(|weak| weak.upgrade()) {
            handle.mark_freed();
        }
        state.keep_alive.retain(|kept| kept.offset() != offset);
    }

    /// Number of entries in the offset map, live or dead
    pub fn len(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Check if the offset map is empty
    pub fn is_empty(&self) -> bool {
        self.state.lock().handles.is_empty()
    }

    /// Number of handles currently pinned by the keep-alive queue
    pub fn pinned(&self) -> usize {
        self.state.lock().keep_alive.len()
    }

    /// Check whether `offset` is pinned by the keep-alive queue
    pub fn is_pinned(&self, offset: BlockOffset) -> bool {
        self.state
            .lock()
            .keep_alive
            .iter()
            .any(|kept| kept.offset() == offset)
    }

    /// Remove dead weak entries now
    pub fn sweep(&self) -> usize {
        let swept = self.state.lock().sweep();
        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);
        self.stats.swept.fetch_add(swept as u64, Ordering::Relaxed);
        swept
    }
}

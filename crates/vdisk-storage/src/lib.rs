//! VDisk Storage - Block-structured virtual disk engine
//!
//! This crate implements a virtual file system stored in a flat array of
//! fixed-size blocks, including:
//! - Persistence spaces (heap buffer or memory-mapped file)
//! - Typed block views over the on-disk layout
//! - Block allocation with an on-disk free-list stack
//! - Deadlock-free multi-block locking
//! - One live identity handle per block offset
//! - A directory/file tree built from block chains
//! - A change journal and the synchronization protocol built on it

pub mod block;
pub mod disk;
mod free_list;
pub mod identity;
mod journal;
pub mod layout;
pub mod lock;
pub mod manager;
pub mod space;
pub mod sync;
pub mod tree;

// Re-exports
pub use block::{
    BlockKind, BlockView, ContinuationBlock, DirectoryBlock, DirectoryContinuationBlock,
    DirectoryEntry, FileBlock, FileContinuationBlock, FreeListBlock, JournalBlock, JournalEntry,
};
pub use disk::VirtualDisk;
pub use identity::{BlockHandle, IdentityCache, IdentityStats};
pub use layout::{EntryFlags, MetaBlock};
pub use lock::{LockIntent, LockSet};
pub use manager::{BlockManager, ManagerStats};
pub use space::{HeapSpace, MappedSpace, PersistenceSpace};
pub use sync::{Synchronizer, replicate};
pub use tree::{FileReader, Node, VirtualDirectory, VirtualFile, VirtualPath};

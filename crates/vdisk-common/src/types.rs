//! Core type definitions for VDisk

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a block inside the virtual disk.
///
/// The byte address of a block is `offset * block_size`. Offset 0 holds
/// the meta block and doubles as the "no continuation" sentinel in link
/// fields, so it never names a content block.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
)]
pub struct BlockOffset(u32);

impl BlockOffset {
    /// Offset of the meta block
    pub const META: Self = Self(0);

    /// Create from a raw block index
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw block index
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Check if this is the meta block / sentinel offset
    #[must_use]
    pub const fn is_meta(self) -> bool {
        self.0 == 0
    }

    /// Byte address of this block for the given block size
    #[must_use]
    pub const fn byte_address(self, block_size: u32) -> u64 {
        self.0 as u64 * block_size as u64
    }

    /// Decode a raw link field, where 0 means "no block"
    #[must_use]
    pub const fn from_link(raw: u32) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }

    /// Encode an optional link for storage in a link field
    #[must_use]
    pub const fn to_link(link: Option<Self>) -> u32 {
        match link {
            Some(offset) => offset.0,
            None => 0,
        }
    }
}

impl fmt::Debug for BlockOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockOffset({})", self.0)
    }
}

impl fmt::Display for BlockOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

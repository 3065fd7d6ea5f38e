//! Configuration types for VDisk

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Smallest supported block size. A directory block must fit one entry
/// with a maximal (255 byte) name next to its header and link field.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Largest supported block size (1 MB)
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;

/// Default block size (4 KB)
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Configuration for opening or creating a virtual disk
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Block size used when formatting a new disk
    pub block_size: u32,
    /// Identity cache configuration
    pub cache: CacheConfig,
    /// Flush the persistence space when the disk is closed
    pub flush_on_close: bool,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            cache: CacheConfig::default(),
            flush_on_close: true,
        }
    }
}

impl DiskConfig {
    /// Create a config with the given block size and default everything else
    #[must_use]
    pub fn with_block_size(block_size: u32) -> Self {
        Self {
            block_size,
            ..Self::default()
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(Error::Configuration(format!(
                "block size {} must be a power of two between {} and {}",
                self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        self.cache.validate()
    }
}

/// Object-identity cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of recently used block handles kept alive
    pub keep_alive: usize,
    /// Number of identity lookups between sweeps of dead entries
    pub sweep_interval: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            keep_alive: 128,
            sweep_interval: 256,
        }
    }
}

impl CacheConfig {
    /// Validate cache settings
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval == 0 {
            return Err(Error::Configuration(
                "cache sweep interval must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

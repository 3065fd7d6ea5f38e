//! Error types for VDisk
//!
//! This module defines the common error types used throughout the system.

use crate::types::BlockOffset;
use thiserror::Error;

/// Common result type for VDisk operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for VDisk
#[derive(Debug, Error)]
pub enum Error {
    // Allocation errors
    #[error("out of disk space")]
    OutOfDiskSpace,

    #[error("block {offset} has been deallocated")]
    BlockDeallocated { offset: BlockOffset },

    // Path errors
    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("path already exists: {0}")]
    PathAlreadyExists(String),

    #[error("illegal path or name: {0}")]
    IllegalPathOrName(String),

    // Layout errors
    #[error("disk corrupt: {0}")]
    DiskCorrupt(String),

    #[error("access of {len} bytes at {pos} exceeds capacity {capacity}")]
    OutOfBounds { pos: u64, len: u64, capacity: u64 },

    // Lifecycle errors
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("persistence space has been disposed")]
    Disposed,

    // Ambient errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a disk corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::DiskCorrupt(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create an illegal path or name error
    pub fn illegal_name(name: impl Into<String>) -> Self {
        Self::IllegalPathOrName(name.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::PathNotFound(_))
    }

    /// Check if the caller can recover by changing its input
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::PathNotFound(_)
                | Self::PathAlreadyExists(_)
                | Self::IllegalPathOrName(_)
                | Self::InvalidArgument(_)
        )
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::DiskIo(io) => io,
            Error::PathNotFound(_) => Self::new(std::io::ErrorKind::NotFound, err),
            Error::PathAlreadyExists(_) => Self::new(std::io::ErrorKind::AlreadyExists, err),
            Error::IllegalPathOrName(_) | Error::InvalidArgument(_) => {
                Self::new(std::io::ErrorKind::InvalidInput, err)
            }
            Error::Unsupported(_) => Self::new(std::io::ErrorKind::Unsupported, err),
            other => Self::other(other),
        }
    }
}

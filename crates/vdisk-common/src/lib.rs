//! VDisk Common - Shared types and utilities
//!
//! This crate provides the block offset type, the error taxonomy and the
//! configuration structures used across all VDisk components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CacheConfig, DiskConfig};
pub use error::{Error, Result};
pub use types::*;

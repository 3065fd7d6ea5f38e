//! Virtual paths
//!
//! Segments are separated by `/`. A leading `/` makes a path absolute
//! (resolved from the root); `"/"` alone names the root.

use crate::layout;
use vdisk_common::{Error, Result};

pub const SEPARATOR: char = '/';

/// A parsed path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualPath<'a> {
    pub absolute: bool,
    pub segments: Vec<&'a str>,
}

impl<'a> VirtualPath<'a> {
    /// Split and validate a path. Empty segments are rejected.
    pub fn parse(path: &'a str) -> Result<Self> {
        let (absolute, rest) = match path.strip_prefix(SEPARATOR) {
            Some(rest) => (true, rest),
            None => (false, path),
        };
        if rest.is_empty() {
            if absolute {
                return Ok(Self {
                    absolute,
                    segments: Vec::new(),
                });
            }
            return Err(Error::IllegalPathOrName(path.to_string()));
        }

        let segments: Vec<_> = rest.split(SEPARATOR).collect();
        for segment in &segments {
            layout::validate_name(segment)
                .map_err(|_| Error::IllegalPathOrName(path.to_string()))?;
        }
        Ok(Self { absolute, segments })
    }

    /// Last segment, if any
    #[must_use]
    pub fn file_name(&self) -> Option<&'a str> {
        self.segments.last().copied()
    }

    /// All segments but the last
    #[must_use]
    pub fn parent_segments(&self) -> &[&'a str] {
        match self.segments.split_last() {
            Some((_, parent)) => parent,
            None => &[],
        }
    }
}

//! # Partitions
//!
//! Typed handles naming logically disjoint sub-keyspaces of the ordered
//! key-value engine. A partition is composed from a parent by appending a
//! segment; the `\x00` byte is the reserved delimiter and is rejected in
//! every user-supplied segment, which keeps composite keys unambiguous.

use serde::{Deserialize, Serialize};

use crate::{Result, unexpected};

/// The reserved key delimiter.
pub const DELIMITER: char = '\u{0}';

/// A named sub-keyspace of the ordered key-value engine.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct Partition {
    name: String,
}

impl Partition {
    /// Create a root partition.
    ///
    /// # Errors
    ///
    /// Returns an error when the name contains the reserved delimiter.
    pub fn root(name: &str) -> Result<Self> {
        check_segment(name)?;
        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Derive a child partition by appending a segment.
    ///
    /// # Errors
    ///
    /// Returns an error when the segment contains the reserved delimiter.
    pub fn child(&self, segment: &str) -> Result<Self> {
        check_segment(segment)?;
        Ok(Self {
            name: format!("{}{DELIMITER}{segment}", self.name),
        })
    }

    /// The partition's fully-qualified name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Reject segments containing the reserved delimiter.
pub(crate) fn check_segment(segment: &str) -> Result<()> {
    if segment.contains(DELIMITER) {
        return Err(unexpected!("key segment contains reserved delimiter"));
    }
    Ok(())
}

/// Join validated segments into a composite key.
pub(crate) fn join_key(segments: &[&str]) -> Result<String> {
    for segment in segments {
        check_segment(segment)?;
    }
    Ok(segments.join("\u{0}"))
}

/// A single write in a [`crate::provider::KvStore`] batch.
#[derive(Clone, Debug)]
pub enum WriteOp {
    /// Store `value` at `key`.
    Put {
        /// The key to store at.
        key: String,
        /// The value to store.
        value: Vec<u8>,
    },

    /// Delete the entry at `key`.
    Delete {
        /// The key to delete.
        key: String,
    },
}

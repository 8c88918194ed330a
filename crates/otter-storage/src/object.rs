//! Object identity and GC color primitives

use serde::{Deserialize, Serialize};
use std::fmt;

/// Persistent object identifier.
///
/// Identifiers are never reused. The low bits select the owning channel,
/// see [`ObjectId::channel`]. The raw value `0` is the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    /// The null reference
    pub const NULL: ObjectId = ObjectId(0);

    /// Wrap a raw identifier
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identifier value
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this id can name a stored object
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Owning channel for the given channel mask (`channel_count - 1`)
    #[inline]
    pub const fn channel(self, channel_mask: u64) -> usize {
        (self.0 & channel_mask) as usize
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type identifier, as assigned by the type dictionary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeId(u64);

impl TypeId {
    /// Wrap a raw type id
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw type id value
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage file number within a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(u64);

impl FileId {
    /// Wrap a raw file number
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw file number
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Mark color for tri-color marking
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkColor {
    /// Not known to be reachable
    #[default]
    White = 0,
    /// Reachable, references not yet scanned
    Gray = 1,
    /// Reachable, references scanned
    Black = 2,
}

/// Mask selecting the channel bits of an object id.
///
/// `channel_count` must be a power of two.
#[inline]
pub const fn channel_mask(channel_count: usize) -> u64 {
    channel_count as u64 - 1
}

/// Number of low bits consumed by channel selection
#[inline]
pub const fn channel_hash_shift(channel_count: usize) -> u32 {
    channel_count.trailing_zeros()
}

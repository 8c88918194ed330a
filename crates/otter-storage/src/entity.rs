//! Entity records
//!
//! An [`Entity`] is the in-memory index record of one stored object. Entities
//! live in the channel's arena and are addressed by [`EntityIdx`]; the hash,
//! type and file chains they belong to are links stored on the record itself.

use crate::object::{FileId, MarkColor, ObjectId};

/// Generational handle into a channel's entity arena.
///
/// A handle goes stale once its entity is swept, even if the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityIdx {
    index: u32,
    generation: u32,
}

impl EntityIdx {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Arena slot
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Slot generation this handle was issued for
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

/// Where an entity's encoded bytes live on durable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageLocation {
    /// Storage file
    pub file: FileId,
    /// Byte offset within the file
    pub offset: u64,
    /// Encoded length in bytes
    pub length: u32,
}

impl StorageLocation {
    /// Create a location
    pub const fn new(file: FileId, offset: u64, length: u32) -> Self {
        Self {
            file,
            offset,
            length,
        }
    }
}

/// Index record of one stored object
#[derive(Debug)]
pub struct Entity {
    object_id: ObjectId,
    type_slot: u32,
    has_references: bool,
    color: MarkColor,
    location: Option<StorageLocation>,
    cached_data: Option<Box<[u8]>>,
    last_touched: u64,

    pub(crate) hash_next: Option<EntityIdx>,
    pub(crate) type_prev: Option<EntityIdx>,
    pub(crate) type_next: Option<EntityIdx>,
    pub(crate) file_prev: Option<EntityIdx>,
    pub(crate) file_next: Option<EntityIdx>,
}

impl Entity {
    pub(crate) fn new(object_id: ObjectId, type_slot: u32, has_references: bool) -> Self {
        Self {
            object_id,
            type_slot,
            has_references,
            color: MarkColor::White,
            location: None,
            cached_data: None,
            last_touched: 0,
            hash_next: None,
            type_prev: None,
            type_next: None,
            file_prev: None,
            file_next: None,
        }
    }

    /// Object id
    #[inline]
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub(crate) fn type_slot(&self) -> u32 {
        self.type_slot
    }

    /// Whether the entity's type has reference fields
    #[inline]
    pub fn has_references(&self) -> bool {
        self.has_references
    }

    /// Current GC color
    #[inline]
    pub fn color(&self) -> MarkColor {
        self.color
    }

    pub(crate) fn set_color(&mut self, color: MarkColor) {
        self.color = color;
    }

    /// Storage location, `None` while detached from any file
    pub fn location(&self) -> Option<StorageLocation> {
        self.location
    }

    pub(crate) fn set_location(&mut self, location: Option<StorageLocation>) {
        self.location = location;
    }

    /// Decoded bytes, present while the entity is live in cache
    pub fn cached_data(&self) -> Option<&[u8]> {
        self.cached_data.as_deref()
    }

    /// Length of the cached data, 0 if none
    #[inline]
    pub fn cached_len(&self) -> u64 {
        self.cached_data.as_ref().map_or(0, |data| data.len() as u64)
    }

    /// Whether data is cached
    #[inline]
    pub fn is_live(&self) -> bool {
        self.cached_data.is_some()
    }

    /// Last access time in milliseconds since the UNIX epoch
    pub fn last_touched(&self) -> u64 {
        self.last_touched
    }

    pub(crate) fn touch(&mut self, now_ms: u64) {
        self.last_touched = now_ms;
    }

    /// Replace the cached data. Returns the previous cached length.
    pub(crate) fn put_cached_data(&mut self, data: Box<[u8]>, now_ms: u64) -> u64 {
        let released = self.clear_cache();
        self.cached_data = Some(data);
        self.last_touched = now_ms;
        released
    }

    /// Drop the cached data. Returns the released length.
    pub(crate) fn clear_cache(&mut self) -> u64 {
        self.cached_data.take().map_or(0, |data| data.len() as u64)
    }
}

//! Entity arena and object id hash table
//!
//! ## Design
//!
//! - **Arena**: entities live in a slot vector addressed by generational
//!   [`EntityIdx`] handles; freed slots are recycled with a bumped generation
//! - **Hash table**: power-of-two array of chain heads, chains are linked
//!   through `Entity::hash_next`
//! - **Channel shift**: the channel bits of an id are identical for every
//!   entity of a channel, so they are shifted out before bucketing
//! - **Resize**: doubled when the entity count reaches the modulo, up to a
//!   cap; shrunk by [`EntityIndex::consolidate`] when GC is idle

use crate::entity::{Entity, EntityIdx};
use crate::object::ObjectId;

/// Smallest hash table length
pub const MIN_TABLE_LENGTH: usize = 16;

struct Slot {
    generation: u32,
    entity: Option<Entity>,
}

/// Per-channel entity storage with object id lookup
pub(crate) struct EntityIndex {
    slots: Vec<Slot>,
    free: Vec<u32>,
    table: Vec<Option<EntityIdx>>,
    channel_shift: u32,
    max_table_length: usize,
    len: usize,
}

impl EntityIndex {
    pub(crate) fn new(channel_shift: u32, max_table_length: usize) -> Self {
        let max_table_length = max_table_length.max(1);
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            table: vec![None; MIN_TABLE_LENGTH.min(max_table_length)],
            channel_shift,
            max_table_length,
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn table_len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    fn modulo(&self) -> usize {
        self.table.len() - 1
    }

    #[inline]
    fn bucket(&self, object_id: ObjectId) -> usize {
        (object_id.raw() >> self.channel_shift) as usize & self.modulo()
    }

    pub(crate) fn get(&self, idx: EntityIdx) -> Option<&Entity> {
        let slot = self.slots.get(idx.index() as usize)?;
        if slot.generation != idx.generation() {
            return None;
        }
        slot.entity.as_ref()
    }

    pub(crate) fn get_mut(&mut self, idx: EntityIdx) -> Option<&mut Entity> {
        let slot = self.slots.get_mut(idx.index() as usize)?;
        if slot.generation != idx.generation() {
            return None;
        }
        slot.entity.as_mut()
    }

    /// Walk the hash chain of `object_id`
    pub(crate) fn lookup(&self, object_id: ObjectId) -> Option<EntityIdx> {
        let mut cursor = self.table[self.bucket(object_id)];
        while let Some(idx) = cursor {
            let entity = self.get(idx)?;
            if entity.object_id() == object_id {
                return Some(idx);
            }
            cursor = entity.hash_next;
        }
        None
    }

    /// Register a new entity. The caller guarantees its id is not present.
    pub(crate) fn insert(&mut self, entity: Entity) -> EntityIdx {
        if self.len >= self.modulo() && self.table.len() < self.max_table_length {
            self.rebuild(self.table.len() * 2);
        }

        let bucket = self.bucket(entity.object_id());
        let idx = self.allocate(entity);
        let head = self.table[bucket];
        if let Some(entity) = self.get_mut(idx) {
            entity.hash_next = head;
        }
        self.table[bucket] = Some(idx);
        self.len += 1;
        idx
    }

    fn allocate(&mut self, entity: Entity) -> EntityIdx {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entity = Some(entity);
            return EntityIdx::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entity: Some(entity),
        });
        EntityIdx::new(index, 0)
    }

    /// Unregister an entity from the hash table and free its slot.
    ///
    /// Type and file chain links must already be detached.
    pub(crate) fn remove(&mut self, idx: EntityIdx) -> Option<Entity> {
        let (object_id, next) = {
            let entity = self.get(idx)?;
            (entity.object_id(), entity.hash_next)
        };

        let bucket = self.bucket(object_id);
        if self.table[bucket] == Some(idx) {
            self.table[bucket] = next;
        } else {
            let mut cursor = self.table[bucket];
            while let Some(current) = cursor {
                let Some(entity) = self.get_mut(current) else {
                    break;
                };
                if entity.hash_next == Some(idx) {
                    entity.hash_next = next;
                    break;
                }
                cursor = entity.hash_next;
            }
        }

        let slot = &mut self.slots[idx.index() as usize];
        let entity = slot.entity.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(idx.index());
        self.len -= 1;
        entity
    }

    /// Shrink the table when it is at least twice as long as needed
    pub(crate) fn consolidate(&mut self) {
        let target = (self.len + 1).next_power_of_two().max(MIN_TABLE_LENGTH);
        if self.table.len() / 2 >= self.len && target < self.table.len() {
            self.rebuild(target);
        }
    }

    fn rebuild(&mut self, length: usize) {
        let length = length.clamp(1, self.max_table_length);
        tracing::debug!(
            target: "otter::storage::cache",
            from = self.table.len(),
            to = length,
            entities = self.len,
            "rebuilding object id table"
        );

        self.table = vec![None; length];
        for index in 0..self.slots.len() {
            let generation = self.slots[index].generation;
            let Some(object_id) = self.slots[index].entity.as_ref().map(Entity::object_id) else {
                continue;
            };
            let bucket = self.bucket(object_id);
            let head = self.table[bucket];
            if let Some(entity) = self.slots[index].entity.as_mut() {
                entity.hash_next = head;
            }
            self.table[bucket] = Some(EntityIdx::new(index as u32, generation));
        }
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.slots.iter_mut().filter_map(|slot| slot.entity.as_mut())
    }
}

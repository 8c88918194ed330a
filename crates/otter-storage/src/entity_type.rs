//! Per-channel type registry entry
//!
//! Each [`EntityType`] keeps an intrusive doubly linked chain of all entities
//! of its type on one channel. The sweep and export walk these chains.

use std::sync::Arc;

use crate::entity::EntityIdx;
use crate::handler::TypeHandler;
use crate::index::EntityIndex;
use crate::object::TypeId;

/// All entities of one type on one channel
pub struct EntityType {
    type_id: TypeId,
    channel: usize,
    handler: Arc<dyn TypeHandler>,
    head: Option<EntityIdx>,
    tail: Option<EntityIdx>,
    entity_count: usize,
}

impl EntityType {
    pub(crate) fn new(type_id: TypeId, channel: usize, handler: Arc<dyn TypeHandler>) -> Self {
        Self {
            type_id,
            channel,
            handler,
            head: None,
            tail: None,
            entity_count: 0,
        }
    }

    /// Type id
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Owning channel
    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Schema handler of the type
    pub fn handler(&self) -> &Arc<dyn TypeHandler> {
        &self.handler
    }

    /// Whether entities of this type carry references
    pub fn has_references(&self) -> bool {
        self.handler.has_references()
    }

    /// Number of registered entities
    pub fn entity_count(&self) -> usize {
        self.entity_count
    }

    /// Whether no entity of this type is registered
    pub fn is_empty(&self) -> bool {
        self.entity_count == 0
    }

    pub(crate) fn head(&self) -> Option<EntityIdx> {
        self.head
    }

    pub(crate) fn append(&mut self, index: &mut EntityIndex, idx: EntityIdx) {
        let tail = self.tail;
        if let Some(entity) = index.get_mut(idx) {
            entity.type_prev = tail;
            entity.type_next = None;
        }
        match tail.and_then(|tail| index.get_mut(tail)) {
            Some(last) => last.type_next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.entity_count += 1;
    }

    pub(crate) fn unlink(&mut self, index: &mut EntityIndex, idx: EntityIdx) {
        let Some(entity) = index.get_mut(idx) else {
            return;
        };
        let (prev, next) = (entity.type_prev.take(), entity.type_next.take());

        match prev.and_then(|prev| index.get_mut(prev)) {
            Some(prev) => prev.type_next = next,
            None => self.head = next,
        }
        match next.and_then(|next| index.get_mut(next)) {
            Some(next) => next.type_prev = prev,
            None => self.tail = prev,
        }
        self.entity_count -= 1;
    }

    /// Entity handles in chain order
    pub(crate) fn iter<'a>(
        &self,
        index: &'a EntityIndex,
    ) -> impl Iterator<Item = EntityIdx> + use<'a> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let current = cursor?;
            cursor = index.get(current).and_then(|entity| entity.type_next);
            Some(current)
        })
    }
}

impl std::fmt::Debug for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityType")
            .field("type_id", &self.type_id)
            .field("channel", &self.channel)
            .field("entity_count", &self.entity_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::error::StorageResult;
    use crate::object::ObjectId;
    use crate::reference_marker::ReferenceMarker;

    struct Leaf;

    impl TypeHandler for Leaf {
        fn type_id(&self) -> TypeId {
            TypeId::new(1)
        }

        fn has_references(&self) -> bool {
            false
        }

        fn iterate_references(&self, _: &[u8], _: &mut dyn ReferenceMarker) -> StorageResult<()> {
            Ok(())
        }
    }

    fn ids(ty: &EntityType, index: &EntityIndex) -> Vec<u64> {
        ty.iter(index)
            .map(|idx| index.get(idx).unwrap().object_id().raw())
            .collect()
    }

    #[test]
    fn test_chain_append_unlink() {
        let mut index = EntityIndex::new(0, 1 << 10);
        let mut ty = EntityType::new(TypeId::new(1), 0, Arc::new(Leaf));
        let handles: Vec<_> = (1..=4u64)
            .map(|raw| {
                let idx = index.insert(Entity::new(ObjectId::new(raw), 0, false));
                ty.append(&mut index, idx);
                idx
            })
            .collect();
        assert_eq!(ids(&ty, &index), vec![1, 2, 3, 4]);

        ty.unlink(&mut index, handles[1]);
        assert_eq!(ids(&ty, &index), vec![1, 3, 4]);
        ty.unlink(&mut index, handles[0]);
        ty.unlink(&mut index, handles[3]);
        assert_eq!(ids(&ty, &index), vec![3]);
        assert_eq!(ty.entity_count(), 1);

        ty.unlink(&mut index, handles[2]);
        assert!(ty.is_empty());
        assert_eq!(ids(&ty, &index), Vec::<u64>::new());
    }
}

//! Per-channel entity cache
//!
//! Owns the object id table, the type registry, the file chains and the
//! cached entity data of one channel. Everything here runs on the channel's
//! own thread; the only shared state is behind the [`MarkMonitor`].

mod gc;
mod live_check;

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::config::StorageGcConfig;
use crate::current_time_millis;
use crate::entity::{Entity, EntityIdx, StorageLocation};
use crate::entity_type::EntityType;
use crate::error::{StorageError, StorageResult};
use crate::file_chain::FileChains;
use crate::handler::{
    CacheEvaluator, DefaultCacheEvaluator, EntityStorage, LoggingZombieIdHandler, RootSelector,
    TypeDictionary, ZombieIdHandler,
};
use crate::index::EntityIndex;
use crate::monitor::MarkMonitor;
use crate::object::{FileId, ObjectId, TypeId, channel_hash_shift};
use crate::reference_marker::CachingReferenceMarker;

/// One entity record written by a store or read during initial load
#[derive(Debug, Clone)]
pub struct StoredEntity {
    /// Object id
    pub object_id: ObjectId,
    /// Type id
    pub type_id: TypeId,
    /// Where the record was written
    pub location: StorageLocation,
    /// Decoded bytes to keep cached, if any
    pub data: Option<Box<[u8]>>,
}

impl StoredEntity {
    /// Create a record without cached data
    pub fn new(object_id: ObjectId, type_id: TypeId, location: StorageLocation) -> Self {
        Self {
            object_id,
            type_id,
            location,
            data: None,
        }
    }

    /// Keep `data` cached after the store
    pub fn with_data(mut self, data: impl Into<Box<[u8]>>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// Entity index and GC state of one channel
pub struct EntityCache {
    channel: usize,
    monitor: Arc<MarkMonitor>,
    type_dictionary: Arc<dyn TypeDictionary>,
    storage: Arc<dyn EntityStorage>,
    root_selector: Arc<dyn RootSelector>,
    zombie_handler: Arc<dyn ZombieIdHandler>,
    evaluator: Arc<dyn CacheEvaluator>,

    index: EntityIndex,
    types: Vec<EntityType>,
    type_slots: FxHashMap<TypeId, u32>,
    files: FileChains,
    used_cache_size: u64,
    live_check_cursor: Option<EntityIdx>,

    reference_marker: CachingReferenceMarker,
    mark_buffer: Vec<ObjectId>,
    mark_buffer_length: usize,
    marking_wait_time: Duration,
}

impl EntityCache {
    /// Create the cache of `channel`
    pub fn new(
        channel: usize,
        config: &StorageGcConfig,
        monitor: Arc<MarkMonitor>,
        type_dictionary: Arc<dyn TypeDictionary>,
        storage: Arc<dyn EntityStorage>,
        root_selector: Arc<dyn RootSelector>,
    ) -> StorageResult<Self> {
        config.validate()?;
        if config.channel_count != monitor.channel_count() || channel >= config.channel_count {
            return Err(StorageError::invalid_config(format!(
                "channel {channel} does not fit a monitor with {} channels",
                monitor.channel_count()
            )));
        }

        Ok(Self {
            channel,
            reference_marker: CachingReferenceMarker::new(
                Arc::clone(&monitor),
                config.reference_cache_length,
            ),
            monitor,
            type_dictionary,
            storage,
            root_selector,
            zombie_handler: Arc::new(LoggingZombieIdHandler),
            evaluator: Arc::new(DefaultCacheEvaluator::new(
                config.cache_timeout,
                config.cache_threshold,
            )),
            index: EntityIndex::new(
                channel_hash_shift(config.channel_count),
                config.max_oid_table_length,
            ),
            types: Vec::new(),
            type_slots: FxHashMap::default(),
            files: FileChains::new(),
            used_cache_size: 0,
            live_check_cursor: None,
            mark_buffer: Vec::with_capacity(config.mark_buffer_length.min(1024)),
            mark_buffer_length: config.mark_buffer_length,
            marking_wait_time: config.marking_wait_time,
        })
    }

    /// Replace the zombie id handler
    pub fn with_zombie_handler(mut self, handler: Arc<dyn ZombieIdHandler>) -> Self {
        self.zombie_handler = handler;
        self
    }

    /// Replace the cache evaluator
    pub fn with_evaluator(mut self, evaluator: Arc<dyn CacheEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Channel index
    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Shared mark monitor
    pub fn monitor(&self) -> &Arc<MarkMonitor> {
        &self.monitor
    }

    /// Sum of the lengths of all cached entity data
    pub fn used_cache_size(&self) -> u64 {
        self.used_cache_size
    }

    /// Registered entities
    pub fn entity_count(&self) -> usize {
        self.index.len()
    }

    /// Registered types
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    /// Current object id table length
    pub fn oid_table_length(&self) -> usize {
        self.index.table_len()
    }

    /// Storage files holding at least one entity
    pub fn file_count(&self) -> usize {
        self.files.file_count()
    }

    /// Entities located in `file`
    pub fn file_entity_count(&self, file: FileId) -> usize {
        self.files.file_len(file)
    }

    /// Look up an entity by id
    pub fn get(&self, object_id: ObjectId) -> Option<&Entity> {
        self.index
            .lookup(object_id)
            .and_then(|idx| self.index.get(idx))
    }

    /// Type registry entry of `type_id` on this channel
    pub fn entity_type(&self, type_id: TypeId) -> Option<&EntityType> {
        self.type_slots
            .get(&type_id)
            .map(|&slot| &self.types[slot as usize])
    }

    /// Visit every entity of `type_id` in registration order
    pub fn iterate_type_entities(&self, type_id: TypeId, mut visit: impl FnMut(&Entity)) {
        let Some(entity_type) = self.entity_type(type_id) else {
            return;
        };
        for idx in entity_type.iter(&self.index) {
            if let Some(entity) = self.index.get(idx) {
                visit(entity);
            }
        }
    }

    fn validate_object_id(&self, object_id: ObjectId) -> StorageResult<()> {
        if !object_id.is_valid() {
            return Err(StorageError::InvalidObjectId(object_id));
        }
        if self.monitor.channel_of(object_id) != self.channel {
            return Err(StorageError::WrongChannel {
                object_id,
                channel: self.channel,
            });
        }
        Ok(())
    }

    fn ensure_type(&mut self, type_id: TypeId) -> StorageResult<u32> {
        if let Some(&slot) = self.type_slots.get(&type_id) {
            return Ok(slot);
        }
        let handler = self
            .type_dictionary
            .lookup(type_id)
            .ok_or(StorageError::UnknownType(type_id))?;

        let slot = self.types.len() as u32;
        self.types
            .push(EntityType::new(type_id, self.channel, handler));
        self.type_slots.insert(type_id, slot);
        tracing::trace!(
            target: "otter::storage::cache",
            channel = self.channel,
            type_id = type_id.raw(),
            "registered entity type"
        );
        Ok(slot)
    }

    /// Get or create the entity for `object_id`.
    ///
    /// An existing entity is reset for an update: its cached data is dropped
    /// and it is detached from its storage file.
    pub fn put_entity(&mut self, object_id: ObjectId, type_id: TypeId) -> StorageResult<EntityIdx> {
        self.validate_object_id(object_id)?;

        if let Some(idx) = self.index.lookup(object_id) {
            if let Some(entity) = self.index.get_mut(idx) {
                let existing = self.types[entity.type_slot() as usize].type_id();
                if existing != type_id {
                    return Err(StorageError::TypeMismatch {
                        object_id,
                        existing,
                        given: type_id,
                    });
                }
                self.used_cache_size -= entity.clear_cache();
            }
            self.files.detach(&mut self.index, idx);
            return Ok(idx);
        }

        let slot = self.ensure_type(type_id)?;
        let has_references = self.types[slot as usize].has_references();
        let idx = self
            .index
            .insert(Entity::new(object_id, slot, has_references));
        self.types[slot as usize].append(&mut self.index, idx);
        Ok(idx)
    }

    fn put_stored(&mut self, stored: StoredEntity, now_ms: u64) -> StorageResult<EntityIdx> {
        self.validate_object_id(stored.object_id)?;
        if stored.location.length == 0 {
            return Err(StorageError::ZeroLength(stored.object_id));
        }

        let idx = self.put_entity(stored.object_id, stored.type_id)?;
        self.files.attach(&mut self.index, idx, stored.location);
        if let (Some(data), Some(entity)) = (stored.data, self.index.get_mut(idx)) {
            self.used_cache_size -= entity.put_cached_data(data, now_ms);
            self.used_cache_size += entity.cached_len();
        }
        Ok(idx)
    }

    /// Index an entity found while loading the channel's files.
    ///
    /// The entity stays white; the root re-marks it if it is reachable.
    pub fn register_entity(&mut self, stored: StoredEntity) -> StorageResult<()> {
        self.put_stored(stored, current_time_millis()).map(drop)
    }

    /// Announce a store on this channel before any file is written
    pub fn begin_store_update(&self) {
        self.monitor.signal_pending_store_update(self.channel);
        self.monitor.reset_completion();
    }

    /// Apply stored entity records and mark them for the running GC cycle.
    ///
    /// Flags a store in flight on entry, in case [`begin_store_update`] was
    /// skipped, and clears the flag when done. On error the flag stays set and
    /// the channel must not be used further.
    ///
    /// [`begin_store_update`]: Self::begin_store_update
    pub fn store_entities(
        &mut self,
        entities: impl IntoIterator<Item = StoredEntity>,
    ) -> StorageResult<usize> {
        self.monitor.signal_pending_store_update(self.channel);
        let pending_sweep = self.monitor.is_pending_sweep(self.channel);
        self.monitor.reset_completion();

        let now = current_time_millis();
        let mut stored = 0;
        for entity in entities {
            let idx = self.put_stored(entity, now)?;
            self.mark_entity_for_changed_data(idx, pending_sweep);
            stored += 1;
        }

        self.monitor.clear_pending_store_update(self.channel);
        tracing::trace!(
            target: "otter::storage::cache",
            channel = self.channel,
            stored,
            pending_sweep,
            "stored entities"
        );
        Ok(stored)
    }

    /// This channel's root candidate as chosen by the root selector
    pub fn query_root_object_id(&self) -> Option<ObjectId> {
        let mut candidates = self
            .types
            .iter()
            .filter(|entity_type| self.root_selector.is_root_type(entity_type.type_id()))
            .flat_map(|entity_type| entity_type.iter(&self.index))
            .filter_map(|idx| self.index.get(idx).map(Entity::object_id));
        self.root_selector.select_root(&mut candidates)
    }

    /// Evict or touch the cached data of one entity. Returns whether it was evicted.
    fn check_for_cache_clear(
        &mut self,
        idx: EntityIdx,
        eval_time_ms: u64,
        evaluator: &dyn CacheEvaluator,
    ) -> bool {
        let Some(entity) = self.index.get_mut(idx) else {
            return false;
        };
        if !entity.is_live() {
            return false;
        }
        if evaluator.clear_entity_cache(self.used_cache_size, eval_time_ms, entity) {
            self.used_cache_size -= entity.clear_cache();
            true
        } else {
            entity.touch(eval_time_ms);
            false
        }
    }
}

impl std::fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("channel", &self.channel)
            .field("entities", &self.index.len())
            .field("types", &self.types.len())
            .field("used_cache_size", &self.used_cache_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MarkColor;
    use crate::test_support::{LEAF, NODE, ROOT, Fixture, encode, location};

    #[test]
    fn test_put_creates_and_reuses_entities() {
        let mut cache = Fixture::new(1).cache(0);
        let a = cache.put_entity(ObjectId::new(10), NODE).unwrap();
        let b = cache.put_entity(ObjectId::new(10), NODE).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.entity_count(), 1);
        assert_eq!(cache.type_count(), 1);
        assert_eq!(cache.entity_type(NODE).unwrap().entity_count(), 1);
    }

    #[test]
    fn test_consistency_errors() {
        let fixture = Fixture::new(2);
        let mut cache = fixture.cache(0);
        cache.put_entity(ObjectId::new(10), NODE).unwrap();

        assert!(matches!(
            cache.put_entity(ObjectId::new(10), LEAF),
            Err(StorageError::TypeMismatch { .. })
        ));
        assert!(matches!(
            cache.put_entity(ObjectId::new(11), NODE),
            Err(StorageError::WrongChannel { channel: 0, .. })
        ));
        assert!(matches!(
            cache.put_entity(ObjectId::NULL, NODE),
            Err(StorageError::InvalidObjectId(_))
        ));
        assert!(matches!(
            cache.put_entity(ObjectId::new(12), TypeId::new(99)),
            Err(StorageError::UnknownType(_))
        ));

        let zero = StoredEntity::new(
            ObjectId::new(14),
            LEAF,
            StorageLocation::new(FileId::new(1), 0, 0),
        );
        assert!(matches!(
            cache.store_entities([zero]),
            Err(StorageError::ZeroLength(_))
        ));
        assert!(cache.get(ObjectId::new(14)).is_none());
    }

    #[test]
    fn test_store_tracks_cache_size() {
        let mut cache = Fixture::new(1).cache(0);
        cache
            .store_entities([
                StoredEntity::new(ObjectId::new(1), NODE, location(1, 0))
                    .with_data(encode(&[2, 3])),
                StoredEntity::new(ObjectId::new(2), LEAF, location(1, 16))
                    .with_data(vec![7u8; 5]),
            ])
            .unwrap();
        assert_eq!(cache.used_cache_size(), 21);

        // re-store without data drops the cached copy
        cache
            .store_entities([StoredEntity::new(ObjectId::new(1), NODE, location(2, 0))])
            .unwrap();
        assert_eq!(cache.used_cache_size(), 5);
        assert_eq!(cache.file_entity_count(FileId::new(1)), 1);
        assert_eq!(cache.file_entity_count(FileId::new(2)), 1);
        assert_eq!(
            cache.get(ObjectId::new(1)).unwrap().location(),
            Some(location(2, 0))
        );
    }

    #[test]
    fn test_store_colors_by_references() {
        let fixture = Fixture::new(1);
        let mut cache = fixture.cache(0);
        cache.begin_store_update();
        cache
            .store_entities([
                StoredEntity::new(ObjectId::new(1), NODE, location(1, 0)),
                StoredEntity::new(ObjectId::new(2), LEAF, location(1, 8)),
            ])
            .unwrap();

        assert_eq!(cache.get(ObjectId::new(1)).unwrap().color(), MarkColor::Gray);
        assert_eq!(cache.get(ObjectId::new(2)).unwrap().color(), MarkColor::Black);
        assert_eq!(fixture.monitor.pending_marks(), 1);
        assert!(!fixture.monitor.is_complete(0));
        assert_eq!(fixture.monitor.stats().pending_store_updates, 0);
    }

    /// Dictionary reporting whether a sweep could be issued while types resolve
    struct SweepWatchingDictionary {
        types: Arc<FxHashMap<TypeId, Arc<dyn crate::handler::TypeHandler>>>,
        monitor: Arc<MarkMonitor>,
        sweep_possible: parking_lot::Mutex<Vec<bool>>,
    }

    impl TypeDictionary for SweepWatchingDictionary {
        fn lookup(&self, type_id: TypeId) -> Option<Arc<dyn crate::handler::TypeHandler>> {
            self.sweep_possible
                .lock()
                .push(self.monitor.is_marking_complete());
            self.types.lookup(type_id)
        }
    }

    #[test]
    fn test_store_without_begin_blocks_sweep() {
        let fixture = Fixture::new(2);
        let dictionary = Arc::new(SweepWatchingDictionary {
            types: fixture.types.clone(),
            monitor: Arc::clone(&fixture.monitor),
            sweep_possible: parking_lot::Mutex::new(Vec::new()),
        });
        let mut cache = EntityCache::new(
            0,
            &fixture.config,
            Arc::clone(&fixture.monitor),
            dictionary.clone(),
            fixture.storage.clone(),
            Arc::new(crate::handler::HighestRootIdSelector::new([ROOT])),
        )
        .unwrap();
        fixture.monitor.reset_completion();

        cache
            .store_entities([StoredEntity::new(ObjectId::new(2), LEAF, location(1, 0))])
            .unwrap();

        assert_eq!(*dictionary.sweep_possible.lock(), vec![false]);
        assert_eq!(fixture.monitor.stats().pending_store_updates, 0);
        assert!(fixture.monitor.is_marking_complete());
    }

    #[test]
    fn test_register_entity_stays_white() {
        let fixture = Fixture::new(1);
        let mut cache = fixture.cache(0);
        cache
            .register_entity(StoredEntity::new(ObjectId::new(1), NODE, location(1, 0)))
            .unwrap();
        assert_eq!(cache.get(ObjectId::new(1)).unwrap().color(), MarkColor::White);
        assert_eq!(fixture.monitor.pending_marks(), 0);
        assert!(fixture.monitor.is_complete(0));
    }

    #[test]
    fn test_root_query_and_type_iteration() {
        let mut cache = Fixture::new(1).cache(0);
        for raw in [3u64, 9, 5] {
            cache
                .register_entity(StoredEntity::new(ObjectId::new(raw), ROOT, location(1, raw)))
                .unwrap();
        }
        cache
            .register_entity(StoredEntity::new(ObjectId::new(20), NODE, location(1, 20)))
            .unwrap();
        assert_eq!(cache.query_root_object_id(), Some(ObjectId::new(9)));

        let mut seen = Vec::new();
        cache.iterate_type_entities(ROOT, |entity| seen.push(entity.object_id().raw()));
        assert_eq!(seen, vec![3, 9, 5]);
    }
}

//! Fixtures for unit tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cache::EntityCache;
use crate::config::StorageGcConfig;
use crate::entity::StorageLocation;
use crate::error::{StorageError, StorageResult};
use crate::handler::{EntityStorage, HighestRootIdSelector, TypeHandler, ZombieIdHandler};
use crate::monitor::MarkMonitor;
use crate::object::{FileId, ObjectId, TypeId};
use crate::reference_marker::ReferenceMarker;

pub(crate) const ROOT: TypeId = TypeId::new(1);
pub(crate) const NODE: TypeId = TypeId::new(2);
pub(crate) const LEAF: TypeId = TypeId::new(3);

/// Entity data is a list of little endian u64 object ids
pub(crate) struct IdListHandler {
    type_id: TypeId,
    has_references: bool,
}

impl TypeHandler for IdListHandler {
    fn type_id(&self) -> TypeId {
        self.type_id
    }

    fn has_references(&self) -> bool {
        self.has_references
    }

    fn iterate_references(
        &self,
        data: &[u8],
        marker: &mut dyn ReferenceMarker,
    ) -> StorageResult<()> {
        for chunk in data.chunks_exact(8) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            marker.mark(ObjectId::new(u64::from_le_bytes(raw)));
        }
        Ok(())
    }
}

pub(crate) fn encode(ids: &[u64]) -> Box<[u8]> {
    ids.iter().flat_map(|id| id.to_le_bytes()).collect()
}

pub(crate) fn location(file: u64, offset: u64) -> StorageLocation {
    StorageLocation::new(FileId::new(file), offset, 8)
}

#[derive(Default)]
pub(crate) struct MemoryStorage {
    data: Mutex<FxHashMap<ObjectId, Box<[u8]>>>,
    loads: AtomicUsize,
    cleanup_resets: AtomicUsize,
}

impl MemoryStorage {
    pub(crate) fn put(&self, object_id: ObjectId, data: Box<[u8]>) {
        self.data.lock().insert(object_id, data);
    }

    pub(crate) fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    pub(crate) fn cleanup_resets(&self) -> usize {
        self.cleanup_resets.load(Ordering::Relaxed)
    }
}

impl EntityStorage for MemoryStorage {
    fn load(&self, object_id: ObjectId, _: &StorageLocation) -> StorageResult<Box<[u8]>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.data
            .lock()
            .get(&object_id)
            .cloned()
            .ok_or_else(|| StorageError::load(object_id, "not in memory storage"))
    }

    fn reset_file_cleanup_cursor(&self, _: usize) {
        self.cleanup_resets.fetch_add(1, Ordering::Relaxed);
    }
}

/// Records zombie ids and leaves them unhandled
#[derive(Default)]
pub(crate) struct RecordingZombies {
    seen: Mutex<Vec<ObjectId>>,
}

impl RecordingZombies {
    pub(crate) fn seen(&self) -> Vec<ObjectId> {
        self.seen.lock().clone()
    }
}

impl ZombieIdHandler for RecordingZombies {
    fn handle_zombie_id(&self, _: usize, object_id: ObjectId) -> bool {
        self.seen.lock().push(object_id);
        false
    }
}

pub(crate) struct Fixture {
    pub(crate) config: StorageGcConfig,
    pub(crate) monitor: Arc<MarkMonitor>,
    pub(crate) storage: Arc<MemoryStorage>,
    pub(crate) types: Arc<FxHashMap<TypeId, Arc<dyn TypeHandler>>>,
}

impl Fixture {
    pub(crate) fn new(channel_count: usize) -> Self {
        let mut types: FxHashMap<TypeId, Arc<dyn TypeHandler>> = FxHashMap::default();
        for (type_id, has_references) in [(ROOT, true), (NODE, true), (LEAF, false)] {
            types.insert(
                type_id,
                Arc::new(IdListHandler {
                    type_id,
                    has_references,
                }),
            );
        }
        Self {
            config: StorageGcConfig::new().channel_count(channel_count),
            monitor: Arc::new(MarkMonitor::new(channel_count).unwrap()),
            storage: Arc::new(MemoryStorage::default()),
            types: Arc::new(types),
        }
    }

    pub(crate) fn cache(&self, channel: usize) -> EntityCache {
        EntityCache::new(
            channel,
            &self.config,
            Arc::clone(&self.monitor),
            self.types.clone(),
            self.storage.clone(),
            Arc::new(HighestRootIdSelector::new([ROOT])),
        )
        .unwrap()
    }
}

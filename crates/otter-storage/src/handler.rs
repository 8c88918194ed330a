//! Collaborator contracts
//!
//! The cache does not own file I/O, type schemas or root definitions. These
//! traits are the seams where the storage engine plugs them in.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::entity::{Entity, StorageLocation};
use crate::error::StorageResult;
use crate::object::{ObjectId, TypeId};
use crate::reference_marker::ReferenceMarker;

/// Schema knowledge of one type
pub trait TypeHandler: Send + Sync {
    /// Type id
    fn type_id(&self) -> TypeId;

    /// Whether instances can hold references. Fixed per type.
    fn has_references(&self) -> bool;

    /// Report every object id referenced by `data` to `marker`
    fn iterate_references(
        &self,
        data: &[u8],
        marker: &mut dyn ReferenceMarker,
    ) -> StorageResult<()>;
}

/// Resolves type ids to their handlers
pub trait TypeDictionary: Send + Sync {
    /// Handler for `type_id`, if the type is known
    fn lookup(&self, type_id: TypeId) -> Option<Arc<dyn TypeHandler>>;
}

impl TypeDictionary for FxHashMap<TypeId, Arc<dyn TypeHandler>> {
    fn lookup(&self, type_id: TypeId) -> Option<Arc<dyn TypeHandler>> {
        self.get(&type_id).cloned()
    }
}

/// Storage file layer
pub trait EntityStorage: Send + Sync {
    /// Read the decoded bytes of an entity
    fn load(&self, object_id: ObjectId, location: &StorageLocation) -> StorageResult<Box<[u8]>>;

    /// Called after `channel` completed a sweep; files may now be reclaimable
    fn reset_file_cleanup_cursor(&self, channel: usize);
}

/// Defines the GC root type(s) and picks one root per channel
pub trait RootSelector: Send + Sync {
    /// Whether entities of `type_id` are root candidates
    fn is_root_type(&self, type_id: TypeId) -> bool;

    /// Pick the channel's root among the surviving candidates
    fn select_root(&self, candidates: &mut dyn Iterator<Item = ObjectId>) -> Option<ObjectId> {
        candidates.max()
    }
}

/// Root selector choosing the highest id among entities of the root types
#[derive(Debug, Clone, Default)]
pub struct HighestRootIdSelector {
    root_types: Vec<TypeId>,
}

impl HighestRootIdSelector {
    /// Create a selector for the given root types
    pub fn new(root_types: impl IntoIterator<Item = TypeId>) -> Self {
        Self {
            root_types: root_types.into_iter().collect(),
        }
    }
}

impl RootSelector for HighestRootIdSelector {
    fn is_root_type(&self, type_id: TypeId) -> bool {
        self.root_types.contains(&type_id)
    }
}

/// Handles mark queue entries that name no stored entity.
///
/// Zombie ids never stop marking. Ids the handler does not report as handled
/// are logged by the cache.
pub trait ZombieIdHandler: Send + Sync {
    /// Return `true` if the id was handled
    fn handle_zombie_id(&self, channel: usize, object_id: ObjectId) -> bool;
}

/// Logs zombie ids and reports them handled
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingZombieIdHandler;

impl ZombieIdHandler for LoggingZombieIdHandler {
    fn handle_zombie_id(&self, channel: usize, object_id: ObjectId) -> bool {
        tracing::warn!(
            target: "otter::storage::gc",
            channel,
            object_id = object_id.raw(),
            "zombie object id in mark queue"
        );
        true
    }
}

/// Cache eviction policy
pub trait CacheEvaluator: Send + Sync {
    /// Whether `entity`'s cached data should be released.
    ///
    /// `cache_size` is the channel's current cached byte total and
    /// `eval_time_ms` the evaluation time in milliseconds since the UNIX epoch.
    fn clear_entity_cache(&self, cache_size: u64, eval_time_ms: u64, entity: &Entity) -> bool;
}

impl<F> CacheEvaluator for F
where
    F: Fn(u64, u64, &Entity) -> bool + Send + Sync,
{
    fn clear_entity_cache(&self, cache_size: u64, eval_time_ms: u64, entity: &Entity) -> bool {
        self(cache_size, eval_time_ms, entity)
    }
}

/// Age and size weighted eviction.
///
/// Evicts data older than the timeout. Younger data is evicted once the free
/// room below the threshold gets smaller than the entity's weight, which grows
/// with its length and age (in units of ~65s). Entities without references
/// weigh double.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultCacheEvaluator {
    timeout_ms: u64,
    threshold: u64,
}

impl DefaultCacheEvaluator {
    /// Default timeout, one day
    pub const DEFAULT_TIMEOUT_MS: u64 = 86_400_000;
    /// Default threshold, 1GB
    pub const DEFAULT_THRESHOLD: u64 = 1_000_000_000;

    /// Create an evaluator. Zero values are raised to 1.
    pub fn new(timeout: Duration, threshold: u64) -> Self {
        Self {
            timeout_ms: (timeout.as_millis() as u64).max(1),
            threshold: threshold.max(1),
        }
    }

    /// Timeout in milliseconds
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Threshold in bytes
    pub fn threshold(&self) -> u64 {
        self.threshold
    }
}

impl Default for DefaultCacheEvaluator {
    fn default() -> Self {
        Self {
            timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            threshold: Self::DEFAULT_THRESHOLD,
        }
    }
}

impl CacheEvaluator for DefaultCacheEvaluator {
    fn clear_entity_cache(&self, cache_size: u64, eval_time_ms: u64, entity: &Entity) -> bool {
        let age = eval_time_ms.saturating_sub(entity.last_touched());
        if age >= self.timeout_ms {
            return true;
        }

        let headroom = self.threshold as i128 - cache_size as i128;
        let mut weight = entity.cached_len().saturating_mul(age >> 16);
        if !entity.has_references() {
            weight = weight.saturating_mul(2);
        }
        headroom < weight as i128
    }
}

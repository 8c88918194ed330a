//! Storage collector
//!
//! Builds one [`MarkMonitor`] and an [`EntityCache`] per channel from a
//! configuration. Production drivers move the caches onto their channel
//! threads with [`StorageCollector::into_channels`]; the round-robin helpers
//! here drive all channels from one thread.

use std::sync::Arc;
use std::time::Instant;

use crate::cache::{EntityCache, StoredEntity};
use crate::config::StorageGcConfig;
use crate::error::StorageResult;
use crate::handler::{EntityStorage, RootSelector, TypeDictionary};
use crate::monitor::{GcStats, MarkMonitor};
use crate::object::ObjectId;

/// The mark monitor and all channel caches of one storage instance
pub struct StorageCollector {
    config: StorageGcConfig,
    monitor: Arc<MarkMonitor>,
    channels: Vec<EntityCache>,
}

impl StorageCollector {
    /// Create the monitor and all channel caches
    pub fn new(
        config: StorageGcConfig,
        type_dictionary: Arc<dyn TypeDictionary>,
        storage: Arc<dyn EntityStorage>,
        root_selector: Arc<dyn RootSelector>,
    ) -> StorageResult<Self> {
        config.validate()?;
        let monitor = Arc::new(MarkMonitor::new(config.channel_count)?);
        let channels = (0..config.channel_count)
            .map(|channel| {
                EntityCache::new(
                    channel,
                    &config,
                    Arc::clone(&monitor),
                    Arc::clone(&type_dictionary),
                    Arc::clone(&storage),
                    Arc::clone(&root_selector),
                )
            })
            .collect::<StorageResult<Vec<_>>>()?;

        tracing::debug!(
            target: "otter::storage::gc",
            channels = config.channel_count,
            "storage collector created"
        );
        Ok(Self {
            config,
            monitor,
            channels,
        })
    }

    /// Configuration
    pub fn config(&self) -> &StorageGcConfig {
        &self.config
    }

    /// Shared mark monitor
    pub fn monitor(&self) -> &Arc<MarkMonitor> {
        &self.monitor
    }

    /// Channel caches
    pub fn channels(&self) -> &[EntityCache] {
        &self.channels
    }

    /// Mutable channel caches
    pub fn channels_mut(&mut self) -> &mut [EntityCache] {
        &mut self.channels
    }

    /// Hand the caches over to per-channel workers
    pub fn into_channels(self) -> (Arc<MarkMonitor>, Vec<EntityCache>) {
        (self.monitor, self.channels)
    }

    /// Cache owning `object_id`
    pub fn channel_for(&self, object_id: ObjectId) -> &EntityCache {
        &self.channels[self.monitor.channel_of(object_id)]
    }

    /// Monitor statistics
    pub fn stats(&self) -> GcStats {
        self.monitor.stats()
    }

    /// Store records on their owning channels as one store task
    pub fn store(
        &mut self,
        entities: impl IntoIterator<Item = StoredEntity>,
    ) -> StorageResult<usize> {
        let mut per_channel: Vec<Vec<StoredEntity>> = vec![Vec::new(); self.channels.len()];
        for entity in entities {
            per_channel[self.monitor.channel_of(entity.object_id)].push(entity);
        }

        for (cache, batch) in self.channels.iter().zip(&per_channel) {
            if !batch.is_empty() {
                cache.begin_store_update();
            }
        }
        let mut stored = 0;
        for (cache, batch) in self.channels.iter_mut().zip(per_channel) {
            if !batch.is_empty() {
                stored += cache.store_entities(batch)?;
            }
        }
        Ok(stored)
    }

    /// Run incremental GC steps on all channels in turn until every channel
    /// is complete or `deadline` passes. Returns whether GC completed.
    pub fn collect(&mut self, deadline: Instant) -> StorageResult<bool> {
        loop {
            let mut complete = true;
            for cache in &mut self.channels {
                complete &= cache.incremental_garbage_collection(deadline)?;
            }
            if complete {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }

    /// Run one live check pass on every channel
    pub fn live_check(&mut self, deadline: Instant) -> bool {
        self.channels.iter_mut().fold(true, |complete, cache| {
            cache.incremental_live_check(deadline) && complete
        })
    }

    /// Total cached bytes of all channels
    pub fn used_cache_size(&self) -> u64 {
        self.channels.iter().map(EntityCache::used_cache_size).sum()
    }

    /// Total registered entities of all channels
    pub fn entity_count(&self) -> usize {
        self.channels.iter().map(EntityCache::entity_count).sum()
    }
}

impl std::fmt::Debug for StorageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCollector")
            .field("config", &self.config)
            .field("channels", &self.channels)
            .finish()
    }
}

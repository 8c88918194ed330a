//! # Otter Storage GC
//!
//! Garbage collector and live-object cache of the persistent object store.
//!
//! ## Design
//!
//! - **Channels**: stored objects are sharded by id over a power-of-two number
//!   of channels; each channel owns an [`EntityCache`] and is driven by one
//!   thread
//! - **Entity cache**: per-channel id and type indexes, cached entity data,
//!   incremental marking, sweeping and cache eviction ("live check")
//! - **Mark monitor**: one shared [`MarkMonitor`] turns the channel GCs into a
//!   single incremental tri-color mark/sweep collector
//! - **Collaborators**: file I/O, type schemas, root definitions and eviction
//!   policy are injected through the traits in [`handler`]

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cache;
pub mod collector;
pub mod config;
pub mod entity;
pub mod entity_type;
pub mod error;
pub mod handler;
pub mod monitor;
pub mod object;
pub mod reference_marker;

mod file_chain;
mod index;
mod mark_queue;

#[cfg(test)]
mod test_support;

pub use cache::{EntityCache, StoredEntity};
pub use collector::StorageCollector;
pub use config::StorageGcConfig;
pub use entity::{Entity, EntityIdx, StorageLocation};
pub use entity_type::EntityType;
pub use error::{StorageError, StorageResult};
pub use handler::{
    CacheEvaluator, DefaultCacheEvaluator, EntityStorage, HighestRootIdSelector,
    LoggingZombieIdHandler, RootSelector, TypeDictionary, TypeHandler, ZombieIdHandler,
};
pub use monitor::{GcStats, MarkMonitor, WaitOutcome};
pub use object::{FileId, MarkColor, ObjectId, TypeId};
pub use reference_marker::{CachingReferenceMarker, ReferenceMarker};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in milliseconds since the UNIX epoch
pub(crate) fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

//! Storage GC configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{StorageError, StorageResult};

/// Upper bound for the channel count
pub const MAX_CHANNEL_COUNT: usize = 1024;

/// Configuration shared by the mark monitor and all channel caches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageGcConfig {
    /// Number of channels, a power of two (default: 1)
    pub channel_count: usize,
    /// Ids pulled from a mark queue per batch (default: 10000)
    pub mark_buffer_length: usize,
    /// Per-destination buffer of the reference marker, 0 disables buffering (default: 100)
    pub reference_cache_length: usize,
    /// Bounded wait on the own mark queue during blocking GC (default: 10ms)
    #[serde(with = "duration_millis")]
    pub marking_wait_time: Duration,
    /// Object id table size cap, a power of two (default: 2^30)
    pub max_oid_table_length: usize,
    /// Age after which cached data is evicted (default: 1 day)
    #[serde(with = "duration_millis")]
    pub cache_timeout: Duration,
    /// Cache size threshold in bytes (default: 1GB)
    pub cache_threshold: u64,
}

impl Default for StorageGcConfig {
    fn default() -> Self {
        Self {
            channel_count: 1,
            mark_buffer_length: 10_000,
            reference_cache_length: 100,
            marking_wait_time: Duration::from_millis(10),
            max_oid_table_length: 1 << 30,
            cache_timeout: Duration::from_millis(86_400_000),
            cache_threshold: 1_000_000_000,
        }
    }
}

impl StorageGcConfig {
    /// Create a default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the channel count
    pub fn channel_count(mut self, count: usize) -> Self {
        self.channel_count = count;
        self
    }

    /// Set the mark batch length
    pub fn mark_buffer_length(mut self, length: usize) -> Self {
        self.mark_buffer_length = length;
        self
    }

    /// Set the reference marker buffer length
    pub fn reference_cache_length(mut self, length: usize) -> Self {
        self.reference_cache_length = length;
        self
    }

    /// Set the blocking GC wait time
    pub fn marking_wait_time(mut self, wait: Duration) -> Self {
        self.marking_wait_time = wait;
        self
    }

    /// Set the object id table cap
    pub fn max_oid_table_length(mut self, length: usize) -> Self {
        self.max_oid_table_length = length;
        self
    }

    /// Set the cache timeout
    pub fn cache_timeout(mut self, timeout: Duration) -> Self {
        self.cache_timeout = timeout;
        self
    }

    /// Set the cache threshold
    pub fn cache_threshold(mut self, threshold: u64) -> Self {
        self.cache_threshold = threshold;
        self
    }

    /// Check all values
    pub fn validate(&self) -> StorageResult<()> {
        if !self.channel_count.is_power_of_two() || self.channel_count > MAX_CHANNEL_COUNT {
            return Err(StorageError::invalid_config(format!(
                "channel count must be a power of two in 1..={MAX_CHANNEL_COUNT}, got {}",
                self.channel_count
            )));
        }
        if self.mark_buffer_length == 0 {
            return Err(StorageError::invalid_config("mark buffer length must be positive"));
        }
        if !self.max_oid_table_length.is_power_of_two() {
            return Err(StorageError::invalid_config(format!(
                "object id table cap must be a power of two, got {}",
                self.max_oid_table_length
            )));
        }
        if self.cache_timeout.as_millis() == 0 {
            return Err(StorageError::invalid_config("cache timeout must be at least 1ms"));
        }
        if self.cache_threshold == 0 {
            return Err(StorageError::invalid_config("cache threshold must be positive"));
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

//! Cache eviction ("live check")
//!
//! Walks the channel's entities in storage file order, resuming where the
//! previous call stopped, and lets the evaluator decide which cached data to
//! drop. Independent of GC coloring.

use std::sync::Arc;
use std::time::Instant;

use super::EntityCache;
use crate::current_time_millis;
use crate::entity::{Entity, EntityIdx};
use crate::handler::CacheEvaluator;

impl EntityCache {
    /// Evict cached data with the configured evaluator until `deadline`.
    ///
    /// Returns `true` if a full pass finished or nothing is cached anymore.
    pub fn incremental_live_check(&mut self, deadline: Instant) -> bool {
        let evaluator = Arc::clone(&self.evaluator);
        self.live_check(deadline, evaluator.as_ref())
    }

    /// Live check with an optional one-off evaluator
    pub fn issued_cache_check(
        &mut self,
        deadline: Instant,
        evaluator: Option<&dyn CacheEvaluator>,
    ) -> bool {
        match evaluator {
            Some(evaluator) => self.live_check(deadline, evaluator),
            None => self.incremental_live_check(deadline),
        }
    }

    /// Drop all cached data. Returns the released byte count.
    pub fn clear_cache(&mut self) -> u64 {
        let released: u64 = self.index.iter_mut().map(Entity::clear_cache).sum();
        debug_assert_eq!(released, self.used_cache_size);
        self.used_cache_size = 0;
        self.live_check_cursor = None;
        tracing::debug!(
            target: "otter::storage::cache",
            channel = self.channel,
            released,
            "cache cleared"
        );
        released
    }

    fn live_check_start(&self) -> Option<EntityIdx> {
        match self.live_check_cursor {
            Some(idx)
                if self
                    .index
                    .get(idx)
                    .is_some_and(|entity| entity.location().is_some()) =>
            {
                Some(idx)
            }
            _ => self.files.first(),
        }
    }

    fn live_check(&mut self, deadline: Instant, evaluator: &dyn CacheEvaluator) -> bool {
        if self.used_cache_size == 0 {
            self.live_check_cursor = None;
            return true;
        }
        let Some(start) = self.live_check_start() else {
            self.live_check_cursor = None;
            return true;
        };

        let eval_time = current_time_millis();
        let mut cursor = start;
        let mut evicted = 0usize;
        loop {
            if self.check_for_cache_clear(cursor, eval_time, evaluator) {
                evicted += 1;
            }
            if self.used_cache_size == 0 {
                self.live_check_cursor = None;
                break;
            }

            let Some(next) = self.files.next(&self.index, cursor) else {
                self.live_check_cursor = None;
                break;
            };
            if next == start {
                self.live_check_cursor = Some(start);
                break;
            }
            if Instant::now() >= deadline {
                self.live_check_cursor = Some(next);
                tracing::trace!(
                    target: "otter::storage::cache",
                    channel = self.channel,
                    evicted,
                    "live check interrupted"
                );
                return false;
            }
            cursor = next;
        }

        tracing::trace!(
            target: "otter::storage::cache",
            channel = self.channel,
            evicted,
            used_cache_size = self.used_cache_size,
            "live check pass complete"
        );
        true
    }
}

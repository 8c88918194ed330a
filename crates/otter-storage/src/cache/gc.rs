//! Incremental marking, sweeping and the GC driver entry points

use std::sync::Arc;
use std::time::Instant;

use super::EntityCache;
use crate::current_time_millis;
use crate::entity::EntityIdx;
use crate::error::{StorageError, StorageResult};
use crate::monitor::WaitOutcome;
use crate::object::{MarkColor, ObjectId};

impl EntityCache {
    /// Color a freshly stored entity for the running GC cycle.
    ///
    /// With a sweep pending on this channel its marking is over for this
    /// cycle, so the entity goes black without scanning its references.
    pub(super) fn mark_entity_for_changed_data(&mut self, idx: EntityIdx, pending_sweep: bool) {
        let Some(entity) = self.index.get_mut(idx) else {
            return;
        };
        if pending_sweep || !entity.has_references() {
            entity.set_color(MarkColor::Black);
            return;
        }
        entity.set_color(MarkColor::Gray);
        self.monitor.enqueue(entity.object_id());
    }

    /// Work through this channel's mark queue until it is empty or `deadline` passes.
    ///
    /// Processes at least one id. Returns `true` if the queue ran dry, which
    /// does not mean marking is globally complete.
    pub fn incremental_mark(&mut self, deadline: Instant) -> StorageResult<bool> {
        let mut buffer = std::mem::take(&mut self.mark_buffer);
        let result = self.mark_batches(&mut buffer, deadline);
        buffer.clear();
        self.mark_buffer = buffer;
        result
    }

    fn mark_batches(
        &mut self,
        buffer: &mut Vec<ObjectId>,
        deadline: Instant,
    ) -> StorageResult<bool> {
        let eval_time = current_time_millis();
        loop {
            buffer.clear();
            if self
                .monitor
                .next_batch(self.channel, buffer, self.mark_buffer_length)
                == 0
            {
                return Ok(true);
            }

            let mut processed = 0;
            let mut timed_out = false;
            for &object_id in buffer.iter() {
                if let Err(err) = self.mark_object(object_id, eval_time) {
                    self.reference_marker.flush();
                    self.monitor.advance_marking(self.channel, processed)?;
                    tracing::error!(
                        target: "otter::storage::gc",
                        channel = self.channel,
                        object_id = object_id.raw(),
                        error = %err,
                        "marking failed"
                    );
                    return Err(err);
                }
                processed += 1;
                if Instant::now() >= deadline {
                    timed_out = true;
                    break;
                }
            }

            // Buffered references must be enqueued before the batch stops
            // counting as pending.
            self.reference_marker.flush();
            self.monitor.advance_marking(self.channel, processed)?;
            tracing::trace!(
                target: "otter::storage::gc",
                channel = self.channel,
                processed,
                "mark batch done"
            );
            if timed_out {
                return Ok(false);
            }
        }
    }

    fn mark_object(&mut self, object_id: ObjectId, eval_time_ms: u64) -> StorageResult<()> {
        let Some(idx) = self.index.lookup(object_id) else {
            if !self.zombie_handler.handle_zombie_id(self.channel, object_id) {
                tracing::warn!(
                    target: "otter::storage::gc",
                    channel = self.channel,
                    object_id = object_id.raw(),
                    "marking encountered unhandled zombie object id"
                );
            }
            return Ok(());
        };

        let (type_slot, has_references) = match self.index.get(idx) {
            Some(entity) if entity.color() != MarkColor::Black => {
                (entity.type_slot(), entity.has_references())
            }
            _ => return Ok(()),
        };
        if has_references {
            self.scan_references(idx, type_slot, eval_time_ms)?;
        }
        if let Some(entity) = self.index.get_mut(idx) {
            entity.set_color(MarkColor::Black);
        }
        Ok(())
    }

    fn scan_references(
        &mut self,
        idx: EntityIdx,
        type_slot: u32,
        eval_time_ms: u64,
    ) -> StorageResult<()> {
        let handler = Arc::clone(self.types[type_slot as usize].handler());
        self.ensure_cached(idx, eval_time_ms)?;
        if let Some(data) = self.index.get(idx).and_then(|entity| entity.cached_data()) {
            handler.iterate_references(data, &mut self.reference_marker)?;
        }

        let evaluator = Arc::clone(&self.evaluator);
        self.check_for_cache_clear(idx, eval_time_ms, evaluator.as_ref());
        Ok(())
    }

    fn ensure_cached(&mut self, idx: EntityIdx, now_ms: u64) -> StorageResult<()> {
        let Some(entity) = self.index.get_mut(idx) else {
            return Ok(());
        };
        if entity.is_live() {
            return Ok(());
        }
        let object_id = entity.object_id();
        let location = entity
            .location()
            .ok_or(StorageError::MissingLocation(object_id))?;

        let data = self.storage.load(object_id, &location)?;
        entity.put_cached_data(data, now_ms);
        self.used_cache_size += entity.cached_len();
        Ok(())
    }

    /// Sweep this channel and report completion to the monitor.
    ///
    /// Must only run after the monitor flagged this channel for sweeping.
    pub(crate) fn sweep(&mut self) -> usize {
        let mut removed = 0;
        let mut released = 0;
        for slot in 0..self.types.len() {
            let mut cursor = self.types[slot].head();
            while let Some(idx) = cursor {
                let Some(entity) = self.index.get_mut(idx) else {
                    break;
                };
                cursor = entity.type_next;
                if entity.color() != MarkColor::White {
                    entity.set_color(MarkColor::White);
                    continue;
                }

                released += entity.cached_len();
                self.remove_entity(idx, slot);
                removed += 1;
            }
        }

        self.storage.reset_file_cleanup_cursor(self.channel);
        let root = self.query_root_object_id();
        tracing::debug!(
            target: "otter::storage::gc",
            channel = self.channel,
            removed,
            released_bytes = released,
            remaining = self.index.len(),
            root = root.map(ObjectId::raw),
            "sweep complete"
        );
        self.monitor.complete_sweep(self.channel, root);
        removed
    }

    fn remove_entity(&mut self, idx: EntityIdx, type_slot: usize) {
        self.files.detach(&mut self.index, idx);
        self.types[type_slot].unlink(&mut self.index, idx);
        if let Some(entity) = self.index.remove(idx) {
            self.used_cache_size -= entity.cached_len();
        }
    }

    /// One budgeted GC step: consolidate when complete, sweep when due, mark otherwise.
    ///
    /// A sweep that completes the GC ends the step without marking, so the
    /// re-enqueued root stays white until a store reopens the GC.
    /// Returns `true` once the GC is complete for this channel.
    pub fn incremental_garbage_collection(&mut self, deadline: Instant) -> StorageResult<bool> {
        if self.monitor.is_complete(self.channel) {
            self.index.consolidate();
            return Ok(true);
        }

        if self.monitor.needs_sweep(self.channel)? {
            self.sweep();
            if self.monitor.is_complete(self.channel) {
                self.index.consolidate();
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }

        self.incremental_mark(deadline)?;
        Ok(self.monitor.is_complete(self.channel))
    }

    /// Run GC until it is complete for this channel, `deadline` passes or a
    /// stop is requested through the monitor.
    ///
    /// Waits on the own mark queue while other channels still have work.
    /// Returns whether the GC is complete for this channel.
    pub fn issued_garbage_collection(&mut self, deadline: Instant) -> StorageResult<bool> {
        loop {
            if self.incremental_garbage_collection(deadline)? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }

            let wait = self.marking_wait_time.min(deadline - now);
            if self.monitor.wait_for_work(self.channel, wait) == WaitOutcome::Stopped {
                tracing::debug!(
                    target: "otter::storage::gc",
                    channel = self.channel,
                    "garbage collection stopped"
                );
                return Ok(self.monitor.is_complete(self.channel));
            }
        }
    }
}

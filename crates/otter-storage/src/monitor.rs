//! Cross-channel mark monitor
//!
//! Turns the single-threaded GCs of all channels into one incremental
//! tri-color collector.
//!
//! ## Design
//!
//! - **One lock**: every piece of shared GC state (pending mark count, mark
//!   queues, store flags, sweep flags, root ids, completion) sits behind one
//!   `parking_lot::Mutex`; every operation is a short critical section
//! - **Mark accounting**: `pending_marks` always equals the summed length of
//!   all mark queues; batches are consumed only through `advance_marking`
//! - **Sweep issue**: the first channel to ask `needs_sweep` after marking
//!   became globally complete flags every channel for exactly one sweep
//! - **Root re-seeding**: when the last channel finished sweeping, the highest
//!   reported root id is enqueued and starts the next mark cycle
//! - **Hot/cold completion**: one finished sweep cycle without a store in
//!   between makes the GC hot-complete, a second one cold-complete
//! - **Signals**: each channel waits on its own condvar; enqueues wake the
//!   target channel, phase changes wake everyone

use std::time::Duration;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::config::MAX_CHANNEL_COUNT;
use crate::current_time_millis;
use crate::error::{StorageError, StorageResult};
use crate::mark_queue::ObjectIdMarkQueue;
use crate::object::{ObjectId, channel_mask};

/// Result of [`MarkMonitor::wait_for_work`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Work may be available, or GC state changed
    Ready,
    /// Nothing happened within the wait time
    TimedOut,
    /// The channel was asked to stop participating
    Stopped,
}

/// Snapshot of the monitor state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Enqueued but unprocessed marks
    pub pending_marks: usize,
    /// Channels with a store in flight
    pub pending_store_updates: usize,
    /// Channels that still have to sweep in the current sweep phase
    pub sweeping_channels: usize,
    /// Finished sweep phases
    pub sweep_generation: u64,
    /// Transitions to hot completion
    pub hot_generation: u64,
    /// Transitions to cold completion
    pub cold_generation: u64,
    /// Hot completion flag
    pub hot_phase_complete: bool,
    /// Cold completion flag
    pub cold_phase_complete: bool,
    /// Start of the last sweep phase (ms since epoch, 0 = never)
    pub last_sweep_start_ms: u64,
    /// End of the last sweep phase (ms since epoch, 0 = never)
    pub last_sweep_end_ms: u64,
    /// Last hot completion (ms since epoch, 0 = never)
    pub last_hot_completion_ms: u64,
    /// Last cold completion (ms since epoch, 0 = never)
    pub last_cold_completion_ms: u64,
}

struct MonitorState {
    pending_marks: usize,
    queues: Vec<ObjectIdMarkQueue>,
    pending_store_updates: Vec<bool>,
    pending_store_update_count: usize,
    needs_sweep: Vec<bool>,
    sweeping_channel_count: usize,
    channel_root_ids: Vec<Option<ObjectId>>,
    hot_phase_complete: bool,
    cold_phase_complete: bool,
    stop_requested: Vec<bool>,
    sweep_generation: u64,
    hot_generation: u64,
    cold_generation: u64,
    last_sweep_start_ms: u64,
    last_sweep_end_ms: u64,
    last_hot_completion_ms: u64,
    last_cold_completion_ms: u64,
}

impl MonitorState {
    fn new(channel_count: usize) -> Self {
        Self {
            pending_marks: 0,
            queues: (0..channel_count).map(|_| ObjectIdMarkQueue::new()).collect(),
            pending_store_updates: vec![false; channel_count],
            pending_store_update_count: 0,
            needs_sweep: vec![false; channel_count],
            sweeping_channel_count: 0,
            channel_root_ids: vec![None; channel_count],
            // An empty database has nothing to collect
            hot_phase_complete: true,
            cold_phase_complete: true,
            stop_requested: vec![false; channel_count],
            sweep_generation: 0,
            hot_generation: 0,
            cold_generation: 0,
            last_sweep_start_ms: 0,
            last_sweep_end_ms: 0,
            last_hot_completion_ms: 0,
            last_cold_completion_ms: 0,
        }
    }

    #[inline]
    fn is_marking_complete(&self) -> bool {
        self.pending_marks == 0 && self.pending_store_update_count == 0
    }

    #[inline]
    fn is_complete(&self, channel: usize) -> bool {
        self.cold_phase_complete
            || (self.hot_phase_complete
                && self.sweeping_channel_count > 0
                && !self.needs_sweep[channel])
    }

    fn has_work(&self, channel: usize) -> bool {
        !self.queues[channel].is_empty()
            || self.needs_sweep[channel]
            || (self.sweeping_channel_count == 0 && self.is_marking_complete())
            || self.is_complete(channel)
    }

    fn enqueue(&mut self, channel_mask: u64, object_id: ObjectId) -> usize {
        let channel = object_id.channel(channel_mask);
        self.pending_marks += 1;
        self.queues[channel].push(object_id);
        channel
    }

    fn try_issue_sweep(&mut self) -> StorageResult<bool> {
        if self.sweeping_channel_count != 0 || !self.is_marking_complete() {
            return Ok(false);
        }
        if let Some((channel, queue)) = self
            .queues
            .iter()
            .enumerate()
            .find(|(_, queue)| !queue.is_empty())
        {
            return Err(StorageError::MarkQueueNotEmpty {
                channel,
                length: queue.len(),
            });
        }

        self.queues.iter_mut().for_each(ObjectIdMarkQueue::reset);
        self.channel_root_ids.fill(None);
        self.needs_sweep.fill(true);
        self.sweeping_channel_count = self.needs_sweep.len();
        self.last_sweep_start_ms = current_time_millis();
        Ok(true)
    }

    fn advance_completion(&mut self, now_ms: u64) {
        if self.cold_phase_complete {
            tracing::debug!(target: "otter::storage::gc", "sweep cycle finished, GC already cold");
        } else if self.hot_phase_complete {
            self.cold_phase_complete = true;
            self.cold_generation += 1;
            self.last_cold_completion_ms = now_ms;
            tracing::debug!(
                target: "otter::storage::gc",
                generation = self.cold_generation,
                "GC cold complete"
            );
        } else {
            self.hot_phase_complete = true;
            self.hot_generation += 1;
            self.last_hot_completion_ms = now_ms;
            tracing::debug!(
                target: "otter::storage::gc",
                generation = self.hot_generation,
                "GC hot complete"
            );
        }
    }

    fn take_stop(&mut self, channel: usize) -> bool {
        std::mem::take(&mut self.stop_requested[channel])
    }
}

/// Shared GC coordinator for all channels of one storage instance
pub struct MarkMonitor {
    channel_mask: u64,
    state: Mutex<MonitorState>,
    signals: Box<[CachePadded<Condvar>]>,
}

impl MarkMonitor {
    /// Create a monitor for `channel_count` channels (a power of two)
    pub fn new(channel_count: usize) -> StorageResult<Self> {
        if !channel_count.is_power_of_two() || channel_count > MAX_CHANNEL_COUNT {
            return Err(StorageError::invalid_config(format!(
                "channel count must be a power of two in 1..={MAX_CHANNEL_COUNT}, got {channel_count}"
            )));
        }
        Ok(Self {
            channel_mask: channel_mask(channel_count),
            state: Mutex::new(MonitorState::new(channel_count)),
            signals: (0..channel_count)
                .map(|_| CachePadded::new(Condvar::new()))
                .collect(),
        })
    }

    /// Number of channels
    pub fn channel_count(&self) -> usize {
        self.signals.len()
    }

    /// Channel owning `object_id`
    #[inline]
    pub fn channel_of(&self, object_id: ObjectId) -> usize {
        object_id.channel(self.channel_mask)
    }

    fn notify_all(&self) {
        for signal in self.signals.iter() {
            signal.notify_all();
        }
    }

    /// Enqueue one id for marking on its owning channel
    pub fn enqueue(&self, object_id: ObjectId) {
        let channel = self.state.lock().enqueue(self.channel_mask, object_id);
        self.signals[channel].notify_one();
    }

    /// Move buffered ids into the mark queues under one lock.
    ///
    /// `batches[c]` must only hold ids of channel `c`; all batches are drained.
    pub fn enqueue_all(&self, batches: &mut [Vec<ObjectId>]) {
        let mut state = self.state.lock();
        for (channel, batch) in batches.iter_mut().enumerate() {
            if batch.is_empty() {
                continue;
            }
            debug_assert!(batch.iter().all(|id| self.channel_of(*id) == channel));
            state.pending_marks += batch.len();
            state.queues[channel].extend(batch.drain(..));
            self.signals[channel].notify_one();
        }
    }

    /// Copy up to `max` ids of the channel's queue into `buffer`.
    ///
    /// The ids stay pending until [`advance_marking`](Self::advance_marking).
    pub fn next_batch(&self, channel: usize, buffer: &mut Vec<ObjectId>, max: usize) -> usize {
        self.state.lock().queues[channel].next_batch(buffer, max)
    }

    /// Consume `amount` processed ids from the channel's queue
    pub fn advance_marking(&self, channel: usize, amount: usize) -> StorageResult<()> {
        if amount == 0 {
            return Ok(());
        }
        let mut state = self.state.lock();
        if amount > state.pending_marks || amount > state.queues[channel].len() {
            return Err(StorageError::MarkCountUnderflow {
                amount,
                pending: state.pending_marks,
            });
        }
        state.pending_marks -= amount;
        state.queues[channel].advance(amount);

        if state.pending_marks == 0 {
            drop(state);
            self.notify_all();
        }
        Ok(())
    }

    /// Enqueued but unprocessed marks of all channels
    pub fn pending_marks(&self) -> usize {
        self.state.lock().pending_marks
    }

    /// Unprocessed marks of one channel
    pub fn queue_len(&self, channel: usize) -> usize {
        self.state.lock().queues[channel].len()
    }

    /// Flag a store in flight on `channel`
    pub fn signal_pending_store_update(&self, channel: usize) {
        let mut state = self.state.lock();
        if !state.pending_store_updates[channel] {
            state.pending_store_updates[channel] = true;
            state.pending_store_update_count += 1;
        }
    }

    /// Clear the store flag of `channel`
    pub fn clear_pending_store_update(&self, channel: usize) {
        let mut state = self.state.lock();
        if !state.pending_store_updates[channel] {
            return;
        }
        state.pending_store_updates[channel] = false;
        state.pending_store_update_count -= 1;

        if state.pending_store_update_count == 0 {
            drop(state);
            self.notify_all();
        }
    }

    /// Whether `channel` was flagged for a sweep it has not completed yet
    pub fn is_pending_sweep(&self, channel: usize) -> bool {
        self.state.lock().needs_sweep[channel]
    }

    /// No pending marks and no store in flight
    pub fn is_marking_complete(&self) -> bool {
        self.state.lock().is_marking_complete()
    }

    /// Whether `channel` must sweep now.
    ///
    /// Issues a sweep for all channels if marking is globally complete and no
    /// sweep phase is running.
    pub fn needs_sweep(&self, channel: usize) -> StorageResult<bool> {
        let mut state = self.state.lock();
        if state.needs_sweep[channel] {
            return Ok(true);
        }
        if !state.try_issue_sweep()? {
            return Ok(false);
        }

        tracing::debug!(
            target: "otter::storage::gc",
            channel,
            generation = state.sweep_generation + 1,
            "marking complete, sweep issued"
        );
        drop(state);
        self.notify_all();
        Ok(true)
    }

    /// Report that `channel` swept, proposing its locally selected root
    pub fn complete_sweep(&self, channel: usize, root_id: Option<ObjectId>) {
        let mut state = self.state.lock();
        if !state.needs_sweep[channel] {
            tracing::warn!(
                target: "otter::storage::gc",
                channel,
                "sweep completion without a pending sweep"
            );
            return;
        }
        state.channel_root_ids[channel] = root_id;
        state.needs_sweep[channel] = false;
        state.sweeping_channel_count -= 1;
        if state.sweeping_channel_count > 0 {
            return;
        }

        let now = current_time_millis();
        state.sweep_generation += 1;
        state.last_sweep_end_ms = now;
        state.advance_completion(now);

        let root = state.channel_root_ids.iter().flatten().max().copied();
        match root {
            Some(root) => {
                state.enqueue(self.channel_mask, root);
            }
            None => tracing::debug!(target: "otter::storage::gc", "no root found in any channel"),
        }
        drop(state);
        self.notify_all();
    }

    /// Whether the GC has nothing left to do for `channel`
    pub fn is_complete(&self, channel: usize) -> bool {
        self.state.lock().is_complete(channel)
    }

    /// Reopen GC after new data was stored
    pub fn reset_completion(&self) {
        let mut state = self.state.lock();
        state.hot_phase_complete = false;
        state.cold_phase_complete = false;
    }

    /// Reinitialize everything to the idle, complete state
    pub fn reset(&self) {
        let channel_count = self.channel_count();
        *self.state.lock() = MonitorState::new(channel_count);
        self.notify_all();
    }

    /// Root proposed by `channel` in the current or last sweep phase
    pub fn channel_root_id(&self, channel: usize) -> Option<ObjectId> {
        self.state.lock().channel_root_ids[channel]
    }

    /// Ask `channel` to leave a blocking GC wait. Consumed by the next wait.
    pub fn request_stop(&self, channel: usize) {
        self.state.lock().stop_requested[channel] = true;
        self.signals[channel].notify_all();
    }

    /// Wait up to `timeout` for mark work or a GC state change on `channel`.
    ///
    /// Returns immediately if work is already there. Wakeups can be spurious;
    /// callers re-check the GC state either way.
    pub fn wait_for_work(&self, channel: usize, timeout: Duration) -> WaitOutcome {
        let mut state = self.state.lock();
        if state.take_stop(channel) {
            return WaitOutcome::Stopped;
        }
        if state.has_work(channel) {
            return WaitOutcome::Ready;
        }

        let timed_out = self.signals[channel]
            .wait_for(&mut state, timeout)
            .timed_out();
        if state.take_stop(channel) {
            WaitOutcome::Stopped
        } else if timed_out && !state.has_work(channel) {
            WaitOutcome::TimedOut
        } else {
            WaitOutcome::Ready
        }
    }

    /// Current statistics
    pub fn stats(&self) -> GcStats {
        let state = self.state.lock();
        GcStats {
            pending_marks: state.pending_marks,
            pending_store_updates: state.pending_store_update_count,
            sweeping_channels: state.sweeping_channel_count,
            sweep_generation: state.sweep_generation,
            hot_generation: state.hot_generation,
            cold_generation: state.cold_generation,
            hot_phase_complete: state.hot_phase_complete,
            cold_phase_complete: state.cold_phase_complete,
            last_sweep_start_ms: state.last_sweep_start_ms,
            last_sweep_end_ms: state.last_sweep_end_ms,
            last_hot_completion_ms: state.last_hot_completion_ms,
            last_cold_completion_ms: state.last_cold_completion_ms,
        }
    }
}

impl std::fmt::Debug for MarkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkMonitor")
            .field("channel_count", &self.channel_count())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn id(raw: u64) -> ObjectId {
        ObjectId::new(raw)
    }

    /// Run one full sweep phase with the given per-channel roots
    fn sweep_all(monitor: &MarkMonitor, roots: &[Option<ObjectId>]) {
        for (channel, root) in roots.iter().enumerate() {
            assert!(monitor.needs_sweep(channel).unwrap());
            monitor.complete_sweep(channel, *root);
        }
    }

    #[test]
    fn test_starts_complete() {
        let monitor = MarkMonitor::new(2).unwrap();
        assert!(monitor.is_complete(0));
        assert!(monitor.is_complete(1));
        assert!(monitor.is_marking_complete());
        assert!(MarkMonitor::new(3).is_err());
    }

    #[test]
    fn test_mark_accounting() {
        let monitor = MarkMonitor::new(2).unwrap();
        monitor.enqueue(id(10));
        monitor.enqueue(id(11));
        monitor.enqueue(id(12));
        assert_eq!(monitor.pending_marks(), 3);
        assert_eq!(monitor.queue_len(0), 2);
        assert_eq!(monitor.queue_len(1), 1);

        let mut buffer = Vec::new();
        assert_eq!(monitor.next_batch(0, &mut buffer, 10), 2);
        assert_eq!(monitor.pending_marks(), 3);

        monitor.advance_marking(0, 2).unwrap();
        assert_eq!(monitor.pending_marks(), 1);
        assert_eq!(monitor.queue_len(0), 0);

        let err = monitor.advance_marking(1, 2).unwrap_err();
        assert!(matches!(
            err,
            StorageError::MarkCountUnderflow {
                amount: 2,
                pending: 1
            }
        ));
        assert_eq!(monitor.pending_marks(), 1);
    }

    #[test]
    fn test_enqueue_all_drains_batches() {
        let monitor = MarkMonitor::new(2).unwrap();
        let mut batches = vec![vec![id(2), id(4)], vec![id(3)]];
        monitor.enqueue_all(&mut batches);
        assert!(batches.iter().all(Vec::is_empty));
        assert_eq!(monitor.pending_marks(), 3);
        assert_eq!(monitor.queue_len(0), 2);
    }

    #[test]
    fn test_sweep_issued_once_per_cycle() {
        let monitor = MarkMonitor::new(2).unwrap();
        monitor.reset_completion();

        assert!(monitor.needs_sweep(0).unwrap());
        assert!(monitor.is_pending_sweep(1));
        // still pending for channel 0 until it completes
        assert!(monitor.needs_sweep(0).unwrap());
        monitor.complete_sweep(0, None);
        assert!(!monitor.needs_sweep(0).unwrap());
        assert!(monitor.needs_sweep(1).unwrap());
        monitor.complete_sweep(1, None);

        let stats = monitor.stats();
        assert_eq!(stats.sweep_generation, 1);
        assert!(stats.hot_phase_complete);
        assert!(!stats.cold_phase_complete);
    }

    #[test]
    fn test_sweep_blocked_by_pending_work() {
        let monitor = MarkMonitor::new(1).unwrap();
        monitor.reset_completion();
        monitor.signal_pending_store_update(0);
        monitor.signal_pending_store_update(0);
        assert!(!monitor.needs_sweep(0).unwrap());
        monitor.clear_pending_store_update(0);
        assert!(monitor.is_marking_complete());

        monitor.enqueue(id(5));
        assert!(!monitor.needs_sweep(0).unwrap());
        monitor.advance_marking(0, 1).unwrap();
        assert!(monitor.needs_sweep(0).unwrap());
    }

    #[test]
    fn test_hot_then_cold_completion() {
        let monitor = MarkMonitor::new(2).unwrap();
        monitor.reset_completion();
        assert!(!monitor.is_complete(0));

        sweep_all(&monitor, &[None, None]);
        assert!(!monitor.is_complete(0));

        // hot: a channel that swept is done while others still drain
        assert!(monitor.needs_sweep(0).unwrap());
        monitor.complete_sweep(0, None);
        assert!(monitor.is_complete(0));
        assert!(!monitor.is_complete(1));
        monitor.complete_sweep(1, None);
        assert!(monitor.is_complete(1));

        let stats = monitor.stats();
        assert_eq!(stats.hot_generation, 1);
        assert_eq!(stats.cold_generation, 1);
        assert!(stats.last_cold_completion_ms >= stats.last_hot_completion_ms);

        monitor.reset_completion();
        assert!(!monitor.is_complete(0));
    }

    #[test]
    fn test_root_consensus_enqueues_highest() {
        let monitor = MarkMonitor::new(4).unwrap();
        monitor.reset_completion();
        sweep_all(&monitor, &[Some(id(8)), None, Some(id(22)), None]);
        assert_eq!(monitor.pending_marks(), 1);
        assert_eq!(monitor.queue_len(2), 1);
        assert_eq!(monitor.channel_root_id(0), Some(id(8)));
        assert_eq!(monitor.channel_root_id(2), Some(id(22)));
    }

    #[test]
    fn test_missing_root_is_not_an_error() {
        let monitor = MarkMonitor::new(1).unwrap();
        monitor.reset_completion();
        sweep_all(&monitor, &[None]);
        assert_eq!(monitor.pending_marks(), 0);
        assert!(monitor.needs_sweep(0).unwrap());
    }

    #[test]
    fn test_reset() {
        let monitor = MarkMonitor::new(1).unwrap();
        monitor.reset_completion();
        monitor.enqueue(id(1));
        monitor.signal_pending_store_update(0);
        monitor.reset();
        assert_eq!(monitor.stats(), GcStats {
            hot_phase_complete: true,
            cold_phase_complete: true,
            ..GcStats::default()
        });
    }

    #[test]
    fn test_wait_times_out_without_work() {
        let monitor = MarkMonitor::new(2).unwrap();
        monitor.reset_completion();
        monitor.enqueue(id(1));
        let start = Instant::now();
        assert_eq!(
            monitor.wait_for_work(0, Duration::from_millis(20)),
            WaitOutcome::TimedOut
        );
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert_eq!(
            monitor.wait_for_work(1, Duration::from_millis(20)),
            WaitOutcome::Ready
        );
    }

    #[test]
    fn test_stop_request_wakes_waiter() {
        let monitor = Arc::new(MarkMonitor::new(2).unwrap());
        monitor.reset_completion();
        monitor.enqueue(id(1));

        let waiter = {
            let monitor = Arc::clone(&monitor);
            std::thread::spawn(move || monitor.wait_for_work(0, Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(20));
        monitor.request_stop(0);
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Stopped);

        // consumed
        assert_eq!(
            monitor.wait_for_work(0, Duration::from_millis(1)),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn test_enqueue_wakes_target_channel() {
        let monitor = Arc::new(MarkMonitor::new(2).unwrap());
        monitor.reset_completion();
        monitor.enqueue(id(1));

        let waiter = {
            let monitor = Arc::clone(&monitor);
            std::thread::spawn(move || monitor.wait_for_work(0, Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(20));
        monitor.enqueue(id(2));
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Ready);
    }

    #[test]
    fn test_stats_serialize() {
        let monitor = MarkMonitor::new(1).unwrap();
        let json = serde_json::to_value(monitor.stats()).unwrap();
        assert_eq!(json["cold_phase_complete"], true);
        assert_eq!(json["pending_marks"], 0);
    }
}

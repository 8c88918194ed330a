//! Reference markers
//!
//! Type handlers report the ids found in an entity's data to a
//! [`ReferenceMarker`]. The caching marker collects them per destination
//! channel and moves them into the monitor's queues in bulk.

use std::sync::Arc;

use crate::monitor::MarkMonitor;
use crate::object::ObjectId;

/// Receives object ids referenced by scanned entity data
pub trait ReferenceMarker {
    /// Mark `object_id` as reachable. Null ids are ignored.
    fn mark(&mut self, object_id: ObjectId);
}

/// Reference marker buffering ids per destination channel.
///
/// A destination buffer is flushed when it reaches the configured length;
/// everything left over must be flushed before the scanned batch is reported
/// to the monitor as processed.
pub struct CachingReferenceMarker {
    monitor: Arc<MarkMonitor>,
    buffers: Vec<Vec<ObjectId>>,
    buffer_length: usize,
    buffered: usize,
}

impl CachingReferenceMarker {
    /// Create a marker. A `buffer_length` of 0 enqueues every id directly.
    pub fn new(monitor: Arc<MarkMonitor>, buffer_length: usize) -> Self {
        let buffers = (0..monitor.channel_count())
            .map(|_| Vec::with_capacity(buffer_length))
            .collect();
        Self {
            monitor,
            buffers,
            buffer_length,
            buffered: 0,
        }
    }

    /// Ids buffered but not yet enqueued
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Enqueue all buffered ids
    pub fn flush(&mut self) {
        if self.buffered == 0 {
            return;
        }
        self.monitor.enqueue_all(&mut self.buffers);
        self.buffered = 0;
    }
}

impl ReferenceMarker for CachingReferenceMarker {
    fn mark(&mut self, object_id: ObjectId) {
        if !object_id.is_valid() {
            return;
        }
        if self.buffer_length == 0 {
            self.monitor.enqueue(object_id);
            return;
        }

        let channel = self.monitor.channel_of(object_id);
        self.buffers[channel].push(object_id);
        self.buffered += 1;
        if self.buffers[channel].len() >= self.buffer_length {
            self.flush();
        }
    }
}

impl Drop for CachingReferenceMarker {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_until_full() {
        let monitor = Arc::new(MarkMonitor::new(2).unwrap());
        let mut marker = CachingReferenceMarker::new(Arc::clone(&monitor), 3);

        marker.mark(ObjectId::new(2));
        marker.mark(ObjectId::new(3));
        marker.mark(ObjectId::NULL);
        marker.mark(ObjectId::new(4));
        assert_eq!(marker.buffered(), 3);
        assert_eq!(monitor.pending_marks(), 0);

        // third id for channel 0 fills its buffer and flushes everything
        marker.mark(ObjectId::new(6));
        assert_eq!(marker.buffered(), 0);
        assert_eq!(monitor.pending_marks(), 4);
        assert_eq!(monitor.queue_len(0), 3);
        assert_eq!(monitor.queue_len(1), 1);
    }

    #[test]
    fn test_unbuffered_and_drop_flush() {
        let monitor = Arc::new(MarkMonitor::new(1).unwrap());
        let mut direct = CachingReferenceMarker::new(Arc::clone(&monitor), 0);
        direct.mark(ObjectId::new(1));
        assert_eq!(monitor.pending_marks(), 1);

        {
            let mut buffered = CachingReferenceMarker::new(Arc::clone(&monitor), 100);
            buffered.mark(ObjectId::new(2));
            assert_eq!(monitor.pending_marks(), 1);
        }
        assert_eq!(monitor.pending_marks(), 2);
    }
}

//! Per-channel mark queue
//!
//! Readers copy a batch out with [`ObjectIdMarkQueue::next_batch`] and only
//! consume it with [`ObjectIdMarkQueue::advance`] once the batch is processed,
//! so entries stay counted as pending while they are being worked on.

use std::collections::VecDeque;

use crate::object::ObjectId;

/// FIFO of object ids waiting to be marked
#[derive(Debug, Default)]
pub(crate) struct ObjectIdMarkQueue {
    ids: VecDeque<ObjectId>,
}

impl ObjectIdMarkQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub(crate) fn push(&mut self, object_id: ObjectId) {
        self.ids.push_back(object_id);
    }

    pub(crate) fn extend(&mut self, ids: impl IntoIterator<Item = ObjectId>) {
        self.ids.extend(ids);
    }

    /// Copy up to `max` ids from the head into `buffer` without consuming them
    pub(crate) fn next_batch(&self, buffer: &mut Vec<ObjectId>, max: usize) -> usize {
        let count = self.ids.len().min(max);
        buffer.extend(self.ids.iter().take(count).copied());
        count
    }

    /// Consume `amount` processed ids from the head
    pub(crate) fn advance(&mut self, amount: usize) {
        self.ids.drain(..amount.min(self.ids.len()));
    }

    /// Drop all entries and release the backing memory
    pub(crate) fn reset(&mut self) {
        self.ids = VecDeque::new();
    }
}

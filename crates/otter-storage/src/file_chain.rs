//! Entities chained in storage file order
//!
//! The live check walks entities file by file so eviction follows on-disk
//! locality. Within a file, entities are kept in the order they were written.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::entity::{EntityIdx, StorageLocation};
use crate::index::EntityIndex;
use crate::object::FileId;

#[derive(Debug, Default, Clone, Copy)]
struct FileChain {
    head: Option<EntityIdx>,
    tail: Option<EntityIdx>,
    len: usize,
}

/// Per-file intrusive entity chains of one channel
#[derive(Debug, Default)]
pub(crate) struct FileChains {
    files: BTreeMap<FileId, FileChain>,
}

impl FileChains {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Set the entity's location and append it to that file's chain.
    ///
    /// The entity must not be attached to any file.
    pub(crate) fn attach(
        &mut self,
        index: &mut EntityIndex,
        idx: EntityIdx,
        location: StorageLocation,
    ) {
        let chain = self.files.entry(location.file).or_default();
        let tail = chain.tail;
        let Some(entity) = index.get_mut(idx) else {
            return;
        };
        entity.set_location(Some(location));
        entity.file_prev = tail;
        entity.file_next = None;

        match tail.and_then(|tail| index.get_mut(tail)) {
            Some(last) => last.file_next = Some(idx),
            None => chain.head = Some(idx),
        }
        chain.tail = Some(idx);
        chain.len += 1;
    }

    /// Unlink the entity from its file chain and clear its location
    pub(crate) fn detach(&mut self, index: &mut EntityIndex, idx: EntityIdx) {
        let Some(entity) = index.get_mut(idx) else {
            return;
        };
        let Some(location) = entity.location() else {
            return;
        };
        entity.set_location(None);
        let (prev, next) = (entity.file_prev.take(), entity.file_next.take());

        let Some(chain) = self.files.get_mut(&location.file) else {
            return;
        };
        match prev.and_then(|prev| index.get_mut(prev)) {
            Some(prev) => prev.file_next = next,
            None => chain.head = next,
        }
        match next.and_then(|next| index.get_mut(next)) {
            Some(next) => next.file_prev = prev,
            None => chain.tail = prev,
        }
        chain.len -= 1;
        if chain.len == 0 {
            self.files.remove(&location.file);
        }
    }

    /// Head of the first file
    pub(crate) fn first(&self) -> Option<EntityIdx> {
        self.files.values().find_map(|chain| chain.head)
    }

    /// Successor in file order, wrapping from the last file to the first
    pub(crate) fn next(&self, index: &EntityIndex, idx: EntityIdx) -> Option<EntityIdx> {
        let entity = index.get(idx)?;
        if let Some(next) = entity.file_next {
            return Some(next);
        }
        let file = entity.location()?.file;
        self.files
            .range((Bound::Excluded(file), Bound::Unbounded))
            .find_map(|(_, chain)| chain.head)
            .or_else(|| self.first())
    }

    /// Number of entities stored in `file`
    pub(crate) fn file_len(&self, file: FileId) -> usize {
        self.files.get(&file).map_or(0, |chain| chain.len)
    }

    pub(crate) fn file_count(&self) -> usize {
        self.files.len()
    }
}

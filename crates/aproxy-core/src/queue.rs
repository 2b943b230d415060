//! Ordered, de-duplicating queue of items with outstanding missing chunks.

use crate::chunk::ChunkIndex;
use crate::item::{Item, ItemRef};

#[derive(Debug)]
struct QueueEntry {
    item: ItemRef,
    missing: ChunkIndex,
}

/// Items waiting for chunks. The front of the queue is served first; an item
/// appears at most once and re-adding merges its missing set.
#[derive(Debug, Default)]
pub struct ItemQueue {
    entries: Vec<QueueEntry>,
}

impl ItemQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `missing` chunks of `item`. New items go to the front. Returns
    /// false for unavailable items or an empty missing set.
    pub fn add_item(&mut self, item: &ItemRef, missing: &ChunkIndex) -> bool {
        if !item.is_available() || missing.is_empty() {
            return false;
        }
        match self.position(item) {
            Some(i) => self.entries[i].missing.union_with(missing),
            None => self.entries.insert(
                0,
                QueueEntry {
                    item: ItemRef::clone(item),
                    missing: missing.clone(),
                },
            ),
        }
        true
    }

    pub fn remove(&mut self, item: &Item) -> bool {
        match self.position(item) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    /// Drop `done` from the item's missing set, removing the item once
    /// nothing is left. Returns true if the item left the queue.
    pub fn remove_if_completed(&mut self, item: &Item, done: &ChunkIndex) -> bool {
        let Some(i) = self.position(item) else {
            return false;
        };
        self.entries[i].missing.subtract(done);
        if self.entries[i].missing.is_empty() {
            self.entries.remove(i);
            true
        } else {
            false
        }
    }

    /// Take the lowest missing chunk of `item`, dequeuing it if that was the last.
    pub fn pop_first_missing(&mut self, item: &Item) -> Option<u32> {
        let i = self.position(item)?;
        let first = self.entries[i].missing.first()?;
        let mut done = ChunkIndex::new();
        done.insert(first);
        self.remove_if_completed(item, &done);
        Some(first)
    }

    pub fn contains(&self, item: &Item) -> bool {
        self.position(item).is_some()
    }

    pub fn missing(&self, item: &Item) -> Option<&ChunkIndex> {
        self.position(item).map(|i| &self.entries[i].missing)
    }

    /// Snapshot of the queued items, front first.
    pub fn items(&self) -> Vec<ItemRef> {
        self.entries.iter().map(|e| ItemRef::clone(&e.item)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, item: &Item) -> Option<usize> {
        self.entries.iter().position(|e| e.item.hash() == item.hash())
    }
}

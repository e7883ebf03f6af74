//! Visit the owners of a sorted list of keys.
//!
//! A run is visited once even when several requested keys fall into it, and
//! entries owning none of the keys are skipped by binary search.

use crate::index::{BlockIndexEntry, BlockType, classify, owner_run};

/// Position in a discrete-key traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscreteCursor {
    block: usize,
    key: usize,
    end: usize,
}

impl DiscreteCursor {
    /// Cursor on the owner of the first key that has one.
    ///
    /// `keys` must be sorted ascending.
    pub fn start<K: Ord>(flat: &[BlockIndexEntry<K>], keys: &[K]) -> Self {
        Self::settle(flat, keys, 0, 0)
    }

    fn settle<K: Ord>(flat: &[BlockIndexEntry<K>], keys: &[K], floor: usize, from: usize) -> Self {
        for (k, key) in keys.iter().enumerate().skip(from) {
            if let Some(run) = owner_run(flat, floor, key) {
                return Self {
                    block: run.start,
                    key: k,
                    end: run.end,
                };
            }
        }
        Self {
            block: flat.len(),
            key: keys.len(),
            end: flat.len(),
        }
    }

    /// Whether no requested key is left.
    pub const fn at_end<K>(self, flat: &[BlockIndexEntry<K>]) -> bool {
        self.block >= flat.len()
    }

    /// Flat position of the current entry.
    pub const fn position(self) -> usize {
        self.block
    }

    /// Index into the key list of the first key owned by the current run.
    pub const fn key_index(self) -> usize {
        self.key
    }

    /// Current entry.
    pub fn entry<K>(self, flat: &[BlockIndexEntry<K>]) -> Option<&BlockIndexEntry<K>> {
        flat.get(self.block)
    }

    /// Role of the current entry.
    pub fn block_type<K: Ord>(self, flat: &[BlockIndexEntry<K>]) -> Option<BlockType> {
        (self.block < flat.len()).then(|| classify(flat, self.block))
    }

    /// Next block of the current run, or the owner of the next unvisited key.
    #[must_use]
    pub fn advance<K: Ord>(self, flat: &[BlockIndexEntry<K>], keys: &[K]) -> Self {
        if self.block >= flat.len() {
            return self;
        }
        if self.block + 1 < self.end {
            return Self {
                block: self.block + 1,
                ..self
            };
        }
        Self::settle(flat, keys, self.end, self.key + 1)
    }
}

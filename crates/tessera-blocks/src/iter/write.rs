//! Traversal that tolerates mutation between steps.
//!
//! The cursor remembers which slice of the key list the current position
//! covers, not a flat position. Advancing looks the next key up again in the
//! index as it is after the caller's inserts, replacements and erasures, so
//! entries may come and go under it.

use std::ops::Range;

use crate::index::{BlockIndex, BlockIndexEntry, EntryId, in_chain, owner_run};
use crate::key::BlockKey;

/// Where the current keys live, or would live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePosition<K> {
    /// The index has no entries at all.
    Vacant,
    /// No entry owns the keys; new entries sort before `before`, or at the
    /// end when it is `None`.
    Slot {
        /// First entry after the slot.
        before: Option<EntryId<K>>,
    },
    /// The keys are owned by this group, or the chain starting here.
    Block(EntryId<K>),
    /// Every key was visited.
    End,
}

/// Position in a mutating traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCursor<K> {
    position: WritePosition<K>,
    key: usize,
    visit_end: usize,
}

impl<K: BlockKey> WriteCursor<K> {
    /// Cursor for the first key. `keys` must be sorted ascending.
    pub fn start(index: &BlockIndex<K>, keys: &[K]) -> Self {
        Self::settle(index, keys, 0)
    }

    fn settle(index: &BlockIndex<K>, keys: &[K], from: usize) -> Self {
        let Some(key) = keys.get(from) else {
            return Self {
                position: WritePosition::End,
                key: keys.len(),
                visit_end: keys.len(),
            };
        };
        let flat = index.flat();
        if flat.is_empty() {
            return Self {
                position: WritePosition::Vacant,
                key: from,
                visit_end: keys.len(),
            };
        }

        let below = |limit: &K| from + keys[from..].partition_point(|k| k < limit);

        match owner_run(flat, 0, key) {
            Some(run) if run.len() > 1 => Self {
                position: WritePosition::Block(flat[run.start].id()),
                key: from,
                visit_end: from + keys[from..].partition_point(|k| k <= key),
            },
            Some(run) => Self {
                position: WritePosition::Block(flat[run.start].id()),
                key: from,
                visit_end: flat.get(run.end).map_or(keys.len(), |next| below(&next.key)),
            },
            None => {
                let before = flat.get(flat.partition_point(|e| e.key <= *key));
                Self {
                    position: WritePosition::Slot {
                        before: before.map(BlockIndexEntry::id),
                    },
                    key: from,
                    visit_end: before.map_or(keys.len(), |next| below(&next.key)),
                }
            }
        }
    }

    /// Position for the keys of the next step, looked up in the index as
    /// it is now.
    #[must_use]
    pub fn advance(self, index: &BlockIndex<K>, keys: &[K]) -> Self {
        if self.at_end() {
            return self;
        }
        Self::settle(index, keys, self.visit_end)
    }

    /// Whether every key was visited.
    pub const fn at_end(&self) -> bool {
        matches!(self.position, WritePosition::End)
    }

    /// Current position.
    pub const fn position(&self) -> &WritePosition<K> {
        &self.position
    }

    /// Slice of the key list handled at this position.
    pub const fn key_range(&self) -> Range<usize> {
        self.key..self.visit_end
    }

    /// Entries of the current block: one for a group, the whole chain for
    /// a segmented record, none for a vacant or slot position.
    pub fn segments(&self, index: &BlockIndex<K>) -> Vec<BlockIndexEntry<K>> {
        let WritePosition::Block(id) = &self.position else {
            return Vec::new();
        };
        let flat = index.flat();
        let pos = flat.partition_point(|e| (&e.key, e.seq) < (id.key(), id.seq()));
        if flat.get(pos).is_none_or(|e| e.id() != *id) {
            return Vec::new();
        }
        if !in_chain(flat, pos) {
            return vec![flat[pos].clone()];
        }
        flat[pos..]
            .iter()
            .take_while(|e| e.key == *id.key())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn index(keys: &[u32]) -> BlockIndex<u32> {
        let mut index = BlockIndex::new();
        for &key in keys {
            let position = index.allocate(1).expect("allocate");
            index.insert(key, position, 1, 0);
        }
        index
    }

    #[test]
    fn test_vacant_index() {
        let index = index(&[]);
        let cursor = WriteCursor::start(&index, &[1, 2]);
        assert_eq!(cursor.position(), &WritePosition::Vacant);
        assert_eq!(cursor.key_range(), 0..2);
        assert!(cursor.advance(&index, &[1, 2]).at_end());
    }

    #[test]
    fn test_slot_before_first_entry() {
        let index = index(&[10]);
        let keys = [1, 5, 10, 12];
        let cursor = WriteCursor::start(&index, &keys);
        let first = index.flat()[0].id();
        assert_eq!(
            cursor.position(),
            &WritePosition::Slot {
                before: Some(first.clone())
            }
        );
        assert_eq!(cursor.key_range(), 0..2);

        let cursor = cursor.advance(&index, &keys);
        assert_eq!(cursor.position(), &WritePosition::Block(first));
        assert_eq!(cursor.key_range(), 2..4);
    }

    #[test]
    fn test_chain_and_slot_behind_it() {
        let index = index(&[10, 20, 20, 30]);
        let keys = [20, 25, 26, 40];
        let cursor = WriteCursor::start(&index, &keys);
        assert_eq!(cursor.segments(&index).len(), 2);
        assert_eq!(cursor.key_range(), 0..1);

        let cursor = cursor.advance(&index, &keys);
        let last = index.flat()[3].id();
        assert_eq!(cursor.position(), &WritePosition::Slot { before: Some(last) });
        assert_eq!(cursor.key_range(), 1..3);
        assert!(cursor.segments(&index).is_empty());
    }

    #[test]
    fn test_advance_sees_mutations() {
        let mut index = index(&[10, 30]);
        let keys = [12, 20, 35];
        let cursor = WriteCursor::start(&index, &keys);
        assert_eq!(cursor.key_range(), 0..2);

        // Split the group: keys from 20 now belong to a new entry.
        let position = index.allocate(1).expect("allocate");
        index.insert(20, position, 1, 0);

        let cursor = cursor.advance(&index, &keys);
        assert_eq!(cursor.segments(&index)[0].key, 30);
        assert_eq!(cursor.key_range(), 2..3);
        assert!(cursor.advance(&index, &keys).at_end());
    }
}

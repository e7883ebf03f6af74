//! Traversals over a [`BlockIndex`].
//!
//! Each traversal is a small `Copy`-able cursor plus a pure `advance`
//! taking the flat entry slice and returning the next cursor. The
//! `Iterator` adaptors here wrap the cursors for the common read paths.

mod discrete;
mod flat;
mod range;
mod write;

pub use discrete::DiscreteCursor;
pub use flat::FlatCursor;
pub use range::RangeCursor;
pub use write::{WriteCursor, WritePosition};

use std::ops::Range;

use crate::index::{BlockIndex, BlockIndexEntry};
use crate::key::BlockKey;

/// Every entry in key order.
#[derive(Debug, Clone)]
pub struct FlatIter<'a, K> {
    flat: &'a [BlockIndexEntry<K>],
    cursor: FlatCursor,
}

impl<'a, K> Iterator for FlatIter<'a, K> {
    type Item = &'a BlockIndexEntry<K>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.cursor.entry(self.flat)?;
        self.cursor = self.cursor.advance(self.flat);
        Some(entry)
    }
}

/// Owners of a sorted key list.
#[derive(Debug, Clone)]
pub struct DiscreteIter<'a, K> {
    flat: &'a [BlockIndexEntry<K>],
    keys: &'a [K],
    cursor: DiscreteCursor,
}

impl<'a, K: Ord> Iterator for DiscreteIter<'a, K> {
    type Item = &'a BlockIndexEntry<K>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.cursor.entry(self.flat)?;
        self.cursor = self.cursor.advance(self.flat, self.keys);
        Some(entry)
    }
}

/// Owners of sorted, non-overlapping key ranges.
#[derive(Debug, Clone)]
pub struct RangeIter<'a, K> {
    flat: &'a [BlockIndexEntry<K>],
    ranges: &'a [Range<K>],
    cursor: RangeCursor,
}

impl<'a, K: Ord> Iterator for RangeIter<'a, K> {
    type Item = &'a BlockIndexEntry<K>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.cursor.entry(self.flat)?;
        self.cursor = self.cursor.advance(self.flat, self.ranges);
        Some(entry)
    }
}

impl<K: BlockKey> BlockIndex<K> {
    /// Iterate all entries.
    pub fn iter_flat(&self) -> FlatIter<'_, K> {
        FlatIter {
            flat: self.flat(),
            cursor: FlatCursor::start(),
        }
    }

    /// Iterate the runs owning `keys`, which must be sorted.
    pub fn iter_discrete<'a>(&'a self, keys: &'a [K]) -> DiscreteIter<'a, K> {
        let flat = self.flat();
        DiscreteIter {
            flat,
            keys,
            cursor: DiscreteCursor::start(flat, keys),
        }
    }

    /// Iterate the runs owning any key of `ranges`, which must be sorted
    /// and disjoint.
    pub fn iter_ranges<'a>(&'a self, ranges: &'a [Range<K>]) -> RangeIter<'a, K> {
        let flat = self.flat();
        RangeIter {
            flat,
            ranges,
            cursor: RangeCursor::start(flat, ranges),
        }
    }
}

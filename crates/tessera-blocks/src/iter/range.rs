//! Visit the owners of sorted, non-overlapping half-open key ranges.

use std::ops::Range;

use crate::index::{BlockIndexEntry, BlockType, classify, in_chain};

/// Position in a range traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeCursor {
    block: usize,
    range: usize,
    end: usize,
}

impl RangeCursor {
    /// Cursor on the first entry overlapping any range.
    pub fn start<K: Ord>(flat: &[BlockIndexEntry<K>], ranges: &[Range<K>]) -> Self {
        Self::settle(flat, ranges, 0, 0)
    }

    // Entries at or after `floor` whose owned keys meet `ranges[from]`, or the
    // first later range that has some.
    fn settle<K: Ord>(
        flat: &[BlockIndexEntry<K>],
        ranges: &[Range<K>],
        floor: usize,
        from: usize,
    ) -> Self {
        let tail = flat.get(floor..).unwrap_or_default();
        for (r, range) in ranges.iter().enumerate().skip(from) {
            if range.start >= range.end {
                continue;
            }
            let lower = floor + tail.partition_point(|e| e.key < range.start);
            let upper = floor + tail.partition_point(|e| e.key < range.end);

            // A group keyed below the range still owns its start.
            let mut first = lower;
            if lower > floor
                && !in_chain(flat, lower - 1)
                && flat.get(lower).is_none_or(|next| next.key > range.start)
            {
                first = lower - 1;
            }

            if first < upper {
                return Self {
                    block: first,
                    range: r,
                    end: upper,
                };
            }
        }
        Self {
            block: flat.len(),
            range: ranges.len(),
            end: flat.len(),
        }
    }

    /// Whether every range is exhausted.
    pub const fn at_end<K>(self, flat: &[BlockIndexEntry<K>]) -> bool {
        self.block >= flat.len()
    }

    /// Flat position of the current entry.
    pub const fn position(self) -> usize {
        self.block
    }

    /// Index of the range being walked.
    pub const fn range_index(self) -> usize {
        self.range
    }

    /// Current entry.
    pub fn entry<K>(self, flat: &[BlockIndexEntry<K>]) -> Option<&BlockIndexEntry<K>> {
        flat.get(self.block)
    }

    /// Role of the current entry.
    pub fn block_type<K: Ord>(self, flat: &[BlockIndexEntry<K>]) -> Option<BlockType> {
        (self.block < flat.len()).then(|| classify(flat, self.block))
    }

    /// Next entry in the current range, or the first entry of the next
    /// range that was not visited yet.
    #[must_use]
    pub fn advance<K: Ord>(self, flat: &[BlockIndexEntry<K>], ranges: &[Range<K>]) -> Self {
        if self.block >= flat.len() {
            return self;
        }
        if self.block + 1 < self.end {
            return Self {
                block: self.block + 1,
                ..self
            };
        }
        Self::settle(flat, ranges, self.end, self.range + 1)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::index::BlockIndex;

    fn index(keys: &[u32]) -> BlockIndex<u32> {
        let mut index = BlockIndex::new();
        for &key in keys {
            let position = index.allocate(1).expect("allocate");
            index.insert(key, position, 1, 0);
        }
        index
    }

    fn visit(flat: &[BlockIndexEntry<u32>], ranges: &[Range<u32>]) -> Vec<usize> {
        let mut seen = Vec::new();
        let mut cursor = RangeCursor::start(flat, ranges);
        while !cursor.at_end(flat) {
            seen.push(cursor.position());
            cursor = cursor.advance(flat, ranges);
        }
        seen
    }

    #[test]
    fn test_range_inside_one_group() {
        let index = index(&[10, 100]);
        assert_eq!(visit(index.flat(), &[40..50]), vec![0]);
        assert_eq!(visit(index.flat(), &[40..50, 60..70]), vec![0]);
    }

    #[test]
    fn test_range_spanning_chain() {
        let index = index(&[10, 20, 20, 30]);
        assert_eq!(visit(index.flat(), &[15..21]), vec![0, 1, 2]);
        // Behind the chain nothing is owned until the next entry.
        assert_eq!(visit(index.flat(), &[21..30]), Vec::<usize>::new());
        assert_eq!(visit(index.flat(), &[21..31]), vec![3]);
    }

    #[test]
    fn test_empty_and_leading_ranges() {
        let index = index(&[10, 20]);
        assert_eq!(visit(index.flat(), &[0..5, 7..7]), Vec::<usize>::new());
        assert_eq!(visit(index.flat(), &[0..11, 25..26]), vec![0, 1]);
    }
}

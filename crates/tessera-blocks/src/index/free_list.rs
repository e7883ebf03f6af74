//! Reusable gaps in the data file.
//!
//! Gaps are tracked twice: by start position for coalescing, and by
//! `(size, start)` for allocation. Allocation prefers, in order:
//!
//! 1. a gap of exactly the requested size
//! 2. the smallest larger size that occurs at least twice, since a repeated
//!    size is a typical allocation and splitting one keeps unique large gaps
//!    intact
//! 3. the largest gap
//!
//! When nothing fits the caller grows the file.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Unbounded};

/// Ordered set of free block ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeList {
    by_start: BTreeMap<u32, u32>,
    by_size: BTreeSet<(u32, u32)>,
}

impl FreeList {
    /// Empty free list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of gaps.
    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    /// Whether no gap is tracked.
    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }

    /// Total free blocks.
    pub fn total_blocks(&self) -> u64 {
        self.by_start.values().map(|&size| u64::from(size)).sum()
    }

    /// Gaps as `(start, size)`, ordered by start.
    pub fn gaps(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.by_start.iter().map(|(&start, &size)| (start, size))
    }

    /// Whether any block of `[start, start + size)` is free.
    pub fn overlaps(&self, start: u32, size: u32) -> bool {
        let end = u64::from(start) + u64::from(size);
        if let Some((&s, &len)) = self.by_start.range(..=start).next_back()
            && u64::from(s) + u64::from(len) > u64::from(start)
        {
            return true;
        }
        self.by_start
            .range(start..)
            .next()
            .is_some_and(|(&s, _)| u64::from(s) < end)
    }

    /// Add a gap, merging it with touching neighbours.
    ///
    /// Returns `false` and leaves the list unchanged if any block of the
    /// range is already free.
    pub fn insert(&mut self, start: u32, size: u32) -> bool {
        if size == 0 {
            return true;
        }
        if self.overlaps(start, size) {
            return false;
        }

        let mut start = start;
        let mut size = size;

        if let Some((&prev_start, &prev_size)) = self.by_start.range(..start).next_back()
            && prev_start + prev_size == start
        {
            self.remove(prev_start, prev_size);
            start = prev_start;
            size += prev_size;
        }
        if let Some(&next_size) = self.by_start.get(&(start + size)) {
            self.remove(start + size, next_size);
            size += next_size;
        }

        self.by_start.insert(start, size);
        self.by_size.insert((size, start));
        true
    }

    /// Take `size` blocks out of an existing gap.
    pub fn take(&mut self, size: u32) -> Option<u32> {
        if size == 0 {
            return None;
        }

        if let Some(&(gap, start)) = self.by_size.range((size, 0)..=(size, u32::MAX)).next() {
            self.remove(start, gap);
            return Some(start);
        }

        let mut previous: Option<(u32, u32)> = None;
        let mut recurring = None;
        for &(gap, start) in self.by_size.range((Excluded((size, u32::MAX)), Unbounded)) {
            if let Some((prev_gap, prev_start)) = previous
                && prev_gap == gap
            {
                recurring = Some((prev_gap, prev_start));
                break;
            }
            previous = Some((gap, start));
        }

        let (gap, start) = match recurring {
            Some(found) => found,
            None => {
                let &(gap, start) = self.by_size.last()?;
                if gap < size {
                    return None;
                }
                (gap, start)
            }
        };

        self.remove(start, gap);
        self.by_start.insert(start + size, gap - size);
        self.by_size.insert((gap - size, start + size));
        Some(start)
    }

    /// Keep only the blocks that also lie in one of `allowed`.
    ///
    /// `allowed` is `(start, size)` ordered by start; `open_from` marks an
    /// unbounded allowed tail. Returns the removed part as its own list.
    pub fn retain_within(&mut self, allowed: &[(u32, u32)], open_from: u32) -> Self {
        let mut kept = Self::new();
        let mut dropped = Self::new();

        for (start, size) in self.gaps() {
            let end = start + size;
            let mut cursor = start;
            for &(a_start, a_size) in allowed
                .iter()
                .chain(std::iter::once(&(open_from, u32::MAX - open_from)))
            {
                let a_end = a_start.saturating_add(a_size);
                if a_end <= cursor || a_start >= end {
                    continue;
                }
                let lo = a_start.max(cursor);
                let hi = a_end.min(end);
                dropped.insert(cursor, lo - cursor);
                kept.insert(lo, hi - lo);
                cursor = hi;
                if cursor == end {
                    break;
                }
            }
            dropped.insert(cursor, end - cursor);
        }

        *self = kept;
        dropped
    }

    /// Drop every gap.
    pub fn clear(&mut self) {
        self.by_start.clear();
        self.by_size.clear();
    }

    fn remove(&mut self, start: u32, size: u32) {
        self.by_start.remove(&start);
        self.by_size.remove(&(size, start));
    }
}

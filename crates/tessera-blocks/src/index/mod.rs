//! Block index: the ordered directory of a data file.
//!
//! Entries map a key to a run of consecutive blocks. They are kept in an
//! ordered map keyed by `(key, sequence)`, so equal keys stay adjacent and
//! keep their insertion order. Binary search and traversal work on a flat
//! vector rebuilt lazily after any structural change.
//!
//! # Ownership
//!
//! A key is *owned* by at most one run of entries:
//!
//! - a run of several entries with the same key is a segment chain and owns
//!   exactly that key
//! - a single entry owns every key from its own key up to the next entry's key
//! - a key after the last segment of a chain and before the next entry has
//!   no owner
//!
//! Traversals visit owners, so a chain is never split between two visits.

mod file;
mod free_list;

pub use file::{
    EmptyBlocks, FreeGap, INDEX_MAGIC, INDEX_VERSION, IndexHeader, RawEntry, RawIndex, write_atomic,
};
pub use free_list::FreeList;

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;

use tracing::debug;

use crate::config::StoreConfig;
use crate::key::BlockKey;
use crate::{Result, StoreError};

/// Stable handle of an index entry.
///
/// Survives `replace`; invalidated by `erase`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId<K> {
    key: K,
    seq: u64,
}

impl<K> EntryId<K> {
    /// Key of the entry.
    pub const fn key(&self) -> &K {
        &self.key
    }

    pub(crate) const fn seq(&self) -> u64 {
        self.seq
    }
}

/// Blocks referenced by one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    position: u32,
    block_count: u32,
    max_key_size: u32,
}

/// One entry of the index, as seen by readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndexEntry<K> {
    /// Key of the record stored in the run.
    pub key: K,
    /// First block of the run.
    pub position: u32,
    /// Blocks in the run. Zero for a placeholder.
    pub block_count: u32,
    /// Largest per-key payload in the run, in bytes.
    pub max_key_size: u32,
    pub(crate) seq: u64,
}

impl<K: Clone> BlockIndexEntry<K> {
    /// Handle for mutating this entry.
    pub fn id(&self) -> EntryId<K> {
        EntryId {
            key: self.key.clone(),
            seq: self.seq,
        }
    }

    /// One past the last block of the run.
    pub const fn end(&self) -> u64 {
        self.position as u64 + self.block_count as u64
    }
}

/// Role of an entry, derived from its neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// Placeholder without data.
    Empty,
    /// Holds whole records for one or more keys.
    Group,
    /// Part of a chain, followed by more blocks of the same key.
    Segment,
    /// Final part of a chain.
    LastSegment,
}

/// Ordered block directory plus free list.
#[derive(Debug)]
pub struct BlockIndex<K: BlockKey> {
    entries: BTreeMap<EntryId<K>, Extent>,
    flat: OnceCell<Vec<BlockIndexEntry<K>>>,
    free: FreeList,
    released: FreeList,
    defer_release: bool,
    block_count: u32,
    next_seq: u64,
}

impl<K: BlockKey> Default for BlockIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: BlockKey> BlockIndex<K> {
    /// Empty index over an empty data file.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            flat: OnceCell::new(),
            free: FreeList::new(),
            released: FreeList::new(),
            defer_release: false,
            block_count: 0,
            next_seq: 0,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Blocks in the data file, referenced or not.
    pub const fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Gaps available to `allocate`.
    pub const fn free_list(&self) -> &FreeList {
        &self.free
    }

    /// Every unreferenced range, including blocks held back by deferred
    /// release, as `(start, size)` ordered by start.
    pub fn free_ranges(&self) -> Vec<(u32, u32)> {
        let mut all = self.free.clone();
        for (start, size) in self.released.gaps() {
            all.insert(start, size);
        }
        all.gaps().collect()
    }

    /// Hold released blocks back from reuse until [`Self::merge_released`].
    pub fn set_deferred_release(&mut self, defer: bool) {
        self.defer_release = defer;
    }

    /// Blocks released while deferral was on, as `(start, size)`.
    pub fn released(&self) -> Vec<(u32, u32)> {
        self.released.gaps().collect()
    }

    /// Make held-back blocks allocatable.
    pub fn merge_released(&mut self) {
        for (start, size) in std::mem::take(&mut self.released).gaps() {
            self.free.insert(start, size);
        }
    }

    /// Entries in key order, rebuilt after structural changes.
    pub fn flat(&self) -> &[BlockIndexEntry<K>] {
        self.flat.get_or_init(|| {
            self.entries
                .iter()
                .map(|(id, extent)| BlockIndexEntry {
                    key: id.key.clone(),
                    position: extent.position,
                    block_count: extent.block_count,
                    max_key_size: extent.max_key_size,
                    seq: id.seq,
                })
                .collect()
        })
    }

    /// Current state of an entry.
    pub fn entry(&self, id: &EntryId<K>) -> Option<BlockIndexEntry<K>> {
        self.entries.get(id).map(|extent| BlockIndexEntry {
            key: id.key.clone(),
            position: extent.position,
            block_count: extent.block_count,
            max_key_size: extent.max_key_size,
            seq: id.seq,
        })
    }

    /// First entry stored under exactly `key`.
    pub fn find(&self, key: &K) -> Option<&BlockIndexEntry<K>> {
        let flat = self.flat();
        let pos = flat.partition_point(|e| e.key < *key);
        flat.get(pos).filter(|e| e.key == *key)
    }

    /// Flat positions of the run owning `key`.
    pub fn owner(&self, key: &K) -> Option<Range<usize>> {
        owner_run(self.flat(), 0, key)
    }

    /// Classification of the flat entry at `pos`.
    pub fn classify(&self, pos: usize) -> BlockType {
        classify(self.flat(), pos)
    }

    /// Insert an entry for blocks the caller already allocated.
    ///
    /// The new entry sorts after existing entries with the same key.
    pub fn insert(
        &mut self,
        key: K,
        position: u32,
        block_count: u32,
        max_key_size: u32,
    ) -> EntryId<K> {
        let id = EntryId {
            key,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(
            id.clone(),
            Extent {
                position,
                block_count,
                max_key_size,
            },
        );
        self.flat = OnceCell::new();
        id
    }

    /// Point an entry at new blocks and release the old ones.
    pub fn replace(
        &mut self,
        id: &EntryId<K>,
        position: u32,
        block_count: u32,
        max_key_size: u32,
    ) -> Result<()> {
        let extent = self
            .entries
            .get_mut(id)
            .ok_or_else(|| StoreError::InvalidFormat(format!("no index entry {id:?}")))?;
        let old = *extent;
        *extent = Extent {
            position,
            block_count,
            max_key_size,
        };
        self.flat = OnceCell::new();
        self.release(old.position, old.block_count)
    }

    /// Remove an entry and release its blocks.
    pub fn erase(&mut self, id: &EntryId<K>) -> Result<()> {
        let extent = self
            .entries
            .remove(id)
            .ok_or_else(|| StoreError::InvalidFormat(format!("no index entry {id:?}")))?;
        self.flat = OnceCell::new();
        self.release(extent.position, extent.block_count)
    }

    /// Remove every entry from `from` up to, not including, `to`.
    ///
    /// Returns the number of entries removed.
    pub fn erase_range(&mut self, from: &EntryId<K>, to: Option<&EntryId<K>>) -> Result<usize> {
        let doomed: Vec<EntryId<K>> = match to {
            Some(to) if to <= from => Vec::new(),
            Some(to) => self.entries.range(from..to).map(|(id, _)| id.clone()).collect(),
            None => self.entries.range(from..).map(|(id, _)| id.clone()).collect(),
        };
        for id in &doomed {
            self.erase(id)?;
        }
        Ok(doomed.len())
    }

    /// Reserve `blocks` consecutive blocks, growing the file if no gap fits.
    pub fn allocate(&mut self, blocks: u32) -> Result<u32> {
        if blocks == 0 {
            return Ok(self.block_count);
        }
        if let Some(start) = self.free.take(blocks) {
            debug!("allocated {blocks} blocks at {start} from free list");
            return Ok(start);
        }
        let start = self.block_count;
        self.block_count = start.checked_add(blocks).ok_or_else(|| {
            StoreError::Allocation(format!(
                "{blocks} blocks past {start} exceed the addressable block count"
            ))
        })?;
        debug!("grew data file to {} blocks", self.block_count);
        Ok(start)
    }

    /// Return blocks to the free list, or hold them back while deferral is on.
    pub fn release(&mut self, position: u32, blocks: u32) -> Result<()> {
        if blocks == 0 {
            return Ok(());
        }
        if u64::from(position) + u64::from(blocks) > u64::from(self.block_count) {
            return Err(StoreError::Allocation(format!(
                "release of {blocks} blocks at {position} beyond block count {}",
                self.block_count
            )));
        }
        if self.free.overlaps(position, blocks) || self.released.overlaps(position, blocks) {
            return Err(StoreError::Allocation(format!(
                "blocks {position}..{} released twice",
                u64::from(position) + u64::from(blocks)
            )));
        }
        if self.defer_release {
            self.released.insert(position, blocks);
        } else {
            self.free.insert(position, blocks);
        }
        Ok(())
    }

    /// Give back blocks whose write failed.
    pub(crate) fn cancel_allocation(&mut self, position: u32, blocks: u32) {
        self.free.insert(position, blocks);
    }

    /// Point entries at their compacted positions and drop every gap.
    pub(crate) fn relocate(&mut self, moves: &[(EntryId<K>, u32)], block_count: u32) -> Result<()> {
        for (id, position) in moves {
            let extent = self
                .entries
                .get_mut(id)
                .ok_or_else(|| StoreError::InvalidFormat(format!("no index entry {id:?}")))?;
            extent.position = *position;
        }
        self.free.clear();
        self.released.clear();
        self.block_count = block_count;
        self.flat = OnceCell::new();
        Ok(())
    }

    /// Restrict allocation to blocks in `safe`, plus anything at or past
    /// `safe_from`. Free blocks outside move to the held-back list.
    pub fn restrict_free(&mut self, safe: &[(u32, u32)], safe_from: u32) {
        let held = self.free.retain_within(safe, safe_from);
        for (start, size) in held.gaps() {
            self.released.insert(start, size);
        }
    }

    /// Check ordering and that referenced and free ranges tile
    /// `[0, block_count)` without overlap.
    pub fn check_consistency(&self) -> Result<()> {
        let mut ranges: Vec<(u64, u64)> = self
            .entries
            .values()
            .filter(|e| e.block_count > 0)
            .map(|e| (u64::from(e.position), u64::from(e.block_count)))
            .collect();
        ranges.extend(
            self.free_ranges()
                .into_iter()
                .map(|(s, n)| (u64::from(s), u64::from(n))),
        );
        ranges.sort_unstable();

        let mut covered = 0u64;
        for (start, size) in ranges {
            if start < covered {
                return Err(StoreError::InvalidFormat(format!(
                    "block {start} is referenced twice"
                )));
            }
            if start > covered {
                return Err(StoreError::InvalidFormat(format!(
                    "block {covered} is neither referenced nor free"
                )));
            }
            covered = start + size;
        }
        if covered != u64::from(self.block_count) {
            return Err(StoreError::InvalidFormat(format!(
                "ranges cover {covered} blocks, file has {}",
                self.block_count
            )));
        }
        Ok(())
    }

    /// Load an index file written by [`Self::save`].
    pub fn load(path: &Path, config: &StoreConfig) -> Result<Self> {
        let raw = RawIndex::read_from(path)?;
        raw.check_compatible(K::WIDTH, config)?;

        let mut index = Self::new();
        index.block_count = raw.header.block_count;
        for entry in &raw.entries {
            let key = K::decode(&entry.key).ok_or_else(|| {
                StoreError::InvalidFormat(format!("short key in {}", path.display()))
            })?;
            if index.entries.last_key_value().is_some_and(|(last, _)| last.key > key) {
                return Err(StoreError::InvalidFormat(format!(
                    "entries out of order in {}",
                    path.display()
                )));
            }
            index.insert(key, entry.position, entry.block_count, entry.max_key_size);
        }
        for gap in &raw.gaps {
            if !index.free.insert(gap.start, gap.gap_size) {
                return Err(StoreError::InvalidFormat(format!(
                    "overlapping free gaps in {}",
                    path.display()
                )));
            }
        }
        index.check_consistency()?;

        debug!(
            "loaded {} entries, {} gaps from {}",
            index.len(),
            index.free.len(),
            path.display()
        );
        Ok(index)
    }

    /// Encode the index, held-back blocks included as free.
    pub fn to_raw(&self, config: &StoreConfig) -> RawIndex {
        let entries = self
            .entries
            .iter()
            .map(|(id, extent)| RawEntry {
                key: id.key.to_bytes(),
                position: extent.position,
                block_count: extent.block_count,
                max_key_size: extent.max_key_size,
            })
            .collect();
        let gaps = self
            .free_ranges()
            .into_iter()
            .map(|(start, gap_size)| FreeGap { gap_size, start })
            .collect();
        RawIndex::new(K::WIDTH, config, self.block_count, entries, gaps)
    }

    /// Write the index atomically.
    pub fn save(&self, path: &Path, config: &StoreConfig) -> Result<()> {
        self.to_raw(config).write_to(path)
    }
}

/// Role of `flat[pos]`.
pub(crate) fn classify<K: Ord>(flat: &[BlockIndexEntry<K>], pos: usize) -> BlockType {
    let entry = &flat[pos];
    if entry.block_count == 0 {
        return BlockType::Empty;
    }
    let same_next = flat.get(pos + 1).is_some_and(|next| next.key == entry.key);
    let same_prev = pos > 0 && flat[pos - 1].key == entry.key;
    match (same_prev, same_next) {
        (_, true) => BlockType::Segment,
        (true, false) => BlockType::LastSegment,
        (false, false) => BlockType::Group,
    }
}

/// Whether `flat[pos]` belongs to a run of equal keys.
pub(crate) fn in_chain<K: Ord>(flat: &[BlockIndexEntry<K>], pos: usize) -> bool {
    (pos > 0 && flat[pos - 1].key == flat[pos].key)
        || flat.get(pos + 1).is_some_and(|next| next.key == flat[pos].key)
}

/// Run of flat positions at or after `floor` that owns `key`.
pub(crate) fn owner_run<K: Ord>(
    flat: &[BlockIndexEntry<K>],
    floor: usize,
    key: &K,
) -> Option<Range<usize>> {
    let tail = flat.get(floor..)?;
    let upper = floor + tail.partition_point(|e| e.key <= *key);
    if upper == floor {
        return None;
    }
    let last = upper - 1;
    if flat[last].key == *key {
        let start = floor + tail.partition_point(|e| e.key < *key);
        return Some(start..upper);
    }
    if in_chain(flat, last) {
        return None;
    }
    Some(last..upper)
}

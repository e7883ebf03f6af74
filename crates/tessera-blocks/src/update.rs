//! Keyed value updates packed into group and segment blocks.
//!
//! A block payload is a stream of items `key ‖ u32 len ‖ value`. Items of
//! several keys share a group block as long as the stream fits the group
//! capacity; all items of one key always live in the same block or chain.
//! A key whose items alone exceed the capacity gets a segment chain: its
//! item stream cut into capacity-sized pieces, one block run each.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::StoreConfig;
use crate::index::BlockIndexEntry;
use crate::iter::WriteCursor;
use crate::key::BlockKey;
use crate::store::BlockStore;
use crate::{Result, StoreError};

const ITEM_LEN: usize = 4;

/// Changes to the values stored under one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyChange {
    /// Drop every stored value before inserting.
    pub clear: bool,
    /// Values to remove, one stored occurrence each.
    pub delete: Vec<Vec<u8>>,
    /// Values to append.
    pub insert: Vec<Vec<u8>>,
}

impl KeyChange {
    /// Append `value`.
    #[must_use]
    pub fn with_insert(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.insert.push(value.into());
        self
    }

    /// Remove one occurrence of `value`.
    #[must_use]
    pub fn with_delete(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.delete.push(value.into());
        self
    }

    /// Remove every stored value.
    #[must_use]
    pub const fn cleared(mut self) -> Self {
        self.clear = true;
        self
    }

    /// Whether the change does nothing.
    pub fn is_empty(&self) -> bool {
        !self.clear && self.delete.is_empty() && self.insert.is_empty()
    }
}

/// Counters for one [`BlockUpdater::apply`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    /// Block runs read.
    pub blocks_read: usize,
    /// Block runs written.
    pub blocks_written: usize,
    /// Index entries erased.
    pub blocks_erased: usize,
    /// Values appended.
    pub values_inserted: usize,
    /// Values removed.
    pub values_deleted: usize,
}

// One block or chain about to be written.
#[derive(Debug)]
struct Packed<K> {
    key: K,
    segments: Vec<Vec<u8>>,
    max_key_size: u32,
}

/// Applies [`KeyChange`]s through a write traversal.
#[derive(Debug, Clone, Copy)]
pub struct BlockUpdater {
    capacity: usize,
}

impl BlockUpdater {
    /// Updater packing groups up to the configured capacity.
    pub fn new<K: BlockKey>(config: &StoreConfig) -> Self {
        let capacity = config
            .group_capacity()
            .saturating_sub(ITEM_LEN + K::WIDTH)
            .max(1);
        Self { capacity }
    }

    /// Bytes of item stream one group holds.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Apply `changes` to `store`.
    pub fn apply<K: BlockKey>(
        &self,
        store: &mut BlockStore<K>,
        changes: &BTreeMap<K, KeyChange>,
    ) -> Result<UpdateStats> {
        let keys: Vec<K> = changes.keys().cloned().collect();
        let mut stats = UpdateStats::default();
        let mut cursor = WriteCursor::start(store.index(), &keys);

        while !cursor.at_end() {
            let run = cursor.segments(store.index());
            let mut items = if run.is_empty() {
                BTreeMap::new()
            } else {
                stats.blocks_read += run.len();
                read_items(store, &run)?
            };

            for key in &keys[cursor.key_range()] {
                let change = &changes[key];
                let values = items.entry(key.clone()).or_insert_with(Vec::new);
                if change.clear {
                    stats.values_deleted += values.len();
                    values.clear();
                } else {
                    for doomed in &change.delete {
                        if let Some(pos) = values.iter().position(|v| v == doomed) {
                            values.remove(pos);
                            stats.values_deleted += 1;
                        }
                    }
                }
                values.extend(change.insert.iter().cloned());
                stats.values_inserted += change.insert.len();
            }
            items.retain(|_, values| !values.is_empty());

            let packed = self.pack(&items);
            let in_place = run.len() == 1 && packed.len() == 1 && packed[0].segments.len() == 1;
            if in_place {
                store.replace_block(&run[0].id(), &packed[0].segments[0], packed[0].max_key_size)?;
                stats.blocks_written += 1;
            } else {
                let ids: Vec<_> = run.iter().map(BlockIndexEntry::id).collect();
                store.erase_blocks(&ids)?;
                stats.blocks_erased += ids.len();
                for block in packed {
                    for segment in &block.segments {
                        store.insert_block(block.key.clone(), segment, block.max_key_size)?;
                        stats.blocks_written += 1;
                    }
                }
            }

            cursor = cursor.advance(store.index(), &keys);
        }

        debug!(
            "Applied {} key changes: {} runs written, {} erased",
            changes.len(),
            stats.blocks_written,
            stats.blocks_erased
        );
        Ok(stats)
    }

    /// Values currently stored under `key`.
    pub fn lookup<K: BlockKey>(store: &BlockStore<K>, key: &K) -> Result<Vec<Vec<u8>>> {
        let Some(owner) = store.index().owner(key) else {
            return Ok(Vec::new());
        };
        let run = store.index().flat()[owner].to_vec();
        Ok(read_items(store, &run)?.remove(key).unwrap_or_default())
    }

    fn pack<K: BlockKey>(&self, items: &BTreeMap<K, Vec<Vec<u8>>>) -> Vec<Packed<K>> {
        let mut out = Vec::new();
        let mut current: Option<Packed<K>> = None;

        for (key, values) in items {
            let mut stream = Vec::new();
            for value in values {
                encode_item(key, value, &mut stream);
            }
            let size = u32::try_from(stream.len()).unwrap_or(u32::MAX);

            if stream.len() > self.capacity {
                out.extend(current.take());
                out.push(Packed {
                    key: key.clone(),
                    segments: stream.chunks(self.capacity).map(<[u8]>::to_vec).collect(),
                    max_key_size: size,
                });
                continue;
            }

            let fits = current
                .as_ref()
                .is_some_and(|group| group.segments[0].len() + stream.len() <= self.capacity);
            if fits {
                if let Some(group) = current.as_mut() {
                    group.segments[0].extend_from_slice(&stream);
                    group.max_key_size = group.max_key_size.max(size);
                }
            } else {
                out.extend(current.take());
                current = Some(Packed {
                    key: key.clone(),
                    segments: vec![stream],
                    max_key_size: size,
                });
            }
        }

        out.extend(current);
        out
    }
}

fn encode_item<K: BlockKey>(key: &K, value: &[u8], out: &mut Vec<u8>) {
    key.encode(out);
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value);
}

fn decode_items<K: BlockKey>(
    mut bytes: &[u8],
) -> std::result::Result<BTreeMap<K, Vec<Vec<u8>>>, String> {
    let mut items: BTreeMap<K, Vec<Vec<u8>>> = BTreeMap::new();
    while !bytes.is_empty() {
        if bytes.len() < K::WIDTH + ITEM_LEN {
            return Err(format!("{} trailing bytes after last item", bytes.len()));
        }
        let key = K::decode(bytes).ok_or_else(|| "item key truncated".to_string())?;
        let len_bytes = &bytes[K::WIDTH..K::WIDTH + ITEM_LEN];
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;
        let start = K::WIDTH + ITEM_LEN;
        let value = bytes
            .get(start..start + len)
            .ok_or_else(|| format!("item of {len} bytes overruns the block"))?;
        items.entry(key).or_default().push(value.to_vec());
        bytes = &bytes[start + len..];
    }
    Ok(items)
}

fn read_items<K: BlockKey>(
    store: &BlockStore<K>,
    run: &[BlockIndexEntry<K>],
) -> Result<BTreeMap<K, Vec<Vec<u8>>>> {
    let bytes = store.read_run(run)?;
    decode_items(&bytes).map_err(|reason| StoreError::Corruption {
        path: store.names().data(),
        offset: run
            .first()
            .map_or(0, |e| u64::from(e.position) * u64::from(store.config().block_size)),
        reason,
    })
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::index::BlockType;
    use tempfile::{TempDir, tempdir};

    fn store() -> (TempDir, BlockStore<u32>) {
        let dir = tempdir().expect("tempdir");
        let config = StoreConfig::new(128);
        let store = BlockStore::open(dir.path(), "ways", config).expect("open");
        (dir, store)
    }

    fn changes(entries: &[(u32, KeyChange)]) -> BTreeMap<u32, KeyChange> {
        entries.iter().cloned().collect()
    }

    #[test]
    fn test_small_keys_share_groups() {
        let (_dir, mut store) = store();
        let updater = BlockUpdater::new::<u32>(store.config());
        let batch: Vec<_> = (0..20)
            .map(|k| (k, KeyChange::default().with_insert(vec![k as u8; 10])))
            .collect();
        updater.apply(&mut store, &changes(&batch)).expect("apply");

        // 18 bytes per item, 120 bytes per group: six keys per block.
        assert_eq!(store.index().len(), 4);
        for k in 0..20 {
            assert_eq!(
                BlockUpdater::lookup(&store, &k).expect("lookup"),
                vec![vec![k as u8; 10]]
            );
        }
        store.index().check_consistency().expect("consistent");
    }

    #[test]
    fn test_oversized_key_becomes_chain() {
        let (_dir, mut store) = store();
        let updater = BlockUpdater::new::<u32>(store.config());
        let big = vec![7u8; 500];
        updater
            .apply(
                &mut store,
                &changes(&[
                    (1, KeyChange::default().with_insert(b"a".to_vec())),
                    (5, KeyChange::default().with_insert(big.clone())),
                    (9, KeyChange::default().with_insert(b"z".to_vec())),
                ]),
            )
            .expect("apply");

        let types: Vec<_> = (0..store.index().len())
            .map(|i| store.index().classify(i))
            .collect();
        assert_eq!(types.first(), Some(&BlockType::Group));
        assert_eq!(types.last(), Some(&BlockType::Group));
        assert!(types.contains(&BlockType::Segment));
        assert!(types.contains(&BlockType::LastSegment));
        assert_eq!(BlockUpdater::lookup(&store, &5).expect("lookup"), vec![big]);
        assert_eq!(
            BlockUpdater::lookup(&store, &9).expect("lookup"),
            vec![b"z".to_vec()]
        );
    }

    #[test]
    fn test_group_rewritten_in_place() {
        let (_dir, mut store) = store();
        let updater = BlockUpdater::new::<u32>(store.config());
        updater
            .apply(
                &mut store,
                &changes(&[(3, KeyChange::default().with_insert(b"one".to_vec()))]),
            )
            .expect("apply");
        let before = store.index().flat()[0].id();

        let stats = updater
            .apply(
                &mut store,
                &changes(&[(4, KeyChange::default().with_insert(b"two".to_vec()))]),
            )
            .expect("apply");
        assert_eq!(stats.blocks_read, 1);
        assert_eq!(stats.blocks_erased, 0);
        assert_eq!(store.index().flat()[0].id(), before);
        assert_eq!(
            BlockUpdater::lookup(&store, &4).expect("lookup"),
            vec![b"two".to_vec()]
        );
    }

    #[test]
    fn test_delete_and_clear() {
        let (_dir, mut store) = store();
        let updater = BlockUpdater::new::<u32>(store.config());
        updater
            .apply(
                &mut store,
                &changes(&[(
                    8,
                    KeyChange::default()
                        .with_insert(b"x".to_vec())
                        .with_insert(b"y".to_vec())
                        .with_insert(b"x".to_vec()),
                )]),
            )
            .expect("apply");

        updater
            .apply(
                &mut store,
                &changes(&[(8, KeyChange::default().with_delete(b"x".to_vec()))]),
            )
            .expect("apply");
        assert_eq!(
            BlockUpdater::lookup(&store, &8).expect("lookup"),
            vec![b"y".to_vec(), b"x".to_vec()]
        );

        let stats = updater
            .apply(&mut store, &changes(&[(8, KeyChange::default().cleared())]))
            .expect("apply");
        assert_eq!(stats.values_deleted, 2);
        assert!(store.index().is_empty());
        assert_eq!(store.index().free_ranges(), vec![(0, 2)]);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;
        use proptest::test_runner::TestCaseError;

        fn change() -> impl Strategy<Value = KeyChange> {
            (
                prop::bool::weighted(0.1),
                prop::collection::vec(prop::collection::vec(0u8..3, 0..3), 0..2),
                prop::collection::vec(prop::collection::vec(0u8..3, 0..60), 0..4),
            )
                .prop_map(|(clear, delete, insert)| KeyChange {
                    clear,
                    delete,
                    insert,
                })
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            #[test]
            fn updates_match_model(
                batches in prop::collection::vec(
                    prop::collection::btree_map(0u32..40, change(), 1..8),
                    1..6
                )
            ) {
                let (_dir, mut store) = store();
                let updater = BlockUpdater::new::<u32>(store.config());
                let mut model: BTreeMap<u32, Vec<Vec<u8>>> = BTreeMap::new();

                for batch in &batches {
                    updater
                        .apply(&mut store, batch)
                        .map_err(|e| TestCaseError::fail(e.to_string()))?;
                    for (key, change) in batch {
                        let values = model.entry(*key).or_default();
                        if change.clear {
                            values.clear();
                        } else {
                            for doomed in &change.delete {
                                if let Some(pos) = values.iter().position(|v| v == doomed) {
                                    values.remove(pos);
                                }
                            }
                        }
                        values.extend(change.insert.iter().cloned());
                    }

                    store
                        .index()
                        .check_consistency()
                        .map_err(|e| TestCaseError::fail(e.to_string()))?;
                    for key in 0u32..40 {
                        let stored = BlockUpdater::lookup(&store, &key)
                            .map_err(|e| TestCaseError::fail(e.to_string()))?;
                        let expected = model.get(&key).cloned().unwrap_or_default();
                        prop_assert_eq!(stored, expected, "key {}", key);
                    }
                }
            }
        }
    }
}

//! Data file access.
//!
//! A record is stored as one run of blocks. The logical payload
//! `u32 logical_len ‖ key ‖ payload` is zero-padded to the configured
//! granularity, run through the codec, and the resulting frame is padded to
//! whole blocks. Reading reverses this and checks the embedded key against
//! the index entry, so a stale or misplaced run is reported instead of
//! returned.
//!
//! A store opened with [`BlockStore::open_shadow`] works on the writer's
//! private index copy. Blocks it frees are held back until the transaction
//! is promoted, because the main index may still reference them, and it
//! only allocates blocks the main index leaves empty.

mod compaction;

pub use compaction::{CompactionPlan, CompactionStats, RunMove, SpanCopier};

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::codec::{self, CodecError};
use crate::config::StoreConfig;
use crate::files::{FileNames, with_suffix};
use crate::index::{BlockIndex, BlockIndexEntry, EmptyBlocks, EntryId};
use crate::key::BlockKey;
use crate::{Result, StoreError};

/// Buffer budget for compaction copies (1 MiB).
const COMPACTION_BUFFER_BUDGET: usize = 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// One data file plus its block index.
#[derive(Debug)]
pub struct BlockStore<K: BlockKey> {
    names: FileNames,
    config: StoreConfig,
    shadow: bool,
    index: BlockIndex<K>,
    data: File,
    reads: AtomicU64,
    writes: u64,
}

impl<K: BlockKey> BlockStore<K> {
    /// Open `<trunk>.bin` and its main index in `dir`, creating them if absent.
    pub fn open(dir: &Path, trunk: &str, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let names = FileNames::new(dir, trunk);
        let index_path = names.index();
        let index = if index_path.exists() {
            BlockIndex::load(&index_path, &config)?
        } else {
            BlockIndex::new()
        };
        let data = open_data(&names.data())?;

        info!(
            "Opened block store {} ({} entries, {} blocks)",
            names.data().display(),
            index.len(),
            index.block_count()
        );
        Ok(Self {
            names,
            config,
            shadow: false,
            index,
            data,
            reads: AtomicU64::new(0),
            writes: 0,
        })
    }

    /// Open for writing inside a transaction.
    ///
    /// Loads `<trunk>.bin.idx.shadow`, falling back to the main index when no
    /// shadow exists yet. When `<trunk>.bin.idx.empty` exists, allocation is
    /// limited to the blocks it lists and to blocks past its end.
    pub fn open_shadow(dir: &Path, trunk: &str, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let names = FileNames::new(dir, trunk);
        let shadow_path = names.shadow_index();
        let index_path = if shadow_path.exists() {
            shadow_path
        } else {
            names.index()
        };
        let mut index = if index_path.exists() {
            BlockIndex::load(&index_path, &config)?
        } else {
            BlockIndex::new()
        };
        index.set_deferred_release(true);

        let empty_path = names.empty_index();
        if empty_path.exists() {
            let empty = EmptyBlocks::read_from(&empty_path)?;
            index.restrict_free(&empty.gaps, empty.block_count);
            debug!(
                "Restricted allocation to {} empty blocks below {}",
                empty.total_blocks(),
                empty.block_count
            );
        }
        let data = open_data(&names.data())?;

        info!(
            "Opened block store {} for writing ({} entries, {} blocks)",
            names.data().display(),
            index.len(),
            index.block_count()
        );
        Ok(Self {
            names,
            config,
            shadow: true,
            index,
            data,
            reads: AtomicU64::new(0),
            writes: 0,
        })
    }

    /// The block index.
    pub const fn index(&self) -> &BlockIndex<K> {
        &self.index
    }

    /// File names of this store.
    pub const fn names(&self) -> &FileNames {
        &self.names
    }

    /// Store configuration.
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Whether the store works on the shadow index.
    pub const fn is_shadow(&self) -> bool {
        self.shadow
    }

    /// Block runs read so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Block runs written so far.
    pub const fn write_count(&self) -> u64 {
        self.writes
    }

    /// Read the payload of an entry.
    ///
    /// Fails with [`StoreError::Checksum`] when a compressed frame does not
    /// match its checksum and with [`StoreError::Corruption`] when the frame
    /// is malformed or holds a different key.
    pub fn read(&self, entry: &BlockIndexEntry<K>) -> Result<Vec<u8>> {
        if entry.block_count == 0 {
            return Ok(Vec::new());
        }
        let path = self.names.data();
        let block_size = u64::from(self.config.block_size);
        let offset = u64::from(entry.position) * block_size;
        let mut buf = vec![0u8; (u64::from(entry.block_count) * block_size) as usize];

        let mut file = &self.data;
        file.seek(SeekFrom::Start(offset))
            .map_err(StoreError::io("read_block", &path))?;
        file.read_exact(&mut buf)
            .map_err(StoreError::io("read_block", &path))?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        let decoded = codec::decompress(&buf, self.config.compression).map_err(|e| match e {
            CodecError::Checksum { expected, actual } => StoreError::Checksum {
                path: path.clone(),
                offset,
                expected,
                actual,
            },
            other => StoreError::Corruption {
                path: path.clone(),
                offset,
                reason: other.to_string(),
            },
        })?;

        let (key, payload) = decode_record::<K>(&decoded).map_err(|reason| {
            StoreError::Corruption {
                path: path.clone(),
                offset,
                reason,
            }
        })?;
        if key != entry.key {
            return Err(StoreError::Corruption {
                path,
                offset,
                reason: format!("block holds key {key:?}, index expects {:?}", entry.key),
            });
        }
        Ok(payload.to_vec())
    }

    /// Concatenated payloads of a run of entries, e.g. a segment chain.
    pub fn read_run(&self, entries: &[BlockIndexEntry<K>]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for entry in entries {
            out.extend_from_slice(&self.read(entry)?);
        }
        Ok(out)
    }

    /// Store a record and index it.
    pub fn write(
        &mut self,
        key: K,
        payload: &[u8],
        max_key_size: u32,
    ) -> Result<BlockIndexEntry<K>> {
        let (position, block_count) = self.write_run(&key, payload)?;
        let id = self.index.insert(key, position, block_count, max_key_size);
        self.entry_of(&id)
    }

    /// Store a record and return its handle.
    pub fn insert_block(
        &mut self,
        key: K,
        payload: &[u8],
        max_key_size: u32,
    ) -> Result<EntryId<K>> {
        Ok(self.write(key, payload, max_key_size)?.id())
    }

    /// Index a placeholder for `key` without allocating blocks.
    pub fn insert_placeholder(&mut self, key: K) -> EntryId<K> {
        self.index.insert(key, 0, 0, 0)
    }

    /// Rewrite an entry's payload into freshly allocated blocks.
    ///
    /// The old blocks are released only after the new ones are written.
    pub fn replace_block(
        &mut self,
        id: &EntryId<K>,
        payload: &[u8],
        max_key_size: u32,
    ) -> Result<BlockIndexEntry<K>> {
        if self.index.entry(id).is_none() {
            return Err(StoreError::InvalidFormat(format!("no index entry {id:?}")));
        }
        let (position, block_count) = self.write_run(id.key(), payload)?;
        self.index.replace(id, position, block_count, max_key_size)?;
        debug!("Replaced {:?} with {block_count} blocks at {position}", id.key());
        self.entry_of(id)
    }

    /// Remove an entry and release its blocks.
    pub fn erase_block(&mut self, id: &EntryId<K>) -> Result<()> {
        self.index.erase(id)?;
        debug!("Erased {:?}", id.key());
        Ok(())
    }

    /// Remove several entries.
    pub fn erase_blocks(&mut self, ids: &[EntryId<K>]) -> Result<()> {
        for id in ids {
            self.erase_block(id)?;
        }
        Ok(())
    }

    /// Sync written blocks to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.data
            .sync_data()
            .map_err(StoreError::io("sync_data", &self.names.data()))
    }

    /// Sync data and write the active index atomically.
    pub fn persist(&mut self) -> Result<()> {
        self.flush()?;
        let path = self.names.active_index(self.shadow);
        self.index.save(&path, &self.config)?;
        debug!("Persisted index {}", path.display());
        Ok(())
    }

    /// Rewrite the data file with all runs back to back in key order.
    ///
    /// Only valid on the main index; a shadow store shares the data file
    /// with readers.
    pub fn compact(&mut self) -> Result<CompactionStats> {
        if self.shadow {
            return Err(StoreError::Config(
                "compaction needs the main index, not a shadow".to_string(),
            ));
        }

        let blocks_before = self.index.block_count();
        let plan = CompactionPlan::for_entries(self.index.flat());
        if plan.is_identity(blocks_before) {
            info!("Block store {} already compact", self.names.trunk());
            return Ok(CompactionStats {
                entries_moved: 0,
                blocks_before,
                blocks_after: blocks_before,
                bytes_moved: 0,
            });
        }

        let data_path = self.names.data();
        let tmp_path = with_suffix(&data_path, ".compact");
        let mut dest =
            File::create(&tmp_path).map_err(StoreError::io("compact_create", &tmp_path))?;
        let mut copier = SpanCopier::new(self.config.block_size, COMPACTION_BUFFER_BUDGET);
        for (first_block, blocks) in plan.spans() {
            copier.append(
                (&mut self.data, &data_path),
                first_block,
                blocks,
                (&mut dest, &tmp_path),
            )?;
        }
        dest.sync_all()
            .map_err(StoreError::io("compact_sync", &tmp_path))?;
        drop(dest);

        let relocated: Vec<(EntryId<K>, u32)> = {
            let flat = self.index.flat();
            plan.moves
                .iter()
                .map(|m| (flat[m.entry].id(), m.dest_block))
                .collect()
        };

        fs::rename(&tmp_path, &data_path).map_err(StoreError::io("compact_rename", &data_path))?;
        self.data = open_data(&data_path)?;
        self.index.relocate(&relocated, plan.total_blocks)?;
        self.persist()?;

        let stats = CompactionStats {
            entries_moved: plan.moves.len(),
            blocks_before,
            blocks_after: plan.total_blocks,
            bytes_moved: copier.bytes_copied(),
        };
        info!(
            "Compacted {}: {} -> {} blocks, {} runs moved",
            self.names.trunk(),
            stats.blocks_before,
            stats.blocks_after,
            stats.entries_moved
        );
        Ok(stats)
    }

    fn entry_of(&self, id: &EntryId<K>) -> Result<BlockIndexEntry<K>> {
        self.index
            .entry(id)
            .ok_or_else(|| StoreError::InvalidFormat(format!("no index entry {id:?}")))
    }

    // Encode, allocate and write one run. Returns `(position, block_count)`.
    fn write_run(&mut self, key: &K, payload: &[u8]) -> Result<(u32, u32)> {
        let mut frame = encode_record(key, payload, &self.config)?;
        let block_size = self.config.block_size as usize;
        let blocks = frame.len().div_ceil(block_size).max(1);
        let block_count = u32::try_from(blocks).map_err(|_| {
            StoreError::Allocation(format!("record of {} bytes is too large", frame.len()))
        })?;
        frame.resize(blocks * block_size, 0);

        let position = self.index.allocate(block_count)?;
        let path = self.names.data();
        let offset = u64::from(position) * block_size as u64;
        let written = (&self.data)
            .seek(SeekFrom::Start(offset))
            .and_then(|_| (&self.data).write_all(&frame));
        if let Err(e) = written {
            self.index.cancel_allocation(position, block_count);
            return Err(StoreError::io("write_block", &path)(e));
        }
        self.writes += 1;
        Ok((position, block_count))
    }
}

fn open_data(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(StoreError::io("open_data", path))
}

/// Logical payload padded to the codec granularity, then encoded.
fn encode_record<K: BlockKey>(key: &K, payload: &[u8], config: &StoreConfig) -> Result<Vec<u8>> {
    let logical_len = LEN_PREFIX + K::WIDTH + payload.len();
    let prefix = u32::try_from(logical_len).map_err(|_| {
        StoreError::Allocation(format!("record of {logical_len} bytes is too large"))
    })?;
    let granularity = config.granularity();
    let padded_len = logical_len.div_ceil(granularity) * granularity;

    let mut logical = Vec::with_capacity(padded_len);
    logical.extend_from_slice(&prefix.to_le_bytes());
    key.encode(&mut logical);
    logical.extend_from_slice(payload);
    logical.resize(padded_len, 0);

    codec::compress(&logical, config.compression)
        .map_err(|e| StoreError::Compression(e.to_string()))
}

/// Split a decoded frame into key and payload, dropping the padding.
fn decode_record<K: BlockKey>(decoded: &[u8]) -> std::result::Result<(K, &[u8]), String> {
    let prefix = decoded
        .get(..LEN_PREFIX)
        .ok_or_else(|| "record shorter than its length prefix".to_string())?;
    let logical_len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if logical_len < LEN_PREFIX + K::WIDTH || logical_len > decoded.len() {
        return Err(format!(
            "record length {logical_len} outside {}..={}",
            LEN_PREFIX + K::WIDTH,
            decoded.len()
        ));
    }
    let key = K::decode(&decoded[LEN_PREFIX..]).ok_or_else(|| "record key truncated".to_string())?;
    Ok((key, &decoded[LEN_PREFIX + K::WIDTH..logical_len]))
}

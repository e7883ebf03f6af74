//! Index side files.
//!
//! The index file is a little-endian header followed by the entries and the
//! free list. Entry keys are stored as raw bytes of `key_width`, so the file
//! can be walked without knowing the key type; the coordinator relies on
//! that to compute the empty-block file when a write starts.

use std::fs::{self, File};
use std::io::{Cursor, Write};
use std::path::Path;

use binrw::{BinRead, BinWrite};
use tracing::debug;

use crate::codec::CompressionMethod;
use crate::config::StoreConfig;
use crate::files::with_suffix;
use crate::{Result, StoreError};

/// Index file magic.
pub const INDEX_MAGIC: [u8; 4] = *b"TSIX";

/// Index file version.
pub const INDEX_VERSION: u32 = 1;

const EMPTY_VERSION: u32 = 1;
const MAX_KEY_WIDTH: u32 = 1024;

/// Fixed header of an index file.
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little, magic = b"TSIX")]
pub struct IndexHeader {
    /// Format version
    pub version: u32,
    /// Encoded key width in bytes
    pub key_width: u32,
    /// Data block size in bytes
    pub block_size: u32,
    /// Compression method byte
    pub compression: u8,
    /// Always zero
    pub reserved: [u8; 3],
    /// Blocks in the data file
    pub block_count: u32,
    /// Entries following the header
    pub entry_count: u32,
    /// Free gaps following the entries
    pub free_count: u32,
}

/// One free-list record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct FreeGap {
    /// Blocks in the gap
    pub gap_size: u32,
    /// First block of the gap
    pub start: u32,
}

/// Index entry with its key left encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    /// Encoded key, `key_width` bytes.
    pub key: Vec<u8>,
    /// First block of the run.
    pub position: u32,
    /// Blocks in the run.
    pub block_count: u32,
    /// Largest per-key payload in the run.
    pub max_key_size: u32,
}

/// Index file contents without key decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawIndex {
    /// File header.
    pub header: IndexHeader,
    /// Entries in key order.
    pub entries: Vec<RawEntry>,
    /// Free list.
    pub gaps: Vec<FreeGap>,
}

impl RawIndex {
    /// Assemble an index for writing.
    pub fn new(
        key_width: usize,
        config: &StoreConfig,
        block_count: u32,
        entries: Vec<RawEntry>,
        gaps: Vec<FreeGap>,
    ) -> Self {
        Self {
            header: IndexHeader {
                version: INDEX_VERSION,
                key_width: key_width as u32,
                block_size: config.block_size,
                compression: config.compression.as_byte(),
                reserved: [0; 3],
                block_count,
                entry_count: entries.len() as u32,
                free_count: gaps.len() as u32,
            },
            entries,
            gaps,
        }
    }

    /// Parse index file bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let header = IndexHeader::read(&mut cursor)?;
        if header.version != INDEX_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "unsupported index version {}",
                header.version
            )));
        }
        if header.key_width == 0 || header.key_width > MAX_KEY_WIDTH {
            return Err(StoreError::InvalidFormat(format!(
                "key width {} out of range",
                header.key_width
            )));
        }

        let key_width = header.key_width as usize;
        let entry_size = key_width + 12;
        let body = &bytes[cursor.position() as usize..];
        let needed = (header.entry_count as usize)
            .checked_mul(entry_size)
            .and_then(|n| n.checked_add(header.free_count as usize * 8))
            .ok_or_else(|| StoreError::InvalidFormat("entry count overflows".to_string()))?;
        if body.len() < needed {
            return Err(StoreError::InvalidFormat(format!(
                "index body has {} bytes, header announces {needed}",
                body.len()
            )));
        }

        let mut entries = Vec::with_capacity(header.entry_count as usize);
        for chunk in body.chunks_exact(entry_size).take(header.entry_count as usize) {
            let (key, rest) = chunk.split_at(key_width);
            entries.push(RawEntry {
                key: key.to_vec(),
                position: le_u32(rest, 0),
                block_count: le_u32(rest, 4),
                max_key_size: le_u32(rest, 8),
            });
        }

        cursor.set_position(cursor.position() + (header.entry_count as usize * entry_size) as u64);
        let mut gaps = Vec::with_capacity(header.free_count as usize);
        for _ in 0..header.free_count {
            gaps.push(FreeGap::read(&mut cursor)?);
        }

        Ok(Self {
            header,
            entries,
            gaps,
        })
    }

    /// Read and parse an index file.
    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(StoreError::io("read_index", path))?;
        Self::parse(&bytes).map_err(|e| match e {
            StoreError::InvalidFormat(reason) => {
                StoreError::InvalidFormat(format!("{}: {reason}", path.display()))
            }
            other => other,
        })
    }

    /// Encode to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.header.write(&mut cursor)?;
        let mut out = cursor.into_inner();
        for entry in &self.entries {
            out.extend_from_slice(&entry.key);
            out.extend_from_slice(&entry.position.to_le_bytes());
            out.extend_from_slice(&entry.block_count.to_le_bytes());
            out.extend_from_slice(&entry.max_key_size.to_le_bytes());
        }
        let mut cursor = Cursor::new(out);
        cursor.set_position(cursor.get_ref().len() as u64);
        for gap in &self.gaps {
            gap.write(&mut cursor)?;
        }
        Ok(cursor.into_inner())
    }

    /// Write the file through a temp file and rename.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_bytes()?)?;
        debug!(
            "wrote {} entries, {} gaps to {}",
            self.entries.len(),
            self.gaps.len(),
            path.display()
        );
        Ok(())
    }

    /// Fail unless the file was written for this key width and configuration.
    pub fn check_compatible(&self, key_width: usize, config: &StoreConfig) -> Result<()> {
        if self.header.key_width as usize != key_width {
            return Err(StoreError::InvalidFormat(format!(
                "index key width {} does not match {key_width}",
                self.header.key_width
            )));
        }
        if self.header.block_size != config.block_size {
            return Err(StoreError::InvalidFormat(format!(
                "index block size {} does not match configured {}",
                self.header.block_size, config.block_size
            )));
        }
        if CompressionMethod::from_byte(self.header.compression) != Some(config.compression) {
            return Err(StoreError::InvalidFormat(format!(
                "index compression byte {} does not match configured {:?}",
                self.header.compression, config.compression
            )));
        }
        Ok(())
    }

    /// Referenced runs as `(start, size)`, ordered by start.
    pub fn used_blocks(&self) -> Vec<(u32, u32)> {
        let mut used: Vec<(u32, u32)> = self
            .entries
            .iter()
            .filter(|e| e.block_count > 0)
            .map(|e| (e.position, e.block_count))
            .collect();
        used.sort_unstable();
        used
    }

    /// Blocks no entry references, computed from the entries alone.
    pub fn empty_blocks(&self) -> EmptyBlocks {
        let mut gaps = Vec::new();
        let mut cursor = 0u32;
        for (start, size) in self.used_blocks() {
            if start > cursor {
                gaps.push((cursor, start - cursor));
            }
            cursor = cursor.max(start.saturating_add(size));
        }
        if self.header.block_count > cursor {
            gaps.push((cursor, self.header.block_count - cursor));
        }

        EmptyBlocks {
            block_count: self.header.block_count,
            gaps,
        }
    }
}

#[derive(Debug, BinRead, BinWrite)]
#[brw(little, magic = b"TSEB")]
struct EmptyFile {
    version: u32,
    block_count: u32,
    gap_count: u32,
    #[br(count = gap_count)]
    gaps: Vec<FreeGap>,
}

/// Blocks the main index does not reference when a write starts.
///
/// Everything at or past `block_count` is free as well.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmptyBlocks {
    /// Blocks in the main data file.
    pub block_count: u32,
    /// Unreferenced ranges as `(start, size)`, ordered by start.
    pub gaps: Vec<(u32, u32)>,
}

impl EmptyBlocks {
    /// Read an empty-block file.
    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(StoreError::io("read_empty_index", path))?;
        let file = EmptyFile::read(&mut Cursor::new(bytes))?;
        if file.version != EMPTY_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "{}: unsupported version {}",
                path.display(),
                file.version
            )));
        }
        Ok(Self {
            block_count: file.block_count,
            gaps: file.gaps.iter().map(|g| (g.start, g.gap_size)).collect(),
        })
    }

    /// Write an empty-block file atomically.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = EmptyFile {
            version: EMPTY_VERSION,
            block_count: self.block_count,
            gap_count: self.gaps.len() as u32,
            gaps: self
                .gaps
                .iter()
                .map(|&(start, gap_size)| FreeGap { gap_size, start })
                .collect(),
        };
        let mut cursor = Cursor::new(Vec::new());
        file.write(&mut cursor)?;
        write_atomic(path, &cursor.into_inner())
    }

    /// Take every block of `used` out of the empty set.
    ///
    /// `used` may be unordered and overlapping. Ranges reaching past
    /// `block_count` raise it, so the open tail starts after them.
    pub fn exclude(&mut self, used: &[(u32, u32)]) {
        let used = coalesce(used);
        let Some(&(last_start, last_size)) = used.last() else {
            return;
        };
        let used_end = last_start.saturating_add(last_size);
        if used_end > self.block_count {
            self.gaps.push((self.block_count, used_end - self.block_count));
            self.block_count = used_end;
        }

        let mut kept = Vec::with_capacity(self.gaps.len());
        for &(start, size) in &self.gaps {
            let end = u64::from(start) + u64::from(size);
            let mut cursor = u64::from(start);
            let first = used.partition_point(|&(s, z)| u64::from(s) + u64::from(z) <= cursor);
            for &(u_start, u_size) in &used[first..] {
                let u_start = u64::from(u_start);
                if u_start >= end {
                    break;
                }
                if u_start > cursor {
                    kept.push((cursor as u32, (u_start - cursor) as u32));
                }
                cursor = cursor.max(u_start + u64::from(u_size));
            }
            if cursor < end {
                kept.push((cursor as u32, (end - cursor) as u32));
            }
        }
        self.gaps = kept;
    }

    /// Total unreferenced blocks below `block_count`.
    pub fn total_blocks(&self) -> u64 {
        self.gaps.iter().map(|&(_, size)| u64::from(size)).sum()
    }
}

/// Replace `path` with `bytes` via a synced temp file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = with_suffix(path, ".tmp");
    let mut file = File::create(&tmp).map_err(StoreError::io("create_temp", &tmp))?;
    file.write_all(bytes)
        .map_err(StoreError::io("write_temp", &tmp))?;
    file.sync_all().map_err(StoreError::io("sync_temp", &tmp))?;
    fs::rename(&tmp, path).map_err(StoreError::io("rename_temp", path))?;
    Ok(())
}

/// Sort ranges and merge the ones that overlap or touch.
fn coalesce(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut sorted: Vec<(u32, u32)> = ranges.iter().copied().filter(|&(_, n)| n > 0).collect();
    sorted.sort_unstable();
    let mut merged: Vec<(u32, u32)> = Vec::with_capacity(sorted.len());
    for (start, size) in sorted {
        let end = start.saturating_add(size);
        match merged.last_mut() {
            Some((m_start, m_size)) if m_start.saturating_add(*m_size) >= start => {
                *m_size = (*m_size).max(end - *m_start);
            }
            _ => merged.push((start, size)),
        }
    }
    merged
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> RawIndex {
        let entries = vec![
            RawEntry {
                key: vec![0, 0, 0, 1],
                position: 4,
                block_count: 2,
                max_key_size: 10,
            },
            RawEntry {
                key: vec![0, 0, 0, 9],
                position: 0,
                block_count: 1,
                max_key_size: 3,
            },
        ];
        let gaps = vec![FreeGap {
            gap_size: 3,
            start: 1,
        }];
        RawIndex::new(4, &StoreConfig::default(), 8, entries, gaps)
    }

    #[test]
    fn test_header_layout() {
        let bytes = sample().to_bytes().expect("encode");
        assert_eq!(&bytes[..4], b"TSIX");
        // magic + 3 words + compression + reserved + 3 words
        assert_eq!(bytes.len(), 4 + 12 + 4 + 12 + 2 * 16 + 8);
    }

    #[test]
    fn test_parse_round_trip() {
        let raw = sample();
        let parsed = RawIndex::parse(&raw.to_bytes().expect("encode")).expect("parse");
        assert_eq!(parsed, raw);
    }

    #[test]
    fn test_parse_rejects_truncation_and_bad_magic() {
        let bytes = sample().to_bytes().expect("encode");
        assert!(RawIndex::parse(&bytes[..bytes.len() - 3]).is_err());
        let mut bad = bytes;
        bad[0] = b'X';
        assert!(matches!(
            RawIndex::parse(&bad),
            Err(StoreError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_empty_blocks_is_complement_of_entries() {
        let empty = sample().empty_blocks();
        assert_eq!(empty.block_count, 8);
        assert_eq!(empty.gaps, vec![(1, 3), (6, 2)]);
        assert_eq!(empty.total_blocks(), 5);
    }

    #[test]
    fn test_exclude_keeps_blocks_of_older_versions() {
        let mut empty = sample().empty_blocks();
        // An older index still referenced blocks 2..4 and 6
        empty.exclude(&[(6, 1), (2, 2), (3, 1)]);
        assert_eq!(empty.gaps, vec![(1, 1), (7, 1)]);
        assert_eq!(empty.block_count, 8);

        empty.exclude(&[(9, 2)]);
        assert_eq!(empty.gaps, vec![(1, 1), (7, 1), (8, 1)]);
        assert_eq!(empty.block_count, 11);
    }

    #[test]
    fn test_empty_file_round_trip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nodes.bin.idx.empty");
        let empty = sample().empty_blocks();
        empty.write_to(&path).expect("write");
        assert_eq!(EmptyBlocks::read_from(&path).expect("read"), empty);
        assert!(!with_suffix(&path, ".tmp").exists());
    }
}

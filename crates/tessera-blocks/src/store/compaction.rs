//! Contiguous rewrite of a data file.
//!
//! Compaction lays every referenced run out back to back in key order, so
//! the destination is written strictly front to back. Runs that already
//! sit next to each other in the source are read as one span.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::index::BlockIndexEntry;
use crate::{Result, StoreError};

/// One run to relocate, in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunMove {
    /// Flat position of the entry being moved.
    pub entry: usize,
    /// First block in the old file.
    pub source_block: u32,
    /// First block in the new file.
    pub dest_block: u32,
    /// Blocks in the run.
    pub blocks: u32,
}

/// Copy plan for a compaction.
#[derive(Debug, Default)]
pub struct CompactionPlan {
    /// Moves in destination order.
    pub moves: Vec<RunMove>,
    /// Blocks in the compacted file.
    pub total_blocks: u32,
}

impl CompactionPlan {
    /// Lay runs out back to back in flat order. Placeholders stay empty.
    pub fn for_entries<K>(flat: &[BlockIndexEntry<K>]) -> Self {
        let mut moves = Vec::with_capacity(flat.len());
        let mut next = 0u32;
        for (entry, e) in flat.iter().enumerate() {
            if e.block_count == 0 {
                continue;
            }
            moves.push(RunMove {
                entry,
                source_block: e.position,
                dest_block: next,
                blocks: e.block_count,
            });
            next += e.block_count;
        }
        Self {
            moves,
            total_blocks: next,
        }
    }

    /// Whether the file is already contiguous and gap free.
    pub fn is_identity(&self, block_count: u32) -> bool {
        self.total_blocks == block_count
            && self.moves.iter().all(|m| m.source_block == m.dest_block)
    }

    /// Source spans `(first_block, blocks)` in destination order, with
    /// runs that continue each other in the source merged.
    pub fn spans(&self) -> Vec<(u32, u32)> {
        let mut spans: Vec<(u32, u32)> = Vec::new();
        for m in &self.moves {
            match spans.last_mut() {
                Some((start, len)) if *start + *len == m.source_block => *len += m.blocks,
                _ => spans.push((m.source_block, m.blocks)),
            }
        }
        spans
    }
}

/// Summary of a finished compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Runs copied.
    pub entries_moved: usize,
    /// Blocks before compaction.
    pub blocks_before: u32,
    /// Blocks after compaction.
    pub blocks_after: u32,
    /// Bytes copied.
    pub bytes_moved: u64,
}

/// Appends block spans of a source file to the end of a destination.
pub struct SpanCopier {
    block_size: u64,
    buffer: Vec<u8>,
    bytes_copied: u64,
}

impl SpanCopier {
    /// Copier with a buffer of at most `budget` bytes, rounded down to whole
    /// blocks and never below one block.
    pub fn new(block_size: u32, budget: usize) -> Self {
        let block = block_size.max(1) as usize;
        let blocks = (budget / block).max(1);
        Self {
            block_size: block as u64,
            buffer: vec![0u8; blocks * block],
            bytes_copied: 0,
        }
    }

    /// Bytes written so far.
    pub const fn bytes_copied(&self) -> u64 {
        self.bytes_copied
    }

    /// Append `blocks` blocks starting at `first_block` of `source` to
    /// `dest` at its current position.
    pub fn append(
        &mut self,
        (source, source_path): (&mut File, &Path),
        first_block: u32,
        blocks: u32,
        (dest, dest_path): (&mut File, &Path),
    ) -> Result<()> {
        source
            .seek(SeekFrom::Start(u64::from(first_block) * self.block_size))
            .map_err(StoreError::io("compact_seek", source_path))?;

        let mut remaining = u64::from(blocks) * self.block_size;
        while remaining > 0 {
            let chunk = remaining.min(self.buffer.len() as u64) as usize;
            let buf = &mut self.buffer[..chunk];
            source
                .read_exact(buf)
                .map_err(StoreError::io("compact_read", source_path))?;
            dest.write_all(buf)
                .map_err(StoreError::io("compact_write", dest_path))?;
            remaining -= chunk as u64;
            self.bytes_copied += chunk as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::index::BlockIndex;
    use tempfile::tempdir;

    #[test]
    fn test_plan_packs_runs_in_key_order() {
        let mut index = BlockIndex::<u32>::new();
        index.insert(5, 7, 2, 0);
        index.insert(1, 3, 1, 0);
        index.insert(9, 0, 0, 0);
        let plan = CompactionPlan::for_entries(index.flat());
        assert_eq!(plan.total_blocks, 3);
        assert_eq!(
            plan.moves
                .iter()
                .map(|m| (m.source_block, m.dest_block))
                .collect::<Vec<_>>(),
            vec![(3, 0), (7, 1)]
        );
        assert!(!plan.is_identity(9));
    }

    #[test]
    fn test_spans_merge_adjacent_sources() {
        let mut index = BlockIndex::<u32>::new();
        index.insert(1, 4, 2, 0);
        index.insert(2, 6, 1, 0);
        index.insert(3, 0, 1, 0);
        let plan = CompactionPlan::for_entries(index.flat());
        assert_eq!(plan.spans(), vec![(4, 3), (0, 1)]);
    }

    #[test]
    fn test_append_copies_whole_blocks_through_small_buffer() {
        let dir = tempdir().expect("tempdir");
        let src_path = dir.path().join("src.bin");
        let dest_path = dir.path().join("dest.bin");
        let source_bytes: Vec<u8> = (0..=255u8).cycle().take(64 * 10).collect();
        std::fs::write(&src_path, &source_bytes).expect("write source");

        let mut source = File::open(&src_path).expect("open source");
        let mut dest = File::create(&dest_path).expect("create dest");
        // Buffer of two blocks, spans of three and one
        let mut copier = SpanCopier::new(64, 130);
        copier
            .append((&mut source, &src_path), 5, 3, (&mut dest, &dest_path))
            .expect("first span");
        copier
            .append((&mut source, &src_path), 1, 1, (&mut dest, &dest_path))
            .expect("second span");
        drop(dest);

        let copied = std::fs::read(&dest_path).expect("read dest");
        assert_eq!(&copied[..192], &source_bytes[320..512]);
        assert_eq!(&copied[192..], &source_bytes[64..128]);
        assert_eq!(copier.bytes_copied(), 256);
    }
}

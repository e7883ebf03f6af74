//! Visit every entry in key order.

use crate::index::{BlockIndexEntry, BlockType, classify};

/// Position in a full scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlatCursor {
    pos: usize,
}

impl FlatCursor {
    /// Cursor on the first entry.
    pub const fn start() -> Self {
        Self { pos: 0 }
    }

    /// Flat position of the current entry.
    pub const fn position(self) -> usize {
        self.pos
    }

    /// Whether the scan is exhausted.
    pub const fn at_end<K>(self, flat: &[BlockIndexEntry<K>]) -> bool {
        self.pos >= flat.len()
    }

    /// Current entry.
    pub fn entry<K>(self, flat: &[BlockIndexEntry<K>]) -> Option<&BlockIndexEntry<K>> {
        flat.get(self.pos)
    }

    /// Role of the current entry.
    pub fn block_type<K: Ord>(self, flat: &[BlockIndexEntry<K>]) -> Option<BlockType> {
        (self.pos < flat.len()).then(|| classify(flat, self.pos))
    }

    /// Cursor on the following entry.
    #[must_use]
    pub const fn advance<K>(self, flat: &[BlockIndexEntry<K>]) -> Self {
        if self.pos < flat.len() {
            Self { pos: self.pos + 1 }
        } else {
            self
        }
    }
}

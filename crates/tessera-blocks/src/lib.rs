//! Block-structured keyed file store.
//!
//! A store is one data file of fixed-size blocks plus one index file that
//! maps keys to block runs. The index keeps its entries in key order and
//! tracks reusable gaps in a free list, so updates can rewrite blocks
//! without growing the file unboundedly.
//!
//! # Layout
//!
//! - `<trunk>.bin`: data blocks, each record framed and optionally compressed
//! - `<trunk>.bin.idx`: index header, entries, free list
//! - `<trunk>.bin.idx.shadow`: the writer's private copy of the index
//! - `<trunk>.bin.idx.empty`: blocks that no index references, safe for the writer
//!
//! # Traversal
//!
//! Four traversal modes walk the index: [`iter::FlatCursor`] visits every
//! entry, [`iter::DiscreteCursor`] visits the owners of a sorted key list,
//! [`iter::RangeCursor`] visits the owners of sorted half-open key ranges,
//! and [`iter::WriteCursor`] drives in-place updates. Each cursor is a
//! small value advanced by a pure function over the index.
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera_blocks::{BlockStore, StoreConfig};
//!
//! let mut store = BlockStore::<u32>::open(&dir, "nodes", StoreConfig::default())?;
//! let id = store.insert_block(7, b"payload", 4)?;
//! let entry = store.index().entry(&id).expect("inserted");
//! assert_eq!(store.read(&entry)?, b"payload");
//! store.persist()?;
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use std::path::{Path, PathBuf};
use thiserror::Error;

// Compression codec
pub mod codec;

// Store configuration
pub mod config;

// File naming
pub mod files;

// Block index and free list
pub mod index;

// Traversal cursors
pub mod iter;

// Fixed-width keys
pub mod key;

// Record kinds
pub mod record;

// Data file access
pub mod store;

// Group and segment packing
pub mod update;

pub use codec::CompressionMethod;
pub use config::StoreConfig;
pub use files::FileNames;
pub use index::{BlockIndex, BlockIndexEntry, BlockType, EntryId};
pub use key::BlockKey;
pub use record::{Record, RecordKind, RecordSet};
pub use store::{BlockStore, CompactionStats};
pub use update::{BlockUpdater, KeyChange, UpdateStats};

/// Result type for block store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during block store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A file system call failed.
    #[error("{origin}: I/O error on {}: {source}", path.display())]
    Io {
        /// Call site that issued the failing call.
        origin: &'static str,
        /// File the call operated on.
        path: PathBuf,
        /// Underlying error, including the OS error number.
        #[source]
        source: std::io::Error,
    },

    /// A block's contents contradict the index.
    #[error("Data corruption in {} at byte {offset}: {reason}", path.display())]
    Corruption {
        /// Data file holding the block.
        path: PathBuf,
        /// Byte offset of the block run.
        offset: u64,
        /// What did not match.
        reason: String,
    },

    /// A decompressed block failed its content checksum.
    #[error(
        "Checksum mismatch in {} at byte {offset}: stored {expected:#010x}, computed {actual:#010x}",
        path.display()
    )]
    Checksum {
        /// Data file holding the block.
        path: PathBuf,
        /// Byte offset of the block run.
        offset: u64,
        /// Checksum stored after the payload.
        expected: u32,
        /// Checksum of the decompressed payload.
        actual: u32,
    },

    /// Compression or decompression failed outside a block context.
    #[error("Compression error: {0}")]
    Compression(String),

    /// An index or side file is malformed.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The data file cannot address more blocks.
    #[error("Allocation failed: {0}")]
    Allocation(String),
}

impl StoreError {
    /// Build a mapper that tags an `std::io::Error` with call site and file.
    pub fn io(origin: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io {
            origin,
            path,
            source,
        }
    }

    /// Whether this error signals a file-format invariant violation.
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::Checksum { .. })
    }
}

impl From<binrw::Error> for StoreError {
    fn from(err: binrw::Error) -> Self {
        Self::InvalidFormat(err.to_string())
    }
}

/// Version information for the block store.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

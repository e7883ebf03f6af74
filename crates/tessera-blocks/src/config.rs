//! Configuration for a block store

use serde::{Deserialize, Serialize};

use crate::codec::CompressionMethod;
use crate::{Result, StoreError};

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Smallest block that still holds a record header and one key.
pub const MIN_BLOCK_SIZE: u32 = 64;

/// Configuration for one block store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Size of one data block in bytes
    pub block_size: u32,

    /// Compression applied to every block run
    pub compression: CompressionMethod,

    /// Uncompressed granularity, in blocks, when compression is enabled
    pub compression_factor: u32,

    /// Largest uncompressed payload, in blocks, packed into one group
    /// before a key is split into a segment chain
    pub max_payload_blocks: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            compression: CompressionMethod::None,
            compression_factor: 1,
            max_payload_blocks: 1,
        }
    }
}

impl StoreConfig {
    /// Create a configuration with the given block size
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            ..Default::default()
        }
    }

    /// Set the block size
    #[must_use]
    pub const fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the compression method
    #[must_use]
    pub const fn with_compression(mut self, compression: CompressionMethod) -> Self {
        self.compression = compression;
        self
    }

    /// Set the uncompressed granularity multiplier
    #[must_use]
    pub const fn with_compression_factor(mut self, factor: u32) -> Self {
        self.compression_factor = factor;
        self
    }

    /// Set the group capacity in blocks
    #[must_use]
    pub const fn with_max_payload_blocks(mut self, blocks: u32) -> Self {
        self.max_payload_blocks = blocks;
        self
    }

    /// Bytes an uncompressed payload is padded to before encoding.
    pub const fn granularity(&self) -> usize {
        if self.compression.is_compressed() {
            self.block_size as usize * self.compression_factor as usize
        } else {
            self.block_size as usize
        }
    }

    /// Bytes of logical payload the updater packs into one group.
    pub const fn group_capacity(&self) -> usize {
        self.block_size as usize * self.max_payload_blocks as usize
    }

    /// Check that the values describe a usable store.
    pub fn validate(&self) -> Result<()> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(StoreError::Config(format!(
                "block_size {} is below the minimum of {MIN_BLOCK_SIZE}",
                self.block_size
            )));
        }
        if self.compression_factor == 0 {
            return Err(StoreError::Config(
                "compression_factor must be at least 1".to_string(),
            ));
        }
        if self.max_payload_blocks == 0 {
            return Err(StoreError::Config(
                "max_payload_blocks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::default();
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.granularity(), 4096);
        config.validate().expect("default config");
    }

    #[test]
    fn test_granularity_follows_compression() {
        let config = StoreConfig::new(512)
            .with_compression(CompressionMethod::Lz4)
            .with_compression_factor(4);
        assert_eq!(config.granularity(), 2048);
        assert_eq!(config.with_compression(CompressionMethod::None).granularity(), 512);
    }

    #[test]
    fn test_validate_rejects_degenerate_values() {
        assert!(StoreConfig::new(16).validate().is_err());
        assert!(StoreConfig::default().with_compression_factor(0).validate().is_err());
        assert!(StoreConfig::default().with_max_payload_blocks(0).validate().is_err());
    }

    #[test]
    fn test_serde_partial_document() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"block_size":1024,"compression":"deflate"}"#)
                .expect("parse");
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.compression, CompressionMethod::Deflate);
        assert_eq!(config.max_payload_blocks, 1);
    }
}

//! Block compression and decompression.
//!
//! Frames produced here are what lands on disk inside a block run:
//!
//! - `None`: the input, verbatim
//! - `Deflate`: `i32 len ‖ zlib body ‖ u32 crc32(input)`
//! - `Lz4`: `i32 len ‖ body ‖ u32 crc32(input)`; a non-positive `len` means
//!   the body is the input itself because LZ4 could not shrink it
//!
//! Decoding tolerates trailing bytes after the frame, which is how block
//! padding is ignored.

use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::{Compression, Crc};
use serde::{Deserialize, Serialize};
use std::io::Read;
use thiserror::Error;

/// Maximum allowed decompression size (1 GiB).
pub const MAX_DECOMPRESSION_SIZE: usize = 1024 * 1024 * 1024;

/// Length prefix plus trailing checksum.
pub const COMPRESSED_FRAME_OVERHEAD: usize = 8;

/// Compression applied to block payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// Stored verbatim, no checksum.
    #[default]
    None,
    /// zlib stream with a trailing CRC-32.
    Deflate,
    /// LZ4 block with a trailing CRC-32.
    Lz4,
}

impl CompressionMethod {
    /// Byte stored in the index header.
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Deflate => 1,
            Self::Lz4 => 2,
        }
    }

    /// Parse the index header byte.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::None),
            1 => Some(Self::Deflate),
            2 => Some(Self::Lz4),
            _ => None,
        }
    }

    /// Whether frames carry a length prefix and checksum.
    pub const fn is_compressed(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Codec failures, without file context.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The stored checksum does not match the decompressed payload.
    #[error("checksum mismatch: stored {expected:#010x}, computed {actual:#010x}")]
    Checksum {
        /// Stored value.
        expected: u32,
        /// Recomputed value.
        actual: u32,
    },

    /// The frame is truncated or its length prefix is impossible.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The underlying compressor failed.
    #[error("{0}")]
    Backend(String),
}

/// CRC-32 of `data`.
pub fn checksum(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

/// Encode `data` into an on-disk frame.
pub fn compress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>, CodecError> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Deflate => {
            let mut encoder = ZlibEncoder::new(data, Compression::default());
            let mut body = Vec::new();
            encoder
                .read_to_end(&mut body)
                .map_err(|e| CodecError::Backend(format!("zlib compression failed: {e}")))?;
            let len = frame_len(body.len())?;
            Ok(frame(len, &body, checksum(data)))
        }
        CompressionMethod::Lz4 => {
            let body = lz4_flex::block::compress_prepend_size(data);
            if body.len() >= data.len() {
                // Incompressible: keep the input and flag it with a negative length.
                let len = frame_len(data.len())?;
                Ok(frame(-len, data, checksum(data)))
            } else {
                let len = frame_len(body.len())?;
                Ok(frame(len, &body, checksum(data)))
            }
        }
    }
}

/// Decode an on-disk frame. Trailing bytes after the frame are ignored.
pub fn decompress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>, CodecError> {
    if method == CompressionMethod::None {
        return Ok(data.to_vec());
    }

    let (len, body, expected) = split_frame(data)?;
    let decoded = match method {
        CompressionMethod::Deflate => {
            if len < 0 {
                return Err(CodecError::Malformed(format!(
                    "negative zlib frame length {len}"
                )));
            }
            inflate(body)?
        }
        CompressionMethod::Lz4 if len <= 0 => body.to_vec(),
        _ => {
            let size = body
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
                .ok_or_else(|| CodecError::Malformed("LZ4 body missing size".to_string()))?;
            if size as usize > MAX_DECOMPRESSION_SIZE {
                return Err(CodecError::Malformed(format!(
                    "LZ4 decompressed size {size} exceeds limit of {MAX_DECOMPRESSION_SIZE} bytes"
                )));
            }
            lz4_flex::block::decompress_size_prepended(body)
                .map_err(|e| CodecError::Backend(format!("LZ4 decompression failed: {e}")))?
        }
    };

    let actual = checksum(&decoded);
    if actual != expected {
        return Err(CodecError::Checksum { expected, actual });
    }
    Ok(decoded)
}

fn frame_len(len: usize) -> Result<i32, CodecError> {
    i32::try_from(len).map_err(|_| CodecError::Malformed(format!("frame body of {len} bytes")))
}

fn frame(len: i32, body: &[u8], crc: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + COMPRESSED_FRAME_OVERHEAD);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

fn split_frame(data: &[u8]) -> Result<(i32, &[u8], u32), CodecError> {
    let len = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .map(i32::from_le_bytes)
        .ok_or_else(|| CodecError::Malformed("frame shorter than its length prefix".to_string()))?;
    let body_len = len.unsigned_abs() as usize;
    let body = data.get(4..4 + body_len).ok_or_else(|| {
        CodecError::Malformed(format!(
            "frame body of {body_len} bytes exceeds {} available",
            data.len().saturating_sub(4)
        ))
    })?;
    let crc = data
        .get(4 + body_len..8 + body_len)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| CodecError::Malformed("frame missing checksum".to_string()))?;
    Ok((len, body, crc))
}

fn inflate(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = ZlibDecoder::new(body);
    let mut decompressed = Vec::new();

    // Read in chunks to enforce size limit
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = decoder
            .read(&mut buffer)
            .map_err(|e| CodecError::Backend(format!("zlib decompression failed: {e}")))?;

        if bytes_read == 0 {
            break;
        }

        if decompressed.len() + bytes_read > MAX_DECOMPRESSION_SIZE {
            return Err(CodecError::Malformed(format!(
                "decompressed size exceeds limit of {MAX_DECOMPRESSION_SIZE} bytes"
            )));
        }

        decompressed.extend_from_slice(&buffer[..bytes_read]);
    }

    Ok(decompressed)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    const METHODS: [CompressionMethod; 3] = [
        CompressionMethod::None,
        CompressionMethod::Deflate,
        CompressionMethod::Lz4,
    ];

    #[test]
    fn test_none_is_verbatim() {
        let data = b"way 42 nodes";
        let framed = compress(data, CompressionMethod::None).expect("compress");
        assert_eq!(framed, data);
    }

    #[test]
    fn test_method_byte_round_trip() {
        for method in METHODS {
            assert_eq!(CompressionMethod::from_byte(method.as_byte()), Some(method));
        }
        assert_eq!(CompressionMethod::from_byte(9), None);
    }

    #[test]
    fn test_trailing_padding_ignored() {
        let data = vec![7u8; 3000];
        for method in [CompressionMethod::Deflate, CompressionMethod::Lz4] {
            let mut framed = compress(&data, method).expect("compress");
            framed.resize(framed.len() + 512, 0);
            assert_eq!(decompress(&framed, method).expect("decompress"), data);
        }
    }

    #[test]
    fn test_lz4_incompressible_is_stored() {
        // A de Bruijn-like byte walk that LZ4 cannot shrink.
        let data: Vec<u8> = (0..64u32).map(|i| (i * 37 % 251) as u8).collect();
        let framed = compress(&data, CompressionMethod::Lz4).expect("compress");
        let len = i32::from_le_bytes(framed[..4].try_into().expect("prefix"));
        assert!(len < 0);
        assert_eq!(&framed[4..4 + data.len()], data.as_slice());
        assert_eq!(decompress(&framed, CompressionMethod::Lz4).expect("decompress"), data);
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let data = vec![1u8; 4096];
        for method in [CompressionMethod::Deflate, CompressionMethod::Lz4] {
            let mut framed = compress(&data, method).expect("compress");
            let last = framed.len() - 1;
            framed[last] ^= 0xFF;
            let err = decompress(&framed, method).expect_err("checksum must fail");
            assert!(matches!(err, CodecError::Checksum { .. }));
        }
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let framed = compress(&[5u8; 100], CompressionMethod::Deflate).expect("compress");
        assert!(matches!(
            decompress(&framed[..framed.len() - 6], CompressionMethod::Deflate),
            Err(CodecError::Malformed(_))
        ));
        assert!(decompress(&[1, 2], CompressionMethod::Lz4).is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;
        use proptest::test_runner::TestCaseError;

        fn method() -> impl Strategy<Value = CompressionMethod> {
            prop_oneof![
                Just(CompressionMethod::None),
                Just(CompressionMethod::Deflate),
                Just(CompressionMethod::Lz4),
            ]
        }

        proptest! {
            #[test]
            fn round_trip_any_payload(
                data in prop::collection::vec(any::<u8>(), 0..4096),
                method in method()
            ) {
                let framed = compress(&data, method)
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                let decoded = decompress(&framed, method)
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert_eq!(decoded, data);
            }
        }
    }
}

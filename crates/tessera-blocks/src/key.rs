//! Fixed-width, binary-comparable index keys.
//!
//! Keys are encoded big-endian so that byte order equals key order. The
//! index file stores only the encoded bytes; the width is recorded in the
//! index header so side tools can walk entries without knowing the type.

use std::fmt::Debug;

/// A totally ordered key with a fixed-width binary encoding.
pub trait BlockKey: Ord + Clone + Debug {
    /// Encoded width in bytes.
    const WIDTH: usize;

    /// Append the encoded key to `out`.
    fn encode(&self, out: &mut Vec<u8>);

    /// Decode a key from the first `WIDTH` bytes of `bytes`.
    ///
    /// Returns `None` if `bytes` is too short.
    fn decode(bytes: &[u8]) -> Option<Self>;

    /// Encode into a fresh buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIDTH);
        self.encode(&mut out);
        out
    }
}

impl BlockKey for u32 {
    const WIDTH: usize = 4;

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_be_bytes());
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        bytes.get(..4)?.try_into().ok().map(Self::from_be_bytes)
    }
}

impl BlockKey for u64 {
    const WIDTH: usize = 8;

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_be_bytes());
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        bytes.get(..8)?.try_into().ok().map(Self::from_be_bytes)
    }
}

impl<const N: usize> BlockKey for [u8; N] {
    const WIDTH: usize = N;

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        bytes.get(..N)?.try_into().ok()
    }
}

//! QuickXOR content hash.
//!
//! OneDrive validates file content with a 160-bit non-cryptographic
//! hash: every input byte is XORed into the digest at a bit position
//! that advances 11 bits per byte and wraps at 160, and the total input
//! length is XORed into the trailing 64 bits of the digest. The wire
//! form is the standard base64 encoding of the 20-byte digest.
//!
//! The hash is used to verify downloads against the metadata the
//! remote reported and to verify uploads after completion.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Digest width in bits.
const WIDTH_BITS: usize = 160;

/// Digest width in bytes.
const WIDTH_BYTES: usize = WIDTH_BITS / 8;

/// Bit distance between consecutive input bytes.
const SHIFT: usize = 11;

// ============================================================================
// Streaming hasher
// ============================================================================

/// Incremental QuickXOR hasher.
///
/// Feed content with [`update`](Self::update) in any chunking; the
/// result is independent of chunk boundaries.
#[derive(Debug, Clone)]
pub struct QuickXorHash {
    data: [u8; WIDTH_BYTES],
    bit_pos: usize,
    length: u64,
}

impl QuickXorHash {
    pub fn new() -> Self {
        Self {
            data: [0u8; WIDTH_BYTES],
            bit_pos: 0,
            length: 0,
        }
    }

    /// Absorbs a chunk of content.
    pub fn update(&mut self, buf: &[u8]) {
        for &b in buf {
            let idx = self.bit_pos / 8;
            let bit = self.bit_pos % 8;
            // A byte lands across at most two digest bytes; the wrap at
            // bit 160 is byte-aligned, so index arithmetic mod 20 holds.
            let v = (b as u16) << bit;
            self.data[idx] ^= (v & 0xff) as u8;
            self.data[(idx + 1) % WIDTH_BYTES] ^= (v >> 8) as u8;
            self.bit_pos = (self.bit_pos + SHIFT) % WIDTH_BITS;
            self.length = self.length.wrapping_add(1);
        }
    }

    /// Finishes the hash and returns the 20-byte digest.
    pub fn finalize(mut self) -> [u8; WIDTH_BYTES] {
        let len = self.length.to_le_bytes();
        for (i, b) in len.iter().enumerate() {
            self.data[WIDTH_BYTES - 8 + i] ^= b;
        }
        self.data
    }

    /// Finishes the hash and returns the base64 wire form.
    pub fn finalize_base64(self) -> String {
        BASE64.encode(self.finalize())
    }

    /// Convenience one-shot hash of a byte slice.
    pub fn hash_base64(data: &[u8]) -> String {
        let mut h = Self::new();
        h.update(data);
        h.finalize_base64()
    }
}

impl Default for QuickXorHash {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Wire value
// ============================================================================

/// A QuickXOR digest in its base64 wire form.
///
/// Comparison is exact string equality; the remote always emits the
/// padded 28-character encoding, and so do we.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuickXor(String);

impl QuickXor {
    /// Validates and wraps a wire-form digest.
    pub fn new(encoded: impl Into<String>) -> Result<Self, crate::error::CoreError> {
        let encoded = encoded.into();
        match BASE64.decode(&encoded) {
            Ok(raw) if raw.len() == WIDTH_BYTES => Ok(QuickXor(encoded)),
            _ => Err(crate::error::CoreError::InvalidHash(encoded)),
        }
    }

    /// Hashes `data` and wraps the result.
    pub fn of(data: &[u8]) -> Self {
        QuickXor(QuickXorHash::hash_base64(data))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuickXor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//! Content fingerprints used to key compiled shader and pipeline artifacts.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A 128-bit content fingerprint identifying one compilation unit.
///
/// The fingerprint covers the semantic content of a shader stage or whole
/// pipeline together with its compilation options. Two units with the same
/// `CacheKey` are assumed to produce identical binaries, so the cache may
/// hand out one unit's artifact for the other. Keys are produced by the
/// compiler front end; the cache never computes them.
///
/// The value is immutable once constructed and can be viewed as 16 bytes,
/// two 64-bit words, or four 32-bit words.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey([u8; 16]);

impl CacheKey {
    /// Size of a key in bytes.
    pub const SIZE: usize = 16;

    /// Constructs a key from its raw 16-byte representation.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Constructs a key from two 64-bit words (low word first).
    pub fn from_words(lo: u64, hi: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&lo.to_le_bytes());
        bytes[8..].copy_from_slice(&hi.to_le_bytes());
        Self(bytes)
    }

    /// Constructs a key from four 32-bit words.
    pub fn from_dwords(a: u32, b: u32, c: u32, d: u32) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&a.to_le_bytes());
        bytes[4..8].copy_from_slice(&b.to_le_bytes());
        bytes[8..12].copy_from_slice(&c.to_le_bytes());
        bytes[12..].copy_from_slice(&d.to_le_bytes());
        Self(bytes)
    }

    /// Computes a key from a byte slice using XXH3-128.
    ///
    /// Convenience for producers that fingerprint raw content; the cache
    /// itself only ever consumes pre-computed keys.
    pub fn digest(data: &[u8]) -> Self {
        let hash = xxhash_rust::xxh3::xxh3_128(data);
        Self(hash.to_le_bytes())
    }

    /// Returns the raw 16-byte representation.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns the key as two 64-bit words (low word first).
    pub fn words(&self) -> [u64; 2] {
        [
            u64::from_le_bytes(self.0[..8].try_into().unwrap()),
            u64::from_le_bytes(self.0[8..].try_into().unwrap()),
        ]
    }

    /// Returns the key as four 32-bit words.
    pub fn dwords(&self) -> [u32; 4] {
        [
            u32::from_le_bytes(self.0[..4].try_into().unwrap()),
            u32::from_le_bytes(self.0[4..8].try_into().unwrap()),
            u32::from_le_bytes(self.0[8..12].try_into().unwrap()),
            u32::from_le_bytes(self.0[12..].try_into().unwrap()),
        ]
    }
}

impl Ord for CacheKey {
    /// Total order: lexicographic over the 64-bit halves, low word first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.words().cmp(&other.words())
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

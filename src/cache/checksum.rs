//! Entry Integrity Checksums
//!
//! CRC32 (IEEE) over an entry's logical content, widened to 64 bits by repeating
//! the 32-bit value in both halves so a zeroed or half-overwritten field never
//! validates. Non-cryptographic; it exists to catch storage and transit corruption.

use crc32fast::Hasher;

/// Incremental checksum builder
#[derive(Clone, Default)]
pub struct Checksummer {
    hasher: Hasher,
}

impl std::fmt::Debug for Checksummer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checksummer").finish_non_exhaustive()
    }
}

impl Checksummer {
    /// Start a new checksum
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes
    #[inline]
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(bytes);
        self
    }

    /// Finish and widen to 64 bits
    #[inline]
    pub fn finish(self) -> u64 {
        widen(self.hasher.finalize())
    }
}

#[inline]
fn widen(crc: u32) -> u64 {
    let h = crc as u64;
    h | (h << 32)
}

/// Checksum of a single byte slice
pub fn checksum(bytes: &[u8]) -> u64 {
    let mut c = Checksummer::new();
    c.update(bytes);
    c.finish()
}

/// Checksum of an entry: hash (big-endian), then key bytes, then value bytes.
///
/// Chain and LRU links are not part of the content and are never covered.
pub fn entry_checksum(hash: u64, key: &[u8], value: &[u8]) -> u64 {
    let mut c = Checksummer::new();
    c.update(&hash.to_be_bytes()).update(key).update(value);
    c.finish()
}

/// True if `expected` matches the checksum of `bytes`
pub fn verify(bytes: &[u8], expected: u64) -> bool {
    checksum(bytes) == expected
}

//! Entry Layout
//!
//! Binary shape of one stored record inside its off-heap block:
//!
//! ```text
//! offset  0: hash       u64
//! offset  8: checksum   u64   (hash + key + value)
//! offset 16: key_len    u32
//! offset 20: value_len  u32
//! offset 24: key bytes, then value bytes
//! ```
//!
//! Integers are stored in native byte order; this form never leaves the process.
//! Snapshots re-encode entries through the persistence stream's explicit format.
//!
//! Chain and LRU links are kept by the owning segment, outside the block, so the
//! block content is immutable once written.

use bytes::Bytes;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

use super::alloc::{Allocator, OffHeapBlock};
use super::checksum;
use crate::error::{Error, Result};

/// Size of the fixed entry header in bytes
pub const HEADER_SIZE: usize = 24;

const HASH_OFFSET: usize = 0;
const CHECKSUM_OFFSET: usize = 8;
const KEY_LEN_OFFSET: usize = 16;
const VALUE_LEN_OFFSET: usize = 20;

/// Hash used for segment routing and bucket placement
#[inline]
pub fn hash_key(key: &[u8]) -> u64 {
    xxh3_64(key)
}

/// Total allocated footprint of an entry with the given key and value
pub fn footprint(key_len: usize, value_len: usize) -> Result<usize> {
    if key_len > u32::MAX as usize || value_len > u32::MAX as usize {
        return Err(Error::Config(format!(
            "key ({} bytes) or value ({} bytes) exceeds the 4 GiB entry field limit",
            key_len, value_len
        )));
    }
    HEADER_SIZE
        .checked_add(key_len)
        .and_then(|n| n.checked_add(value_len))
        .ok_or_else(|| Error::Config("entry size overflows usize".into()))
}

/// One stored record: an exclusively owned off-heap block in entry layout
#[derive(Debug)]
pub struct Entry {
    block: OffHeapBlock,
}

impl Entry {
    /// Allocate and encode an entry, or `None` if the allocator is exhausted.
    ///
    /// Callers must have checked the sizes with [`footprint`].
    pub fn try_encode(
        allocator: &Arc<dyn Allocator>,
        hash: u64,
        key: &[u8],
        value: &[u8],
    ) -> Option<Self> {
        let size = HEADER_SIZE + key.len() + value.len();
        let mut block = OffHeapBlock::allocate(allocator, size)?;

        let sum = checksum::entry_checksum(hash, key, value);
        block[HASH_OFFSET..HASH_OFFSET + 8].copy_from_slice(&hash.to_ne_bytes());
        block[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8].copy_from_slice(&sum.to_ne_bytes());
        block[KEY_LEN_OFFSET..KEY_LEN_OFFSET + 4]
            .copy_from_slice(&(key.len() as u32).to_ne_bytes());
        block[VALUE_LEN_OFFSET..VALUE_LEN_OFFSET + 4]
            .copy_from_slice(&(value.len() as u32).to_ne_bytes());
        block[HEADER_SIZE..HEADER_SIZE + key.len()].copy_from_slice(key);
        block[HEADER_SIZE + key.len()..].copy_from_slice(value);

        Some(Self { block })
    }

    /// Allocate and encode an entry, failing with `Error::OutOfMemory`
    pub fn encode(
        allocator: &Arc<dyn Allocator>,
        hash: u64,
        key: &[u8],
        value: &[u8],
    ) -> Result<Self> {
        let size = footprint(key.len(), value.len())?;
        Self::try_encode(allocator, hash, key, value).ok_or(Error::OutOfMemory {
            requested: size,
            allocator: allocator.name(),
        })
    }

    #[inline]
    fn read_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.block[offset..offset + 8]);
        u64::from_ne_bytes(buf)
    }

    #[inline]
    fn read_u32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.block[offset..offset + 4]);
        u32::from_ne_bytes(buf)
    }

    /// Key hash
    #[inline]
    pub fn hash(&self) -> u64 {
        self.read_u64(HASH_OFFSET)
    }

    /// Stored checksum
    #[inline]
    pub fn stored_checksum(&self) -> u64 {
        self.read_u64(CHECKSUM_OFFSET)
    }

    /// Key length in bytes
    #[inline]
    pub fn key_len(&self) -> usize {
        self.read_u32(KEY_LEN_OFFSET) as usize
    }

    /// Value length in bytes
    #[inline]
    pub fn value_len(&self) -> usize {
        self.read_u32(VALUE_LEN_OFFSET) as usize
    }

    /// Key bytes, borrowed from off-heap memory
    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.block[HEADER_SIZE..HEADER_SIZE + self.key_len()]
    }

    /// Value bytes, borrowed from off-heap memory
    #[inline]
    pub fn value(&self) -> &[u8] {
        let start = HEADER_SIZE + self.key_len();
        &self.block[start..start + self.value_len()]
    }

    /// Copy the key out of off-heap memory
    pub fn decode_key(&self) -> Bytes {
        Bytes::copy_from_slice(self.key())
    }

    /// Copy the value out of off-heap memory
    pub fn decode_value(&self) -> Bytes {
        Bytes::copy_from_slice(self.value())
    }

    /// Total allocated footprint (header + key + value)
    #[inline]
    pub fn size_of(&self) -> usize {
        self.block.len()
    }

    /// True if this entry holds `key` under `hash`.
    ///
    /// The hash is a fast pre-check; equality is decided on the full key bytes.
    #[inline]
    pub fn matches(&self, hash: u64, key: &[u8]) -> bool {
        self.hash() == hash && self.key() == key
    }

    /// Recompute the checksum and compare with the stored one
    pub fn validate(&self) -> bool {
        self.verify().is_ok()
    }

    /// Like [`Entry::validate`] but reports both values on mismatch
    pub fn verify(&self) -> Result<()> {
        let key_len = self.key_len();
        let value_len = self.value_len();
        if HEADER_SIZE + key_len + value_len != self.block.len() {
            return Err(Error::corrupt(format!(
                "entry header declares {} + {} payload bytes in a {}-byte block",
                key_len,
                value_len,
                self.block.len()
            )));
        }

        let stored = self.stored_checksum();
        let computed = checksum::entry_checksum(self.hash(), self.key(), self.value());
        if stored != computed {
            return Err(Error::ChecksumMismatch { stored, computed });
        }
        Ok(())
    }

    /// Raw block access, used by tests to simulate memory corruption
    #[cfg(test)]
    pub(crate) fn block_mut(&mut self) -> &mut OffHeapBlock {
        &mut self.block
    }
}

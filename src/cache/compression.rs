//! Block Compression for Snapshot Streams
//!
//! LZ4 block format with a prepended little-endian size, or a pass-through codec
//! for plain streams. Both work buffer-to-buffer so stream buffers can live in
//! allocator-provided blocks.

use lz4::block::CompressionMode;

use crate::error::{Error, Result};

/// Bytes LZ4 prepends to each compressed block (decompressed size)
pub const LZ4_SIZE_PREFIX: usize = 4;

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported block codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// LZ4 - fast compression
    #[default]
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Algorithm for a stream written with or without compression
    pub fn for_stream(compressed: bool) -> Self {
        if compressed {
            CompressionAlgorithm::Lz4
        } else {
            CompressionAlgorithm::None
        }
    }

    /// Codec implementing this algorithm
    pub fn compressor(&self) -> Box<dyn Compressor> {
        match self {
            CompressionAlgorithm::None => Box::new(NoopCompressor),
            CompressionAlgorithm::Lz4 => Box::new(Lz4Compressor::new()),
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Buffer-to-buffer block codec
pub trait Compressor: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Largest encoded size of a block holding `block_size` bytes
    fn max_compressed_len(&self, block_size: usize) -> Result<usize>;

    /// Encode `src` into `dst`, returning the encoded length
    fn compress_into(&self, src: &[u8], dst: &mut [u8]) -> Result<usize>;

    /// Decode `src` into `dst`, returning the decoded length
    fn decompress_into(&self, src: &[u8], dst: &mut [u8]) -> Result<usize>;
}

// =============================================================================
// No-Op Compressor
// =============================================================================

/// Pass-through codec (no compression)
#[derive(Debug, Default)]
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn max_compressed_len(&self, block_size: usize) -> Result<usize> {
        Ok(block_size)
    }

    fn compress_into(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        if dst.len() < src.len() {
            return Err(Error::CompressionFailed {
                algorithm: "none".into(),
                reason: format!("{} bytes do not fit a {}-byte buffer", src.len(), dst.len()),
            });
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    fn decompress_into(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        if dst.len() < src.len() {
            return Err(Error::corrupt(format!(
                "{}-byte block exceeds the {}-byte block size",
                src.len(),
                dst.len()
            )));
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }
}

// =============================================================================
// LZ4 Compressor
// =============================================================================

/// LZ4 block codec
#[derive(Debug)]
pub struct Lz4Compressor {
    level: Option<i32>,
}

impl Lz4Compressor {
    /// Create new LZ4 compressor with default (fast) settings
    pub fn new() -> Self {
        Self { level: None }
    }

    /// Create with high-compression mode at the given level
    pub fn with_level(level: i32) -> Self {
        Self { level: Some(level) }
    }

    fn mode(&self) -> Option<CompressionMode> {
        self.level.map(CompressionMode::HIGHCOMPRESSION)
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn max_compressed_len(&self, block_size: usize) -> Result<usize> {
        let bound = lz4::block::compress_bound(block_size).map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })?;
        Ok(bound + LZ4_SIZE_PREFIX)
    }

    fn compress_into(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        lz4::block::compress_to_buffer(src, self.mode(), true, dst).map_err(|e| {
            Error::CompressionFailed {
                algorithm: "LZ4".into(),
                reason: e.to_string(),
            }
        })
    }

    fn decompress_into(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        if src.len() < LZ4_SIZE_PREFIX {
            return Err(Error::corrupt(format!(
                "{}-byte LZ4 block is shorter than its size prefix",
                src.len()
            )));
        }
        let declared = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if declared > dst.len() {
            return Err(Error::corrupt(format!(
                "LZ4 block declares {} decoded bytes, block size is {}",
                declared,
                dst.len()
            )));
        }

        let decoded = lz4::block::decompress_to_buffer(src, None, dst)
            .map_err(|e| Error::corrupt(format!("invalid LZ4 block: {}", e)))?;
        if decoded != declared {
            return Err(Error::corrupt(format!(
                "LZ4 block decoded to {} bytes, {} declared",
                decoded, declared
            )));
        }
        Ok(decoded)
    }
}

// =============================================================================
// Tests
// =============================================================================

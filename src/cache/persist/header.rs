//! Fixed 16-byte stream header

use std::io::{Read, Write};

use super::{
    read_fully, HEADER_LEN, MAGIC_COMPRESSED, MAGIC_PLAIN, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
    STREAM_VERSION,
};
use crate::cache::compression::{CompressionAlgorithm, Compressor};
use crate::error::{Error, Result};

/// Decoded stream header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Block codec selected by the magic
    pub algorithm: CompressionAlgorithm,
    /// Stream format version
    pub version: u32,
    /// Largest decoded block in bytes
    pub block_size: u32,
    /// Largest encoded block in bytes
    pub max_compressed_block_size: u32,
}

impl StreamHeader {
    /// Header for a new stream with the given codec and block size
    pub fn new(compressor: &dyn Compressor, block_size: u32) -> Result<Self> {
        check_block_size(block_size)?;
        let max = compressor.max_compressed_len(block_size as usize)?;
        let max_compressed_block_size = u32::try_from(max)
            .map_err(|_| Error::Config(format!("block size {} too large", block_size)))?;
        Ok(Self {
            algorithm: compressor.algorithm(),
            version: STREAM_VERSION,
            block_size,
            max_compressed_block_size,
        })
    }

    /// True if blocks are LZ4-compressed
    pub fn is_compressed(&self) -> bool {
        self.algorithm == CompressionAlgorithm::Lz4
    }

    fn magic(&self) -> u32 {
        match self.algorithm {
            CompressionAlgorithm::Lz4 => MAGIC_COMPRESSED,
            CompressionAlgorithm::None => MAGIC_PLAIN,
        }
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.magic().to_be_bytes());
        buf[4..8].copy_from_slice(&self.version.to_be_bytes());
        buf[8..12].copy_from_slice(&self.block_size.to_be_bytes());
        buf[12..16].copy_from_slice(&self.max_compressed_block_size.to_be_bytes());
        buf
    }

    /// Parse and validate wire bytes.
    ///
    /// Magic is checked before anything else is trusted: the byte-swapped form of a
    /// known magic is `WrongArchitecture`, any other unknown value is corrupt.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        let word = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);

        let magic = word(0);
        let algorithm = match magic {
            MAGIC_COMPRESSED => CompressionAlgorithm::Lz4,
            MAGIC_PLAIN => CompressionAlgorithm::None,
            m if m == MAGIC_COMPRESSED.swap_bytes() || m == MAGIC_PLAIN.swap_bytes() => {
                return Err(Error::WrongArchitecture)
            }
            m => return Err(Error::corrupt(format!("illegal stream magic {:#010x}", m))),
        };

        let version = word(4);
        if version != STREAM_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let block_size = word(8);
        check_block_size(block_size).map_err(|_| {
            Error::corrupt(format!("header block size {} out of bounds", block_size))
        })?;

        let max_compressed_block_size = word(12);
        let expected = algorithm
            .compressor()
            .max_compressed_len(block_size as usize)?;
        if max_compressed_block_size as usize != expected {
            return Err(Error::corrupt(format!(
                "header max compressed block size {} does not match block size {} (expected {})",
                max_compressed_block_size, block_size, expected
            )));
        }

        Ok(Self {
            algorithm,
            version,
            block_size,
            max_compressed_block_size,
        })
    }

    /// Read and validate a header from the start of a stream
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_LEN];
        let n = read_fully(reader, &mut buf)?;
        if n < HEADER_LEN {
            return Err(Error::eof(format!(
                "stream header truncated after {} of {} bytes",
                n, HEADER_LEN
            )));
        }
        Self::decode(&buf)
    }

    /// Write the header to the start of a stream
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }
}

fn check_block_size(block_size: u32) -> Result<()> {
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(Error::Config(format!(
            "block size {} must be between {} and {}",
            block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
        )));
    }
    Ok(())
}

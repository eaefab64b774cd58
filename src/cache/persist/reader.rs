//! Block-decoding reader

use std::io::{self, Read};
use std::sync::Arc;

use super::header::StreamHeader;
use super::read_fully;
use crate::cache::alloc::{Allocator, OffHeapBlock};
use crate::cache::compression::Compressor;
use crate::error::{Error, Result};

struct Buffers {
    encoded: OffHeapBlock,
    decoded: OffHeapBlock,
}

/// Reads a stream written by [`BlockWriter`](super::BlockWriter) and yields the
/// decoded payload bytes.
///
/// Any framing or decoding failure is fatal; no partial recovery is attempted.
pub struct BlockReader<R: Read> {
    inner: R,
    header: StreamHeader,
    compressor: Box<dyn Compressor>,
    buffers: Option<Buffers>,
    pos: usize,
    len: usize,
    eof: bool,
    blocks_read: u64,
}

impl<R: Read> BlockReader<R> {
    /// Read and validate the header, then allocate buffers sized from it
    pub fn open(mut inner: R, allocator: &Arc<dyn Allocator>) -> Result<Self> {
        let header = StreamHeader::read_from(&mut inner)?;
        let buffers = Buffers {
            encoded: OffHeapBlock::allocate_or_err(
                allocator,
                header.max_compressed_block_size as usize,
            )?,
            decoded: OffHeapBlock::allocate_or_err(allocator, header.block_size as usize)?,
        };

        tracing::debug!(
            algorithm = %header.algorithm,
            block_size = header.block_size,
            "snapshot stream opened for reading"
        );

        Ok(Self {
            inner,
            compressor: header.algorithm.compressor(),
            header,
            buffers: Some(buffers),
            pos: 0,
            len: 0,
            eof: false,
            blocks_read: 0,
        })
    }

    /// Header read from the stream
    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Blocks decoded so far
    pub fn blocks_read(&self) -> u64 {
        self.blocks_read
    }

    /// Load the next block; false at clean end of input
    fn next_block(&mut self) -> Result<bool> {
        let Some(Buffers { encoded, decoded }) = self.buffers.as_mut() else {
            return Err(Error::Closed("snapshot reader"));
        };

        let mut prefix = [0u8; 4];
        match read_fully(&mut self.inner, &mut prefix)? {
            0 => {
                self.eof = true;
                return Ok(false);
            }
            4 => {}
            n => {
                return Err(Error::eof(format!(
                    "block length truncated after {} bytes",
                    n
                )))
            }
        }

        let encoded_len = u32::from_be_bytes(prefix) as usize;
        if encoded_len == 0 {
            return Err(Error::corrupt(format!(
                "zero-length block after block {}",
                self.blocks_read
            )));
        }
        if encoded_len > self.header.max_compressed_block_size as usize {
            return Err(Error::corrupt(format!(
                "block length {} exceeds maximum {}",
                encoded_len, self.header.max_compressed_block_size
            )));
        }

        let got = read_fully(&mut self.inner, &mut encoded[..encoded_len])?;
        if got != encoded_len {
            return Err(Error::eof(format!(
                "block {} truncated: {} of {} bytes",
                self.blocks_read, got, encoded_len
            )));
        }

        let n = self
            .compressor
            .decompress_into(&encoded[..encoded_len], decoded)?;
        if n == 0 {
            return Err(Error::corrupt(format!(
                "block {} decodes to no data",
                self.blocks_read
            )));
        }

        self.pos = 0;
        self.len = n;
        self.blocks_read += 1;
        Ok(true)
    }

    /// Copy decoded bytes into `buf`, loading blocks as needed; 0 at end of stream
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.buffers.is_none() {
            return Err(Error::Closed("snapshot reader"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.len {
            if self.eof || !self.next_block()? {
                return Ok(0);
            }
        }

        let Some(buffers) = self.buffers.as_ref() else {
            return Err(Error::Closed("snapshot reader"));
        };
        let n = (self.len - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&buffers.decoded[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    /// Fill `buf` completely, returning the count read before a clean end of stream
    pub fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_bytes(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Release the buffers. Idempotent.
    pub fn close(&mut self) {
        if self.buffers.take().is_some() {
            tracing::debug!(blocks = self.blocks_read, "snapshot stream closed");
        }
    }

    /// Close and hand back the underlying reader
    pub fn into_inner(mut self) -> R {
        self.close();
        self.inner
    }
}

impl<R: Read> Read for BlockReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_bytes(buf)?)
    }
}

impl<R: Read> std::fmt::Debug for BlockReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockReader")
            .field("header", &self.header)
            .field("blocks_read", &self.blocks_read)
            .field("eof", &self.eof)
            .field("closed", &self.buffers.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::alloc::HeapAllocator;
    use crate::cache::compression::CompressionAlgorithm;
    use crate::cache::persist::{BlockWriter, HEADER_LEN};
    use assert_matches::assert_matches;

    fn allocator() -> Arc<dyn Allocator> {
        Arc::new(HeapAllocator::new())
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn stream(algorithm: CompressionAlgorithm, payload: &[u8]) -> Vec<u8> {
        let alloc = allocator();
        let mut w = BlockWriter::new(Vec::new(), &alloc, algorithm, 1024).unwrap();
        w.write_bytes(payload).unwrap();
        w.finish().unwrap()
    }

    #[test]
    fn test_read_back_both_codecs() {
        let payload = pattern(5000);
        for algorithm in [CompressionAlgorithm::None, CompressionAlgorithm::Lz4] {
            let bytes = stream(algorithm, &payload);
            let alloc = allocator();
            let mut r = BlockReader::open(&bytes[..], &alloc).unwrap();
            let mut out = Vec::new();
            r.read_to_end(&mut out).unwrap();
            assert_eq!(out, payload);
            assert_eq!(r.blocks_read(), 5);
        }
    }

    #[test]
    fn test_reads_smaller_and_larger_than_block() {
        let payload = pattern(3000);
        let bytes = stream(CompressionAlgorithm::Lz4, &payload);
        let alloc = allocator();
        let mut r = BlockReader::open(&bytes[..], &alloc).unwrap();

        let mut small = [0u8; 7];
        assert_eq!(r.read_bytes(&mut small).unwrap(), 7);
        assert_eq!(&small, &payload[..7]);

        // larger than a block: fill spans several blocks
        let mut big = vec![0u8; 2500];
        assert_eq!(r.fill(&mut big).unwrap(), 2500);
        assert_eq!(&big[..], &payload[7..2507]);

        let mut rest = vec![0u8; 1000];
        assert_eq!(r.fill(&mut rest).unwrap(), 493);
        assert_eq!(r.read_bytes(&mut rest).unwrap(), 0);
    }

    #[test]
    fn test_empty_stream() {
        let bytes = stream(CompressionAlgorithm::Lz4, &[]);
        let alloc = allocator();
        let mut r = BlockReader::open(&bytes[..], &alloc).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(r.read_bytes(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_zero_length_block_is_corrupt() {
        let mut bytes = stream(CompressionAlgorithm::None, &pattern(10));
        bytes.extend_from_slice(&0u32.to_be_bytes());
        let alloc = allocator();
        let mut r = BlockReader::open(&bytes[..], &alloc).unwrap();
        let mut out = vec![0u8; 64];
        assert_eq!(r.fill(&mut out[..10]).unwrap(), 10);
        assert_matches!(r.read_bytes(&mut out), Err(Error::CorruptStream(_)));
    }

    #[test]
    fn test_truncated_length_prefix() {
        let mut bytes = stream(CompressionAlgorithm::None, &pattern(10));
        bytes.extend_from_slice(&[0, 0]);
        let alloc = allocator();
        let mut r = BlockReader::open(&bytes[..], &alloc).unwrap();
        let mut out = vec![0u8; 64];
        assert_matches!(r.fill(&mut out), Err(Error::UnexpectedEof(_)));
    }

    #[test]
    fn test_truncated_block() {
        let bytes = stream(CompressionAlgorithm::Lz4, &pattern(2000));
        let cut = &bytes[..bytes.len() - 5];
        let alloc = allocator();
        let mut r = BlockReader::open(cut, &alloc).unwrap();
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_oversized_block_length() {
        let mut bytes = stream(CompressionAlgorithm::None, &[]);
        bytes.extend_from_slice(&4096u32.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 4096]);
        let alloc = allocator();
        let mut r = BlockReader::open(&bytes[..], &alloc).unwrap();
        let mut out = [0u8; 8];
        assert_matches!(r.read_bytes(&mut out), Err(Error::CorruptStream(_)));
    }

    #[test]
    fn test_garbage_compressed_block() {
        let mut bytes = stream(CompressionAlgorithm::Lz4, &[]);
        let mut block = vec![0xFFu8; 32];
        block[..4].copy_from_slice(&512u32.to_le_bytes());
        bytes.extend_from_slice(&(block.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&block);

        let alloc = allocator();
        let mut r = BlockReader::open(&bytes[..], &alloc).unwrap();
        let mut out = [0u8; 8];
        assert_matches!(r.read_bytes(&mut out), Err(Error::CorruptStream(_)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let bytes = stream(CompressionAlgorithm::Lz4, &pattern(100));
        let alloc = allocator();
        let mut r = BlockReader::open(&bytes[..], &alloc).unwrap();
        assert!(alloc.total_allocated() > 0);
        r.close();
        r.close();
        assert_eq!(alloc.total_allocated(), 0);
        let mut out = [0u8; 8];
        assert_matches!(r.read_bytes(&mut out), Err(Error::Closed(_)));
    }

    #[test]
    fn test_header_errors_before_allocation() {
        let alloc = allocator();
        let mut bytes = stream(CompressionAlgorithm::Lz4, &pattern(100));
        bytes[0..4].reverse();
        assert_matches!(
            BlockReader::open(&bytes[..], &alloc),
            Err(Error::WrongArchitecture)
        );
        assert_matches!(
            BlockReader::open(&bytes[..HEADER_LEN - 1], &alloc),
            Err(Error::UnexpectedEof(_))
        );
        assert_eq!(alloc.total_allocated(), 0);
    }
}

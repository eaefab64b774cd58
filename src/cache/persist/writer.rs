//! Block-framing writer

use std::io::{self, Write};
use std::sync::Arc;

use super::header::StreamHeader;
use crate::cache::alloc::{Allocator, OffHeapBlock};
use crate::cache::compression::{CompressionAlgorithm, Compressor};
use crate::error::{Error, Result};

struct Buffers {
    block: OffHeapBlock,
    encoded: OffHeapBlock,
}

/// Writes a stream header, then buffers payload bytes into blocks of at most
/// `block_size` bytes, encoding and length-prefixing each full block.
///
/// Call [`BlockWriter::finish`] (or [`BlockWriter::close`]) to emit the final
/// partial block; dropping the writer releases its buffers without flushing.
pub struct BlockWriter<W: Write> {
    inner: W,
    header: StreamHeader,
    compressor: Box<dyn Compressor>,
    buffers: Option<Buffers>,
    filled: usize,
    blocks_written: u64,
    bytes_written: u64,
}

impl<W: Write> BlockWriter<W> {
    /// Start a stream on `inner`, allocating both block buffers from `allocator`
    pub fn new(
        mut inner: W,
        allocator: &Arc<dyn Allocator>,
        algorithm: CompressionAlgorithm,
        block_size: u32,
    ) -> Result<Self> {
        let compressor = algorithm.compressor();
        let header = StreamHeader::new(compressor.as_ref(), block_size)?;

        let buffers = Buffers {
            block: OffHeapBlock::allocate_or_err(allocator, header.block_size as usize)?,
            encoded: OffHeapBlock::allocate_or_err(
                allocator,
                header.max_compressed_block_size as usize,
            )?,
        };
        header.write_to(&mut inner)?;

        tracing::debug!(
            algorithm = %header.algorithm,
            block_size = header.block_size,
            "snapshot stream opened for writing"
        );

        Ok(Self {
            inner,
            header,
            compressor,
            buffers: Some(buffers),
            filled: 0,
            blocks_written: 0,
            bytes_written: 0,
        })
    }

    /// Header written at the start of the stream
    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Blocks emitted so far
    pub fn blocks_written(&self) -> u64 {
        self.blocks_written
    }

    /// Payload bytes accepted so far (before encoding)
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append payload bytes, emitting blocks as they fill
    pub fn write_bytes(&mut self, mut data: &[u8]) -> Result<()> {
        let block_size = self.header.block_size as usize;
        while !data.is_empty() {
            let buffers = self
                .buffers
                .as_mut()
                .ok_or(Error::Closed("snapshot writer"))?;
            let n = (block_size - self.filled).min(data.len());
            buffers.block[self.filled..self.filled + n].copy_from_slice(&data[..n]);
            self.filled += n;
            self.bytes_written += n as u64;
            data = &data[n..];

            if self.filled == block_size {
                self.emit_block()?;
            }
        }
        Ok(())
    }

    fn emit_block(&mut self) -> Result<()> {
        if self.filled == 0 {
            return Ok(());
        }
        let Some(Buffers { block, encoded }) = self.buffers.as_mut() else {
            return Err(Error::Closed("snapshot writer"));
        };

        let len = self
            .compressor
            .compress_into(&block[..self.filled], encoded)?;
        self.inner.write_all(&(len as u32).to_be_bytes())?;
        self.inner.write_all(&encoded[..len])?;

        self.filled = 0;
        self.blocks_written += 1;
        Ok(())
    }

    /// Emit the pending partial block and release the buffers. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.buffers.is_none() {
            return Ok(());
        }
        let flushed = self
            .emit_block()
            .and_then(|()| self.inner.flush().map_err(Error::from));
        self.buffers = None;
        flushed?;

        tracing::debug!(
            blocks = self.blocks_written,
            bytes = self.bytes_written,
            "snapshot stream closed"
        );
        Ok(())
    }

    /// Close the stream and hand back the underlying writer
    pub fn finish(mut self) -> Result<W> {
        self.close()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for BlockWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    /// Emits the pending partial block; a flushed stream stays readable
    fn flush(&mut self) -> io::Result<()> {
        self.emit_block()?;
        self.inner.flush()
    }
}

impl<W: Write> std::fmt::Debug for BlockWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockWriter")
            .field("header", &self.header)
            .field("filled", &self.filled)
            .field("blocks_written", &self.blocks_written)
            .field("closed", &self.buffers.is_none())
            .finish()
    }
}

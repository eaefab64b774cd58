//! Entry records carried inside a block stream

use bytes::Bytes;
use std::io::{Read, Write};
use std::sync::Arc;

use super::reader::BlockReader;
use super::writer::BlockWriter;
use super::RECORD_HEADER_LEN;
use crate::cache::alloc::Allocator;
use crate::cache::checksum::entry_checksum;
use crate::cache::compression::CompressionAlgorithm;
use crate::cache::entry::hash_key;
use crate::error::{Error, Result};

/// Payload bytes pulled from the stream per step while reading a key or value
const READ_CHUNK: usize = 64 * 1024;

/// One decoded, checksum-verified key/value pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub hash: u64,
    pub key: Bytes,
    pub value: Bytes,
}

// =============================================================================
// Writer
// =============================================================================

/// Writes key/value records into a block stream
#[derive(Debug)]
pub struct SnapshotWriter<W: Write> {
    blocks: BlockWriter<W>,
    records: u64,
}

impl<W: Write> SnapshotWriter<W> {
    /// Start a snapshot on `inner`
    pub fn new(
        inner: W,
        allocator: &Arc<dyn Allocator>,
        compressed: bool,
        block_size: u32,
    ) -> Result<Self> {
        let blocks = BlockWriter::new(
            inner,
            allocator,
            CompressionAlgorithm::for_stream(compressed),
            block_size,
        )?;
        Ok(Self { blocks, records: 0 })
    }

    /// Append one record; the checksum is computed here
    pub fn write_record(&mut self, hash: u64, key: &[u8], value: &[u8]) -> Result<()> {
        let key_len = u32::try_from(key.len())
            .map_err(|_| Error::Config(format!("key of {} bytes too large", key.len())))?;
        let value_len = u32::try_from(value.len())
            .map_err(|_| Error::Config(format!("value of {} bytes too large", value.len())))?;

        let mut head = [0u8; RECORD_HEADER_LEN];
        head[0..4].copy_from_slice(&key_len.to_be_bytes());
        head[4..8].copy_from_slice(&value_len.to_be_bytes());
        head[8..16].copy_from_slice(&hash.to_be_bytes());
        head[16..24].copy_from_slice(&entry_checksum(hash, key, value).to_be_bytes());

        self.blocks.write_bytes(&head)?;
        self.blocks.write_bytes(key)?;
        self.blocks.write_bytes(value)?;
        self.records += 1;
        Ok(())
    }

    /// Append a key-only record (empty value)
    pub fn write_key(&mut self, hash: u64, key: &[u8]) -> Result<()> {
        self.write_record(hash, key, &[])
    }

    /// Records written so far
    pub fn records_written(&self) -> u64 {
        self.records
    }

    /// Flush the last block, release buffers and return the underlying writer
    pub fn finish(self) -> Result<W> {
        tracing::debug!(records = self.records, "snapshot complete");
        self.blocks.finish()
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Reads and verifies key/value records from a block stream.
///
/// Also an iterator; iteration stops after the first error.
#[derive(Debug)]
pub struct SnapshotReader<R: Read> {
    blocks: BlockReader<R>,
    records: u64,
    failed: bool,
}

impl<R: Read> SnapshotReader<R> {
    /// Open a snapshot, validating its header
    pub fn open(inner: R, allocator: &Arc<dyn Allocator>) -> Result<Self> {
        Ok(Self {
            blocks: BlockReader::open(inner, allocator)?,
            records: 0,
            failed: false,
        })
    }

    /// Underlying block stream
    pub fn blocks(&self) -> &BlockReader<R> {
        &self.blocks
    }

    /// Records read so far
    pub fn records_read(&self) -> u64 {
        self.records
    }

    /// Next record, or `None` at a clean end of stream
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        let mut head = [0u8; RECORD_HEADER_LEN];
        match self.blocks.fill(&mut head)? {
            0 => return Ok(None),
            RECORD_HEADER_LEN => {}
            n => {
                return Err(Error::eof(format!(
                    "record {} header truncated after {} bytes",
                    self.records, n
                )))
            }
        }

        let key_len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
        let value_len = u32::from_be_bytes([head[4], head[5], head[6], head[7]]) as usize;
        let mut word = [0u8; 8];
        word.copy_from_slice(&head[8..16]);
        let hash = u64::from_be_bytes(word);
        word.copy_from_slice(&head[16..24]);
        let stored = u64::from_be_bytes(word);

        let key = self.read_payload(key_len, "key")?;
        let value = self.read_payload(value_len, "value")?;

        let computed = entry_checksum(hash, &key, &value);
        if computed != stored {
            return Err(Error::ChecksumMismatch { stored, computed });
        }
        if hash_key(&key) != hash {
            return Err(Error::corrupt(format!(
                "record {} hash does not match its key",
                self.records
            )));
        }

        self.records += 1;
        Ok(Some(Record {
            hash,
            key: Bytes::from(key),
            value: Bytes::from(value),
        }))
    }

    // Grows with the bytes actually present so a damaged length cannot force a
    // huge allocation up front.
    fn read_payload(&mut self, len: usize, what: &str) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len.min(READ_CHUNK));
        while buf.len() < len {
            let start = buf.len();
            let step = (len - start).min(READ_CHUNK);
            buf.resize(start + step, 0);
            let n = self.blocks.fill(&mut buf[start..])?;
            if n < step {
                return Err(Error::eof(format!(
                    "record {} {} truncated: {} of {} bytes",
                    self.records,
                    what,
                    start + n,
                    len
                )));
            }
        }
        Ok(buf)
    }

    /// Release stream buffers. Idempotent.
    pub fn close(&mut self) {
        self.blocks.close();
    }
}

impl<R: Read> Iterator for SnapshotReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

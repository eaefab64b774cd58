//! Snapshot Persistence Stream
//!
//! Self-describing, optionally LZ4-compressed byte stream used to save and restore
//! cache contents independently of the live table.
//!
//! # Wire Format
//!
//! ```text
//! ┌─────────────────────────── header (16 bytes, big-endian) ──────────────────────┐
//! │ magic u32 │ version u32 │ block_size u32 │ max_compressed_block_size u32        │
//! └────────────────────────────────────────────────────────────────────────────────┘
//! ┌─ block ─────────────────────────┐
//! │ encoded_len u32 │ encoded bytes │   ... repeated until end of input
//! └─────────────────────────────────┘
//! ```
//!
//! Decoded block payloads concatenate into a record stream:
//!
//! ```text
//! [key_len u32][value_len u32][hash u64][checksum u64][key][value]   (big-endian)
//! ```
//!
//! Records may span block boundaries. The stream ends only where a block length read
//! finds no bytes at all; a zero-length block is corruption.
//!
//! # Reader States
//!
//! `Start → ReadHeader → [ReadBlockLength → ReadBlock → Decompress → Emit]* → Eof`

use std::io::{self, Read};

mod header;
mod reader;
mod record;
mod writer;

pub use header::StreamHeader;
pub use reader::BlockReader;
pub use record::{Record, SnapshotReader, SnapshotWriter};
pub use writer::BlockWriter;

/// Magic of an LZ4-compressed stream ("OHCZ")
pub const MAGIC_COMPRESSED: u32 = 0x4F48_435A;

/// Magic of an uncompressed stream ("OHCP")
pub const MAGIC_PLAIN: u32 = 0x4F48_4350;

/// Only stream version understood by this crate
pub const STREAM_VERSION: u32 = 1;

/// Header length in bytes
pub const HEADER_LEN: usize = 16;

/// Record header length in bytes (key_len + value_len + hash + checksum)
pub const RECORD_HEADER_LEN: usize = 24;

/// Smallest accepted block size (1 KiB)
pub const MIN_BLOCK_SIZE: u32 = 1024;

/// Largest accepted block size (64 MiB)
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024 * 1024;

/// Block size used when none is given (64 KiB)
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;

/// Read until `buf` is full or input ends, returning the bytes read
pub(crate) fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

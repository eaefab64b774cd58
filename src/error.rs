//! Error types for the off-heap cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the off-heap cache
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Capacity / Memory Errors
    // =========================================================================
    /// Entry cannot fit into its segment even after evicting everything else
    #[error("Capacity exhausted: entry needs {required} bytes, segment capacity is {capacity}")]
    CapacityExhausted { required: u64, capacity: u64 },

    /// The native memory substrate could not satisfy an allocation
    #[error("Out of native memory: unable to allocate {requested} bytes with {allocator}")]
    OutOfMemory {
        requested: usize,
        allocator: &'static str,
    },

    /// Allocations still outstanding at teardown (debug tracking only)
    #[error("Memory leak: {allocations} allocations ({bytes} bytes) were never freed")]
    MemoryLeak { allocations: usize, bytes: u64 },

    /// Free of an address that is not currently allocated (debug tracking only)
    #[error("Free of untracked region at address {address:#x}")]
    UntrackedFree { address: usize },

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    /// Stored checksum does not match the recomputed one
    #[error("Checksum mismatch: stored {stored:#018x}, computed {computed:#018x}")]
    ChecksumMismatch { stored: u64, computed: u64 },

    // =========================================================================
    // Persistence Stream Errors
    // =========================================================================
    /// Stream was written on a machine with the opposite byte order
    #[error("Stream from instance with different CPU architecture cannot be loaded")]
    WrongArchitecture,

    /// Stream header or block contents are malformed
    #[error("Corrupt stream: {0}")]
    CorruptStream(String),

    /// Stream version is not understood by this reader
    #[error("Unsupported stream version: {0}")]
    UnsupportedVersion(u32),

    /// Input ended in the middle of a header, block or record
    #[error("Unexpected EOF: {0}")]
    UnexpectedEof(String),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Misuse
    // =========================================================================
    /// Operation on a closed table or stream
    #[error("{0} is closed")]
    Closed(&'static str),

    /// A serializer wrote a different number of bytes than it declared
    #[error("Serializer declared {declared} bytes but wrote {written}")]
    SerializerSizeMismatch { declared: usize, written: usize },
}

impl Error {
    /// Create a corrupt stream error
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Error::CorruptStream(reason.into())
    }

    /// Create an unexpected EOF error
    pub fn eof(context: impl Into<String>) -> Self {
        Error::UnexpectedEof(context.into())
    }

    /// True for every error that means persisted or stored bytes cannot be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::ChecksumMismatch { .. }
                | Error::CorruptStream(_)
                | Error::UnexpectedEof(_)
                | Error::WrongArchitecture
                | Error::UnsupportedVersion(_)
        )
    }

    /// True if an insert was rejected by the cache capacity policy
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, Error::CapacityExhausted { .. })
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::UnexpectedEof(_) => std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err),
            Error::Closed(_) => std::io::Error::new(std::io::ErrorKind::NotConnected, err),
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

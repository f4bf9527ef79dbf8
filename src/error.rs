//! Flat status codes, realized as a single typed error enum.
//!
//! Every fallible entry point returns one `Error` variant instead of a raw
//! status byte. [`Error::status_code`] is the single place that maps back to
//! a flat integer, for callers that need to interoperate with a C-shaped
//! boundary that still expects one.

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong when talking to a [`crate::Store`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Catch-all for transaction-slot state-machine misuse (wrong state for
    /// the requested operation).
    #[error("invalid operation for the current transaction slot state")]
    Generic,

    /// No live block exists for the requested id.
    #[error("no such object")]
    NotFound,

    /// A free-list allocator for the requested region is empty.
    #[error("no free blocks left in {region:?} region")]
    NoSpace {
        /// Region that ran out of space.
        region: crate::block::Region,
    },

    /// The backing file could not be created.
    #[error("failed to create pool file: {0}")]
    CreateFailed(String),

    /// The pool header could not be persisted.
    #[error("failed to write pool header: {0}")]
    SuperblockWriteFailed(String),

    /// The pool header failed its checksum/consistency check.
    #[error("pool header is corrupt")]
    SuperblockCorrupt,

    /// The pool header's signature or format version does not match this
    /// build.
    #[error("pool header is invalid or incompatible: {0}")]
    SuperblockInvalid(String),

    /// Key or value length exceeds the configured maximum.
    #[error("key/value of {requested} bytes exceeds the {max}-byte limit")]
    SizeExceeded {
        /// The length that was rejected.
        requested: u32,
        /// The configured limit it was checked against.
        max: u32,
    },

    /// A block id was used against the wrong region (e.g. a data id passed
    /// to `put_meta`).
    #[error("block id {id} does not belong to the {expected:?} region")]
    WrongRegion {
        /// Offending id.
        id: u64,
        /// Region the caller expected it to belong to.
        expected: crate::block::Region,
    },

    /// Argument validation failed before any side effect took place.
    #[error("invalid arguments: {0}")]
    BadArgs(&'static str),

    /// Wraps an I/O failure from the underlying file/mmap operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Recovers the flat status code this error corresponds to, for callers
    /// at a C-shaped FFI boundary that expects a `PMB_*`-style integer rather
    /// than a Rust enum.
    pub fn status_code(&self) -> u8 {
        match self {
            Error::Generic => 1,
            Error::NotFound => 2,
            Error::NoSpace { .. } => 3,
            Error::CreateFailed(_) => 4,
            Error::SuperblockWriteFailed(_) => 5,
            Error::SuperblockCorrupt => 6,
            Error::SuperblockInvalid(_) => 7,
            Error::SizeExceeded { .. } => 8,
            Error::WrongRegion { .. } => 9,
            Error::BadArgs(_) => 10,
            Error::Io(_) => 1,
        }
    }
}

/// The `OK` status code, kept around for symmetry with [`Error::status_code`]
/// at call sites that want to report a flat code regardless of success.
pub const STATUS_OK: u8 = 0;

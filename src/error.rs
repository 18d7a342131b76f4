//! Error types for the chainstore engine.

use std::io;

use snafu::Snafu;

/// Result type alias for chainstore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during chainstore operations.
#[derive(Debug, Snafu)]
pub enum Error {
    /// I/O error from the underlying file system.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// A store file is corrupted or has an invalid format.
    #[snafu(display("Corrupted store: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// Key length does not match the index key size.
    #[snafu(display("Key size mismatch: index expects {expected} bytes, got {actual}"))]
    KeySizeMismatch {
        /// The key size the index was created with.
        expected: u8,
        /// The length of the key that was passed.
        actual: usize,
    },

    /// No index with this identifier has been loaded.
    #[snafu(display("Unknown index: {id}"))]
    UnknownIndex {
        /// The unrecognized index identifier.
        id: u8,
    },

    /// An index with this identifier is already loaded.
    #[snafu(display("Index {id} already loaded"))]
    IndexAlreadyLoaded {
        /// The duplicate index identifier.
        id: u8,
    },

    /// A staged delete referenced a key that does not exist on disk.
    #[snafu(display("Key not found"))]
    KeyNotFound,

    /// A commit failed partway through its disk writes.
    ///
    /// The in-memory state no longer matches disk; the store rejects further
    /// operations until it is reopened, when recovery rolls the interrupted
    /// commit back.
    #[snafu(display("Store poisoned by a failed commit; reopen to recover"))]
    Poisoned,

    /// A ranged read or extra-data write exceeded the addressed bytes.
    #[snafu(display("Out of range: offset {offset} len {len} exceeds {value_len} bytes"))]
    OutOfRange {
        /// Requested start offset.
        offset: u32,
        /// Requested length.
        len: u32,
        /// Length of the addressed value or block.
        value_len: u32,
    },
}

// Automatic conversion from io::Error for ergonomic ? usage
impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

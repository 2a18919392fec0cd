//! Error types for record-journal.

use record_codec::CodecError;
use thiserror::Error;

/// Errors that can occur on journals and cursors.
#[derive(Error, Debug)]
pub enum JournalError {
    /// Frame references a schema id never established in this file and not
    /// otherwise registered.
    #[error("unknown schema {schema_id:#018x} at position {position}")]
    UnknownSchema { schema_id: u64, position: u64 },

    /// Scatter/gather write landed fewer bytes than planned. The batch is
    /// considered not persisted; the write position did not advance.
    #[error("short write: wrote {wrote} bytes, expected {expected}")]
    ShortWrite { wrote: usize, expected: usize },

    /// Schema or record codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// IO error from the native file layer.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

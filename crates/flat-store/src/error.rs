//! Error types for flat-store.

use thiserror::Error;

/// Errors that can occur on flat collections.
#[derive(Error, Debug)]
pub enum FlatError {
    /// Element shape has no positive fixed width.
    #[error("invalid element type {0:?}: shape must be fully fixed-width")]
    InvalidElementType(String),

    /// Record belongs to a different shape than the collection.
    #[error("shape mismatch: collection holds {expected:?}, record is {got:?}")]
    ShapeMismatch { expected: String, got: String },

    /// Adopted buffer length is not a whole number of elements.
    #[error("misaligned buffer: {len} bytes is not a multiple of {elem}")]
    MisalignedBuffer { len: usize, elem: usize },

    /// Index past the end of the collection.
    #[error("index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },
}

/// Result type for flat collection operations.
pub type FlatResult<T> = Result<T, FlatError>;

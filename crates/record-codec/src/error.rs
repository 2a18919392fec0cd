//! Error types for record-codec.

use thiserror::Error;

/// Errors that can occur while compiling a schema or accessing a record.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Schema names a primitive this codec does not know.
    #[error("unknown primitive type: {0}")]
    UnknownType(String),

    /// Field name is not a valid identifier or collides with `buffer`.
    #[error("invalid field name: {0:?}")]
    InvalidFieldName(String),

    /// Field length is zero or otherwise unusable.
    #[error("invalid length {len} for field {field:?}")]
    InvalidLength { field: String, len: usize },

    /// Arrays of variable-width elements are not representable.
    #[error("field {0:?}: arrays of variable-width types are unsupported")]
    VariadicUnsupported(String),

    /// Supplied buffer is smaller than the schema's fixed area.
    #[error("buffer too small: need at least {needed} bytes, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    /// Accessor referenced a field the schema does not define.
    #[error("unknown field: {0:?}")]
    UnknownField(String),

    /// Value kind does not fit the field's primitive type.
    #[error("type mismatch on field {field:?}: expected {expected}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
    },

    /// Schema JSON did not parse as the canonical `[name, fields]` pair.
    #[error("malformed schema JSON: {0}")]
    MalformedSchema(String),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

//! Error types for wire encoding and decoding.

use thiserror::Error;

/// Errors raised while encoding or decoding wire-format data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before the value was complete.
    #[error("unexpected end of data at offset {0}")]
    UnexpectedEnd(usize),

    /// A varint exceeded the 64-bit range.
    #[error("varint overflows u64")]
    VarintOverflow,

    /// A length or count field exceeds a sanity bound.
    #[error("size {got} exceeds limit {limit}")]
    OversizedField { got: u64, limit: u64 },

    /// Structurally invalid data.
    #[error("malformed data: {0}")]
    Malformed(&'static str),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

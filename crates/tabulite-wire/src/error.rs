//! Wire decoding errors.

use thiserror::Error;

/// Errors surfaced while decoding wire payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before the field was complete.
    #[error("truncated input: needed {needed} more bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// A varint ran past its maximum width.
    #[error("varint overflow decoding {width}-bit integer")]
    VarintOverflow { width: u32 },

    /// A boolean byte was neither 0 nor 1.
    #[error("invalid boolean byte {0:#x}")]
    InvalidBool(u8),

    /// A string field held invalid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// Unknown command code in a frame header.
    #[error("unknown command code {0}")]
    UnknownCommand(u16),

    /// A field held a value outside its legal domain.
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: i64 },
}

pub type Result<T> = std::result::Result<T, WireError>;

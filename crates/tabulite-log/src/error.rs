//! Log storage errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by fragment and meta-log storage.
#[derive(Error, Debug)]
pub enum LogError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A record or block failed its checksum.
    #[error("checksum mismatch in {path} at offset {offset}")]
    ChecksumMismatch { path: PathBuf, offset: u64 },

    /// A block or record header was malformed.
    #[error("corrupt log {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Compression failed.
    #[error("{codec} compression failed: {reason}")]
    CompressionFailed { codec: &'static str, reason: String },

    /// Decompression failed.
    #[error("{codec} decompression failed: {reason}")]
    DecompressionFailed { codec: &'static str, reason: String },

    /// A payload failed to decode after framing checks passed.
    #[error("payload decode error: {0}")]
    Decode(#[from] tabulite_wire::WireError),
}

pub type Result<T> = std::result::Result<T, LogError>;

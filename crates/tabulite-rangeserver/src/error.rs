//! Range-server recovery errors.

use tabulite_types::{ErrorCode, QualifiedRangeSpec};
use thiserror::Error;

/// Errors surfaced by the phantom-range engine and the replay player.
#[derive(Error, Debug)]
pub enum RangeServerError {
    /// Commit-log or meta-log storage error.
    #[error(transparent)]
    Log(#[from] tabulite_log::LogError),

    /// Malformed wire payload.
    #[error(transparent)]
    Wire(#[from] tabulite_wire::WireError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A message named a range with no phantom entry on this server.
    #[error("no phantom range for {0}")]
    PhantomRangeUnknown(QualifiedRangeSpec),

    /// Outbound send failed at the transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// A failure-inducer probe fired.
    #[error(transparent)]
    Induced(#[from] tabulite_chaos::InducedFailure),
}

impl RangeServerError {
    /// Wire code reported for this error in responses and completion
    /// messages.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Log(_) | Self::Io(_) => ErrorCode::RangeServerError,
            Self::Wire(_) => ErrorCode::ProtocolError,
            Self::PhantomRangeUnknown(_) => ErrorCode::PhantomRangeUnknown,
            Self::Transport(_) => ErrorCode::RangeServerError,
            Self::Induced(failure) => ErrorCode::from_i32(failure.code),
        }
    }
}

pub type Result<T> = std::result::Result<T, RangeServerError>;

//! Master recovery errors.

use tabulite_types::{ErrorCode, Location};
use thiserror::Error;

/// Errors surfaced by the master recovery core.
#[derive(Error, Debug)]
pub enum Error {
    /// Couldn't obtain a failed server's lock file within the retry cap.
    #[error("couldn't obtain lock on '{path}' due to conflict, hit max retries {attempts}")]
    LockConflict { path: String, attempts: u32 },

    /// A recover-ranges operation ran out of attempts.
    #[error("recovery of {location} {group} ranges gave up after {attempts} attempts")]
    RetriesExhausted {
        location: Location,
        group: tabulite_types::RangeGroup,
        attempts: u32,
    },

    /// No server registered under this location.
    #[error("no range server registered at location {0}")]
    ServerNotFound(Location),

    /// A recover-ranges sub-operation failed; the server's durable state
    /// must not be retired.
    #[error("recovery of {location} incomplete: a range-group operation failed")]
    RecoveryIncomplete { location: Location },

    /// An outbound recovery RPC failed at the transport.
    #[error("rpc to {location} failed: {code}")]
    Rpc { location: Location, code: ErrorCode },

    /// Meta-log or commit-log storage error.
    #[error(transparent)]
    Log(#[from] tabulite_log::LogError),

    /// Malformed wire payload.
    #[error(transparent)]
    Wire(#[from] tabulite_wire::WireError),

    /// Coordination-service error.
    #[error("lock service error: {0}")]
    LockService(String),

    /// A failure-inducer probe fired.
    #[error(transparent)]
    Induced(#[from] tabulite_chaos::InducedFailure),
}

impl Error {
    /// Wire code reported for this error in completion messages.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::LockConflict { .. } => ErrorCode::LockConflict,
            Self::RetriesExhausted { .. } => ErrorCode::RequestTimeout,
            Self::ServerNotFound(_) => ErrorCode::ServerNotFound,
            Self::RecoveryIncomplete { .. } => ErrorCode::RangeServerError,
            Self::Rpc { code, .. } => *code,
            Self::Log(_) | Self::LockService(_) => ErrorCode::RangeServerError,
            Self::Wire(_) => ErrorCode::ProtocolError,
            Self::Induced(failure) => ErrorCode::from_i32(failure.code),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

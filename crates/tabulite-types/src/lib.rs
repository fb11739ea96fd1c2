//! # tabulite-types: Core types for Tabulite
//!
//! Shared vocabulary types used across the Tabulite system:
//! - Range identity ([`TableId`], [`RangeSpec`], [`QualifiedRangeSpec`])
//! - Range life cycle ([`RangeState`], [`QualifiedRangeStateSpec`])
//! - Recovery grouping ([`RangeGroup`])
//! - Server identity ([`Location`])
//! - Cell mutations ([`CellKey`])
//! - Wire result codes ([`ErrorCode`])

use std::fmt::{self, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ============================================================================
// Server identity
// ============================================================================

/// Stable string identifier of a range server.
///
/// Survives restarts and address changes; every plan, meta-log record and
/// recovery message names servers by location rather than by address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location(String);

impl Location {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Location {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Location {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Table and range identity
// ============================================================================

/// Identifier of the metadata table; its first range is the root range.
pub const METADATA_TABLE_ID: &str = "0/0";

/// Prefix of the system-table namespace.
pub const SYSTEM_TABLE_PREFIX: &str = "0/";

/// A table identifier plus its schema generation.
///
/// Two `TableId`s name the same table version iff both `id` and
/// `generation` are equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId {
    pub id: String,
    pub generation: u32,
}

impl TableId {
    pub fn new(id: impl Into<String>, generation: u32) -> Self {
        Self {
            id: id.into(),
            generation,
        }
    }

    /// Returns true if this is the metadata table.
    pub fn is_metadata(&self) -> bool {
        self.id == METADATA_TABLE_ID
    }

    /// Returns true if this is a system table (metadata included).
    pub fn is_system(&self) -> bool {
        self.id.starts_with(SYSTEM_TABLE_PREFIX)
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(g{})", self.id, self.generation)
    }
}

/// A half-open row interval: `start_row` exclusive, `end_row` inclusive.
///
/// Ordering is lexicographic on the raw row bytes, which matches the
/// on-disk sort order of cell keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RangeSpec {
    pub start_row: Bytes,
    pub end_row: Bytes,
}

impl RangeSpec {
    pub fn new(start_row: impl Into<Bytes>, end_row: impl Into<Bytes>) -> Self {
        Self {
            start_row: start_row.into(),
            end_row: end_row.into(),
        }
    }

    /// Single-point interval used as a lower-bound probe for row lookups.
    pub fn point(row: impl Into<Bytes>) -> Self {
        Self {
            start_row: Bytes::new(),
            end_row: row.into(),
        }
    }

    /// Returns true if `row` falls inside this interval.
    pub fn contains(&self, row: &[u8]) -> bool {
        row > self.start_row.as_ref() && row <= self.end_row.as_ref()
    }
}

impl Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}..{}]",
            String::from_utf8_lossy(&self.start_row),
            String::from_utf8_lossy(&self.end_row)
        )
    }
}

/// A range fully qualified by its table.
///
/// The unit of ownership, movement and recovery. Total order is
/// lexicographic on `(table.id, table.generation, start_row, end_row)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QualifiedRangeSpec {
    pub table: TableId,
    pub range: RangeSpec,
}

impl QualifiedRangeSpec {
    pub fn new(table: TableId, range: RangeSpec) -> Self {
        Self { table, range }
    }

    /// The root range is the first range of the metadata table.
    pub fn is_root(&self) -> bool {
        self.table.is_metadata() && self.range.start_row.is_empty()
    }

    /// Recovery group this range belongs to.
    pub fn group(&self) -> RangeGroup {
        if self.is_root() {
            RangeGroup::Root
        } else if self.table.is_metadata() {
            RangeGroup::Metadata
        } else if self.table.is_system() {
            RangeGroup::System
        } else {
            RangeGroup::User
        }
    }
}

impl Display for QualifiedRangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.table, self.range)
    }
}

// ============================================================================
// Range life cycle
// ============================================================================

/// Durable life-cycle state of a range, as recorded in a range server's
/// meta-log.
///
/// `Phantom` marks a range that is being resurrected on a new destination
/// and is not yet visible to clients; server recovery skips phantom
/// entries, leaving them to whichever recovery operation created them.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum RangeState {
    #[default]
    SteadyState = 0,
    SplitLogInstalled = 1,
    SplitShrunk = 2,
    RelinquishLogInstalled = 3,
    Phantom = 4,
}

impl RangeState {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::SteadyState),
            1 => Some(Self::SplitLogInstalled),
            2 => Some(Self::SplitShrunk),
            3 => Some(Self::RelinquishLogInstalled),
            4 => Some(Self::Phantom),
            _ => None,
        }
    }

    pub fn is_phantom(self) -> bool {
        self == Self::Phantom
    }
}

/// A qualified range together with its life-cycle state.
///
/// Travels in receiver plans and phantom-receive requests so destinations
/// seed phantom ranges with the state a prior attempt left behind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QualifiedRangeStateSpec {
    pub spec: QualifiedRangeSpec,
    pub state: RangeState,
}

impl QualifiedRangeStateSpec {
    pub fn new(spec: QualifiedRangeSpec, state: RangeState) -> Self {
        Self { spec, state }
    }
}

// ============================================================================
// Recovery grouping
// ============================================================================

/// Priority group of ranges during server recovery.
///
/// Groups recover strictly in declaration order: no group may start until
/// every earlier group has been acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RangeGroup {
    Root,
    Metadata,
    System,
    User,
}

impl RangeGroup {
    pub const ALL: [RangeGroup; 4] = [Self::Root, Self::Metadata, Self::System, Self::User];

    pub fn as_i32(self) -> i32 {
        match self {
            Self::Root => 1,
            Self::Metadata => 2,
            Self::System => 3,
            Self::User => 4,
        }
    }

    /// Zero (and anything unrecognized) decodes to `None`, the "plan not
    /// yet built" marker.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Root),
            2 => Some(Self::Metadata),
            3 => Some(Self::System),
            4 => Some(Self::User),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Metadata => "metadata",
            Self::System => "system",
            Self::User => "user",
        }
    }
}

impl Display for RangeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Cell mutations
// ============================================================================

/// The serialized key of one cell mutation.
///
/// The revision is assigned by the original owning server and totally
/// orders mutations of the same row across log fragments: when two
/// fragments carry values for one cell, the higher revision wins.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellKey {
    pub row: Bytes,
    pub revision: i64,
}

impl CellKey {
    pub fn new(row: impl Into<Bytes>, revision: i64) -> Self {
        Self {
            row: row.into(),
            revision,
        }
    }
}

// ============================================================================
// Wire result codes
// ============================================================================

/// Result codes carried in recovery completion messages and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Ok,
    RequestTimeout,
    ProtocolError,
    InducedFailure,
    LockConflict,
    FragmentAlreadyComplete,
    PhantomRangeUnknown,
    ServerNotFound,
    RangeServerError,
    Other(i32),
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::RequestTimeout => 1,
            Self::ProtocolError => 2,
            Self::InducedFailure => 3,
            Self::LockConflict => 4,
            Self::FragmentAlreadyComplete => 5,
            Self::PhantomRangeUnknown => 6,
            Self::ServerNotFound => 7,
            Self::RangeServerError => 8,
            Self::Other(code) => code,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::RequestTimeout,
            2 => Self::ProtocolError,
            3 => Self::InducedFailure,
            4 => Self::LockConflict,
            5 => Self::FragmentAlreadyComplete,
            6 => Self::PhantomRangeUnknown,
            7 => Self::ServerNotFound,
            8 => Self::RangeServerError,
            code => Self::Other(code),
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::RequestTimeout => write!(f, "REQUEST_TIMEOUT"),
            Self::ProtocolError => write!(f, "PROTOCOL_ERROR"),
            Self::InducedFailure => write!(f, "INDUCED_FAILURE"),
            Self::LockConflict => write!(f, "LOCK_CONFLICT"),
            Self::FragmentAlreadyComplete => write!(f, "FRAGMENT_ALREADY_COMPLETE"),
            Self::PhantomRangeUnknown => write!(f, "PHANTOM_RANGE_UNKNOWN"),
            Self::ServerNotFound => write!(f, "SERVER_NOT_FOUND"),
            Self::RangeServerError => write!(f, "RANGE_SERVER_ERROR"),
            Self::Other(code) => write!(f, "ERROR({code})"),
        }
    }
}

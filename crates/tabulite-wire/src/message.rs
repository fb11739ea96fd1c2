//! Typed payloads for the recovery commands.
//!
//! Each struct mirrors one row of the protocol table: requests issued by
//! the recovery coordinator, update traffic between players and
//! receivers, and the completion reports that flow back to the master.
//! `encode` writes the payload bytes (header excluded); `decode` parses
//! and consumes them.

use bytes::{Bytes, BytesMut};
use tabulite_types::{ErrorCode, Location, QualifiedRangeSpec, RangeGroup, RangeState};

use crate::serial::{
    get_bool, get_i32, get_qualified_range, get_vi32, get_vi64, get_vstr_utf8, put_bool, put_i32,
    put_qualified_range, put_vi32, put_vi64, put_vstr,
};
use crate::{Result, WireError};

fn get_location(input: &mut &[u8]) -> Result<Location> {
    get_vstr_utf8(input).map(Location::from)
}

fn get_count(input: &mut &[u8], field: &'static str) -> Result<usize> {
    let count = get_i32(input)?;
    if count < 0 {
        return Err(WireError::InvalidValue {
            field,
            value: i64::from(count),
        });
    }
    Ok(count as usize)
}

fn put_fragments(buf: &mut BytesMut, fragments: &[u32]) {
    put_i32(buf, fragments.len() as i32);
    for &fragment in fragments {
        put_vi32(buf, fragment as i32);
    }
}

fn get_fragments(input: &mut &[u8]) -> Result<Vec<u32>> {
    let count = get_count(input, "fragment count")?;
    let mut fragments = Vec::with_capacity(count);
    for _ in 0..count {
        fragments.push(get_vi32(input)? as u32);
    }
    Ok(fragments)
}

fn put_ranges(buf: &mut BytesMut, ranges: &[QualifiedRangeSpec]) {
    put_i32(buf, ranges.len() as i32);
    for range in ranges {
        put_qualified_range(buf, range);
    }
}

fn get_ranges(input: &mut &[u8]) -> Result<Vec<QualifiedRangeSpec>> {
    let count = get_count(input, "range count")?;
    let mut ranges = Vec::with_capacity(count);
    for _ in 0..count {
        ranges.push(get_qualified_range(input)?);
    }
    Ok(ranges)
}

// ============================================================================
// Receiver-plan entries (travel inside replay-fragments)
// ============================================================================

/// One receiver-plan assignment: a range, its state, and the destination
/// that will own it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverEntry {
    pub location: Location,
    pub spec: QualifiedRangeSpec,
    pub state: RangeState,
}

impl ReceiverEntry {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_vstr(buf, self.location.as_str().as_bytes());
        put_qualified_range(buf, &self.spec);
        put_i32(buf, self.state.as_i32());
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let location = get_location(input)?;
        let spec = get_qualified_range(input)?;
        let state_raw = get_i32(input)?;
        let state = RangeState::from_i32(state_raw).ok_or(WireError::InvalidValue {
            field: "range state",
            value: i64::from(state_raw),
        })?;
        Ok(Self {
            location,
            spec,
            state,
        })
    }
}

/// Encodes a receiver-plan entry list with its leading count.
pub fn put_receiver_entries(buf: &mut BytesMut, entries: &[ReceiverEntry]) {
    put_i32(buf, entries.len() as i32);
    for entry in entries {
        entry.encode(buf);
    }
}

pub fn get_receiver_entries(input: &mut &[u8]) -> Result<Vec<ReceiverEntry>> {
    let count = get_count(input, "receiver entry count")?;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(ReceiverEntry::decode(input)?);
    }
    Ok(entries)
}

// ============================================================================
// phantom-receive
// ============================================================================

/// Coordinator → receiver: allocate phantom buffers for the listed ranges,
/// expecting data from the listed fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhantomReceive {
    /// Location of the failed server being recovered.
    pub location: Location,
    pub fragments: Vec<u32>,
    pub ranges: Vec<QualifiedRangeSpec>,
}

impl PhantomReceive {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_vstr(buf, self.location.as_str().as_bytes());
        put_fragments(buf, &self.fragments);
        put_ranges(buf, &self.ranges);
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            location: get_location(input)?,
            fragments: get_fragments(input)?,
            ranges: get_ranges(input)?,
        })
    }
}

// ============================================================================
// replay-fragments
// ============================================================================

/// Coordinator → player: read the listed fragments of the failed server's
/// log and route their cells through the receiver plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayFragments {
    pub op_id: i64,
    pub attempt: u32,
    pub recover_location: Location,
    pub group: RangeGroup,
    pub fragments: Vec<u32>,
    pub receiver_plan: Vec<ReceiverEntry>,
    pub timeout_ms: u32,
}

impl ReplayFragments {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_vi64(buf, self.op_id);
        put_vi32(buf, self.attempt as i32);
        put_vstr(buf, self.recover_location.as_str().as_bytes());
        put_vi32(buf, self.group.as_i32());
        put_fragments(buf, &self.fragments);
        put_receiver_entries(buf, &self.receiver_plan);
        put_i32(buf, self.timeout_ms as i32);
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let op_id = get_vi64(input)?;
        let attempt = get_vi32(input)? as u32;
        let recover_location = get_location(input)?;
        let group_raw = get_vi32(input)?;
        let group = RangeGroup::from_i32(group_raw).ok_or(WireError::InvalidValue {
            field: "range group",
            value: i64::from(group_raw),
        })?;
        let fragments = get_fragments(input)?;
        let receiver_plan = get_receiver_entries(input)?;
        let timeout_ms = get_i32(input)? as u32;
        Ok(Self {
            op_id,
            attempt,
            recover_location,
            group,
            fragments,
            receiver_plan,
            timeout_ms,
        })
    }
}

// ============================================================================
// phantom-update
// ============================================================================

/// Player → receiver: a batch of cells for one range of one fragment.
///
/// `more = false` marks the final batch of that fragment for that range.
/// The payload is a raw cell block and extends to the end of the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhantomUpdate {
    /// Location of the failed server being recovered.
    pub location: Location,
    pub range: QualifiedRangeSpec,
    pub fragment: u32,
    pub more: bool,
    pub payload: Bytes,
}

impl PhantomUpdate {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_vstr(buf, self.location.as_str().as_bytes());
        put_qualified_range(buf, &self.range);
        put_vi32(buf, self.fragment as i32);
        put_bool(buf, self.more);
        buf.extend_from_slice(&self.payload);
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let location = get_location(input)?;
        let range = get_qualified_range(input)?;
        let fragment = get_vi32(input)? as u32;
        let more = get_bool(input)?;
        let payload = Bytes::copy_from_slice(input);
        *input = &[];
        Ok(Self {
            location,
            range,
            fragment,
            more,
            payload,
        })
    }
}

/// Receiver → player reply for one phantom-update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhantomUpdateResponse {
    pub error: ErrorCode,
    pub range: QualifiedRangeSpec,
    pub fragment: u32,
}

impl PhantomUpdateResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_i32(buf, self.error.as_i32());
        put_qualified_range(buf, &self.range);
        put_vi32(buf, self.fragment as i32);
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            error: ErrorCode::from_i32(get_i32(input)?),
            range: get_qualified_range(input)?,
            fragment: get_vi32(input)? as u32,
        })
    }
}

// ============================================================================
// replay-complete
// ============================================================================

/// Player → master: per-fragment outcome of one replay-fragments request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayComplete {
    pub op_id: i64,
    pub attempt: u32,
    pub fragments: Vec<(u32, ErrorCode)>,
}

impl ReplayComplete {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_vi64(buf, self.op_id);
        put_vi32(buf, self.attempt as i32);
        put_vi32(buf, self.fragments.len() as i32);
        for &(fragment, error) in &self.fragments {
            put_vi32(buf, fragment as i32);
            put_vi32(buf, error.as_i32());
        }
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let op_id = get_vi64(input)?;
        let attempt = get_vi32(input)? as u32;
        let count = get_vi32(input)?;
        if count < 0 {
            return Err(WireError::InvalidValue {
                field: "fragment result count",
                value: i64::from(count),
            });
        }
        let mut fragments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let fragment = get_vi32(input)? as u32;
            let error = ErrorCode::from_i32(get_vi32(input)?);
            fragments.push((fragment, error));
        }
        Ok(Self {
            op_id,
            attempt,
            fragments,
        })
    }
}

// ============================================================================
// phantom-prepare-ranges / phantom-commit-ranges
// ============================================================================

/// Coordinator → receiver: prepare (or commit) the listed phantom ranges.
///
/// Prepare and commit share this shape; the frame command distinguishes
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhantomRangesRequest {
    pub op_id: i64,
    pub attempt: u32,
    /// Location of the failed server being recovered.
    pub location: Location,
    pub ranges: Vec<QualifiedRangeSpec>,
    pub timeout_ms: u32,
}

impl PhantomRangesRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_vi64(buf, self.op_id);
        put_vi32(buf, self.attempt as i32);
        put_vstr(buf, self.location.as_str().as_bytes());
        put_ranges(buf, &self.ranges);
        put_i32(buf, self.timeout_ms as i32);
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            op_id: get_vi64(input)?,
            attempt: get_vi32(input)? as u32,
            location: get_location(input)?,
            ranges: get_ranges(input)?,
            timeout_ms: get_i32(input)? as u32,
        })
    }
}

/// Receiver → master: per-range outcome of a prepare or commit request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangesComplete {
    pub op_id: i64,
    pub attempt: u32,
    pub results: Vec<(QualifiedRangeSpec, ErrorCode)>,
}

impl RangesComplete {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_vi64(buf, self.op_id);
        put_vi32(buf, self.attempt as i32);
        put_vi32(buf, self.results.len() as i32);
        for (range, error) in &self.results {
            put_qualified_range(buf, range);
            put_vi32(buf, error.as_i32());
        }
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let op_id = get_vi64(input)?;
        let attempt = get_vi32(input)? as u32;
        let count = get_vi32(input)?;
        if count < 0 {
            return Err(WireError::InvalidValue {
                field: "range result count",
                value: i64::from(count),
            });
        }
        let mut results = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let range = get_qualified_range(input)?;
            let error = ErrorCode::from_i32(get_vi32(input)?);
            results.push((range, error));
        }
        Ok(Self {
            op_id,
            attempt,
            results,
        })
    }
}

// ============================================================================
// acknowledge-load
// ============================================================================

/// Coordinator → receiver: the master has durably recorded the commit;
/// retire the phantom entries and serve the ranges live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcknowledgeLoad {
    pub ranges: Vec<QualifiedRangeSpec>,
}

impl AcknowledgeLoad {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_ranges(buf, &self.ranges);
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            ranges: get_ranges(input)?,
        })
    }
}

/// Receiver → coordinator reply with per-range acknowledge results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcknowledgeLoadResponse {
    pub error: ErrorCode,
    pub results: Vec<(QualifiedRangeSpec, ErrorCode)>,
}

impl AcknowledgeLoadResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_i32(buf, self.error.as_i32());
        put_i32(buf, self.results.len() as i32);
        for (range, error) in &self.results {
            put_qualified_range(buf, range);
            put_vi32(buf, error.as_i32());
        }
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let error = ErrorCode::from_i32(get_i32(input)?);
        let count = get_count(input, "acknowledge result count")?;
        let mut results = Vec::with_capacity(count);
        for _ in 0..count {
            let range = get_qualified_range(input)?;
            let code = ErrorCode::from_i32(get_vi32(input)?);
            results.push((range, code));
        }
        Ok(Self { error, results })
    }
}

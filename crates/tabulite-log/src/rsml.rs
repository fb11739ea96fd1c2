//! Range-server meta-log (RSML) entities.
//!
//! Each range server records its live ranges in its own meta-log. The
//! master reads this log during server recovery to discover what must be
//! resurrected; range servers rewrite it as ranges move through their
//! life cycle.

use bytes::BytesMut;
use tabulite_types::{QualifiedRangeSpec, RangeState};
use tabulite_wire::serial::{
    get_bool, get_i32, get_qualified_range, get_vstr_utf8, put_bool, put_i32,
    put_qualified_range, put_vstr,
};
use tabulite_wire::WireError;

use crate::metalog::{MetaLogEntity, MetaLogRecord};
use crate::{LogError, Result};

/// Type tag of range entities in an RSML stream.
pub const RANGE_ENTITY_TAG: u32 = 0x0101;

/// One live range owned by a range server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeEntity {
    pub spec: QualifiedRangeSpec,
    pub state: RangeState,
    /// Transfer log directory feeding this range, when one is attached
    /// (set while a phantom range is being populated).
    pub transfer_log: Option<String>,
}

impl RangeEntity {
    pub fn new(spec: QualifiedRangeSpec, state: RangeState) -> Self {
        Self {
            spec,
            state,
            transfer_log: None,
        }
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let spec = get_qualified_range(input).map_err(LogError::Decode)?;
        let state_raw = get_i32(input).map_err(LogError::Decode)?;
        let state = RangeState::from_i32(state_raw).ok_or(LogError::Decode(
            WireError::InvalidValue {
                field: "range state",
                value: i64::from(state_raw),
            },
        ))?;
        let transfer_log = if get_bool(input).map_err(LogError::Decode)? {
            Some(get_vstr_utf8(input).map_err(LogError::Decode)?)
        } else {
            None
        };
        Ok(Self {
            spec,
            state,
            transfer_log,
        })
    }

    /// Decodes a raw meta-log record into a range entity, skipping
    /// records of other types.
    pub fn from_record(record: &MetaLogRecord) -> Result<Option<Self>> {
        if record.type_tag != RANGE_ENTITY_TAG {
            return Ok(None);
        }
        let mut input = record.payload.as_ref();
        Self::decode(&mut input).map(Some)
    }
}

impl MetaLogEntity for RangeEntity {
    fn type_tag(&self) -> u32 {
        RANGE_ENTITY_TAG
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        put_qualified_range(buf, &self.spec);
        put_i32(buf, self.state.as_i32());
        match &self.transfer_log {
            Some(log) => {
                put_bool(buf, true);
                put_vstr(buf, log.as_bytes());
            }
            None => put_bool(buf, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metalog::{MetaLogReader, MetaLogWriter};
    use tabulite_types::{RangeSpec, TableId};
    use tempfile::TempDir;

    fn sample_entity(state: RangeState) -> RangeEntity {
        RangeEntity::new(
            QualifiedRangeSpec::new(
                TableId::new("7", 1),
                RangeSpec::new(&b"a"[..], &b"m"[..]),
            ),
            state,
        )
    }

    #[test]
    fn entity_round_trips_through_metalog() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rsml");
        let mut entity = sample_entity(RangeState::Phantom);
        entity.transfer_log = Some("logs/7/abc-123".to_string());

        let mut writer = MetaLogWriter::create(&path, &[]).unwrap();
        writer.append(&entity).unwrap();

        let records = MetaLogReader::read(&path).unwrap();
        let decoded = RangeEntity::from_record(&records[0]).unwrap().unwrap();
        assert_eq!(decoded, entity);
    }

    #[test]
    fn foreign_records_are_skipped() {
        let record = MetaLogRecord {
            type_tag: 0x9999,
            payload: bytes::Bytes::from_static(b"something else"),
        };
        assert!(RangeEntity::from_record(&record).unwrap().is_none());
    }
}

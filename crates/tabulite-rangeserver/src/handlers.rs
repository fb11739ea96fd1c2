//! Recovery request handlers.
//!
//! Thin dispatch from decoded wire requests to the phantom-range engine.
//! Handlers reply rather than fail: a malformed or misrouted request
//! produces a protocol-level error in the response and leaves phantom
//! state untouched.

use std::sync::Mutex;

use tabulite_config::{DataLayout, FailoverConfig};
use tabulite_log::metalog::MetaLogWriter;
use tabulite_log::rsml::RangeEntity;
use tabulite_types::{ErrorCode, Location, QualifiedRangeSpec, RangeState};
use tabulite_wire::message::{
    AcknowledgeLoad, AcknowledgeLoadResponse, PhantomRangesRequest, PhantomReceive,
    PhantomUpdate, PhantomUpdateResponse, RangesComplete,
};
use tracing::{info, warn};

use crate::phantom_map::PhantomRangeMap;
use crate::schema::SchemaRegistry;
use crate::{RangeServerError, Result};

/// One range server's recovery-facing state.
pub struct RangeServerState {
    location: Location,
    phantom_map: PhantomRangeMap,
    schemas: SchemaRegistry,
    layout: DataLayout,
    failover: FailoverConfig,
    rsml: Mutex<MetaLogWriter>,
}

impl RangeServerState {
    pub fn new(location: Location, layout: DataLayout, failover: FailoverConfig) -> Result<Self> {
        let rsml = MetaLogWriter::open(&layout.server_meta_log(location.as_str()))?;
        Ok(Self {
            location,
            phantom_map: PhantomRangeMap::new(),
            schemas: SchemaRegistry::new(),
            layout,
            failover,
            rsml: Mutex::new(rsml),
        })
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn phantom_map(&self) -> &PhantomRangeMap {
        &self.phantom_map
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn failover(&self) -> &FailoverConfig {
        &self.failover
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// phantom-receive: allocate a phantom entry per assigned range,
    /// each expecting the full fragment set.
    pub fn handle_phantom_receive(&self, request: &PhantomReceive) -> Result<()> {
        info!(location = %self.location, failed = %request.location,
              ranges = request.ranges.len(), fragments = request.fragments.len(),
              "phantom receive");
        for range in &request.ranges {
            let schema = self.schemas.get_or_default(&range.table);
            self.phantom_map.get_or_create(
                range,
                RangeState::SteadyState,
                schema,
                &request.fragments,
            );
        }
        Ok(())
    }

    /// phantom-update: buffer one batch of cells into the named phantom
    /// range. A range with no phantom entry here is a protocol error;
    /// a batch for an already-complete fragment reports
    /// [`ErrorCode::FragmentAlreadyComplete`] so the player stops
    /// resending.
    pub fn handle_phantom_update(&self, request: &PhantomUpdate) -> PhantomUpdateResponse {
        let error = match self.phantom_map.get(&request.range) {
            None => {
                warn!(location = %self.location, range = %request.range,
                      "phantom update for unknown range");
                ErrorCode::PhantomRangeUnknown
            }
            Some(phantom) => {
                if phantom.add(request.fragment, request.more, request.payload.clone()) {
                    ErrorCode::Ok
                } else {
                    ErrorCode::FragmentAlreadyComplete
                }
            }
        };
        PhantomUpdateResponse {
            error,
            range: request.range.clone(),
            fragment: request.fragment,
        }
    }

    /// phantom-prepare-ranges: create each phantom's range object, merge
    /// its buffered fragments and write its transfer log.
    pub fn handle_phantom_prepare_ranges(&self, request: &PhantomRangesRequest) -> RangesComplete {
        let log_dir = self.layout.phantom_log_dir(self.location.as_str());
        let results = request
            .ranges
            .iter()
            .map(|range| (range.clone(), self.prepare_one(range, &log_dir)))
            .collect();
        RangesComplete {
            op_id: request.op_id,
            attempt: request.attempt,
            results,
        }
    }

    fn prepare_one(&self, range: &QualifiedRangeSpec, log_dir: &std::path::Path) -> ErrorCode {
        let Some(phantom) = self.phantom_map.get(range) else {
            warn!(location = %self.location, %range, "prepare for unknown phantom range");
            return ErrorCode::PhantomRangeUnknown;
        };
        let mut is_empty = true;
        let outcome = phantom
            .create_range()
            .and_then(|()| phantom.populate_range_and_log(log_dir, &mut is_empty));
        match outcome {
            Ok(()) => {
                info!(location = %self.location, %range, is_empty, "phantom range prepared");
                ErrorCode::Ok
            }
            Err(prepare_error) => {
                warn!(location = %self.location, %range, error = %prepare_error,
                      "phantom prepare failed");
                prepare_error.code()
            }
        }
    }

    /// phantom-commit-ranges: durably record each range live in this
    /// server's meta-log and flip the phantom.
    pub fn handle_phantom_commit_ranges(&self, request: &PhantomRangesRequest) -> RangesComplete {
        let results = request
            .ranges
            .iter()
            .map(|range| (range.clone(), self.commit_one(range)))
            .collect();
        RangesComplete {
            op_id: request.op_id,
            attempt: request.attempt,
            results,
        }
    }

    fn commit_one(&self, range: &QualifiedRangeSpec) -> ErrorCode {
        let Some(phantom) = self.phantom_map.get(range) else {
            warn!(location = %self.location, %range, "commit for unknown phantom range");
            return ErrorCode::PhantomRangeUnknown;
        };
        let mut entity = RangeEntity::new(range.clone(), RangeState::SteadyState);
        entity.transfer_log = phantom
            .transfer_log()
            .map(|path| path.display().to_string());
        match self.rsml.lock().unwrap().append(&entity) {
            Ok(()) => {
                phantom.mark_live();
                info!(location = %self.location, %range, "range committed live");
                ErrorCode::Ok
            }
            Err(commit_error) => {
                warn!(location = %self.location, %range, error = %commit_error,
                      "phantom commit failed");
                RangeServerError::Log(commit_error).code()
            }
        }
    }

    /// acknowledge-load: the master has recorded the commit; retire the
    /// phantom entries.
    pub fn handle_acknowledge_load(&self, request: &AcknowledgeLoad) -> AcknowledgeLoadResponse {
        let results = request
            .ranges
            .iter()
            .map(|range| {
                let code = if self.phantom_map.remove(range).is_some() {
                    info!(location = %self.location, %range, "acknowledged load");
                    ErrorCode::Ok
                } else {
                    warn!(location = %self.location, %range,
                          "acknowledge for unknown phantom range");
                    ErrorCode::PhantomRangeUnknown
                };
                (range.clone(), code)
            })
            .collect();
        AcknowledgeLoadResponse {
            error: ErrorCode::Ok,
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phantom::PhantomState;
    use bytes::{Bytes, BytesMut};
    use tabulite_log::metalog::MetaLogReader;
    use tabulite_types::{CellKey, RangeSpec, TableId};
    use tabulite_wire::serial::put_cell;
    use tempfile::TempDir;

    fn qrs(start: &str, end: &str) -> QualifiedRangeSpec {
        QualifiedRangeSpec::new(
            TableId::new("7", 1),
            RangeSpec::new(start.as_bytes().to_vec(), end.as_bytes().to_vec()),
        )
    }

    fn state(dir: &TempDir) -> RangeServerState {
        RangeServerState::new(
            Location::from("d1"),
            DataLayout::new(dir.path()),
            FailoverConfig::default(),
        )
        .unwrap()
    }

    fn payload(row: &str, revision: i64, value: &str) -> Bytes {
        let mut buf = BytesMut::new();
        put_cell(
            &mut buf,
            &CellKey::new(row.as_bytes().to_vec(), revision),
            value.as_bytes(),
        );
        buf.freeze()
    }

    fn receive(state: &RangeServerState, range: &QualifiedRangeSpec, fragments: Vec<u32>) {
        state
            .handle_phantom_receive(&PhantomReceive {
                location: Location::from("rs1"),
                fragments,
                ranges: vec![range.clone()],
            })
            .unwrap();
    }

    #[test]
    fn full_receiver_flow_to_acknowledge() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let range = qrs("a", "m");
        receive(&state, &range, vec![42]);

        let response = state.handle_phantom_update(&PhantomUpdate {
            location: Location::from("rs1"),
            range: range.clone(),
            fragment: 42,
            more: false,
            payload: payload("b", 1, "v"),
        });
        assert_eq!(response.error, ErrorCode::Ok);
        assert_eq!(
            state.phantom_map().get(&range).unwrap().state(),
            PhantomState::FinishedReplay
        );

        let prepare = state.handle_phantom_prepare_ranges(&PhantomRangesRequest {
            op_id: 1,
            attempt: 1,
            location: Location::from("rs1"),
            ranges: vec![range.clone()],
            timeout_ms: 1000,
        });
        assert_eq!(prepare.results[0].1, ErrorCode::Ok);

        let commit = state.handle_phantom_commit_ranges(&PhantomRangesRequest {
            op_id: 1,
            attempt: 1,
            location: Location::from("rs1"),
            ranges: vec![range.clone()],
            timeout_ms: 1000,
        });
        assert_eq!(commit.results[0].1, ErrorCode::Ok);

        // commit is durable in this server's meta-log
        let records =
            MetaLogReader::read(&DataLayout::new(dir.path()).server_meta_log("d1")).unwrap();
        let entity = RangeEntity::from_record(&records[0]).unwrap().unwrap();
        assert_eq!(entity.spec, range);
        assert_eq!(entity.state, RangeState::SteadyState);
        assert!(entity.transfer_log.is_some());

        let ack = state.handle_acknowledge_load(&AcknowledgeLoad {
            ranges: vec![range.clone()],
        });
        assert_eq!(ack.results[0].1, ErrorCode::Ok);
        assert!(state.phantom_map().is_empty());
    }

    #[test]
    fn update_for_unknown_range_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let response = state.handle_phantom_update(&PhantomUpdate {
            location: Location::from("rs1"),
            range: qrs("a", "m"),
            fragment: 1,
            more: true,
            payload: Bytes::new(),
        });
        assert_eq!(response.error, ErrorCode::PhantomRangeUnknown);
        assert!(state.phantom_map().is_empty());
    }

    #[test]
    fn duplicate_final_update_reports_fragment_complete() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let range = qrs("a", "m");
        receive(&state, &range, vec![1]);

        let update = PhantomUpdate {
            location: Location::from("rs1"),
            range: range.clone(),
            fragment: 1,
            more: false,
            payload: payload("b", 1, "v"),
        };
        assert_eq!(state.handle_phantom_update(&update).error, ErrorCode::Ok);
        assert_eq!(
            state.handle_phantom_update(&update).error,
            ErrorCode::FragmentAlreadyComplete
        );
    }

    #[test]
    fn phantom_receive_is_idempotent_across_attempts() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let range = qrs("a", "m");
        receive(&state, &range, vec![1, 2]);
        let first = state.phantom_map().get(&range).unwrap();
        receive(&state, &range, vec![1, 2]);
        let second = state.phantom_map().get(&range).unwrap();
        assert!(std::sync::Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn prepare_for_unknown_range_reports_per_range_error() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let report = state.handle_phantom_prepare_ranges(&PhantomRangesRequest {
            op_id: 1,
            attempt: 1,
            location: Location::from("rs1"),
            ranges: vec![qrs("a", "m")],
            timeout_ms: 1000,
        });
        assert_eq!(report.results[0].1, ErrorCode::PhantomRangeUnknown);
    }
}

//! Per-group replay protocol coordinator.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use bytes::BytesMut;
use tabulite_chaos::maybe_fail;
use tabulite_log::fragment::fragment_ids;
use tabulite_plan::RecoveryPlan;
use tabulite_types::{Location, QualifiedRangeStateSpec, RangeGroup, RangeState};
use tabulite_wire::message::{AcknowledgeLoad, PhantomRangesRequest, PhantomReceive, ReplayFragments};
use tabulite_wire::serial::{get_i32, get_vstr_utf8, put_i32, put_vstr};
use tracing::{error, info, warn};

use crate::ops::MML_RECOVER_RANGES_TAG;
use crate::processor::{Operation, OperationState, OperationStatus};
use crate::rpc::RecoveryRpc;
use crate::tracker::{RangeTracker, ReplayTracker};
use crate::{dependency, Context, Error, Result};
use tabulite_log::metalog::MetaLogEntity;

/// Recovers one group of a failed server's ranges.
///
/// Drives INITIAL → ISSUE_REQUESTS → PREPARE → COMMIT → ACKNOWLEDGE,
/// validating the plan before each phase and falling back to INITIAL
/// (plan repair, fresh attempt) whenever a phase fails or a participant
/// disappears.
pub struct RecoverRanges {
    id: i64,
    ctx: Arc<Context>,
    rpc: Arc<dyn RecoveryRpc>,
    location: Location,
    group: RangeGroup,
    attempt: u32,
    ranges: Vec<QualifiedRangeStateSpec>,
    fragments: Vec<u32>,
    plan: RecoveryPlan,
    state: OperationState,
    status: OperationStatus,
    outcome: Arc<OnceLock<bool>>,
    dependencies: BTreeSet<String>,
    obstructions: BTreeSet<String>,
}

impl RecoverRanges {
    pub fn new(
        ctx: Arc<Context>,
        rpc: Arc<dyn RecoveryRpc>,
        location: Location,
        group: RangeGroup,
        ranges: Vec<QualifiedRangeStateSpec>,
    ) -> Self {
        let id = ctx.next_op_id();
        let dependencies = dependency::group_dependencies(group).into_iter().collect();
        let obstructions =
            BTreeSet::from([dependency::group_obstruction(group, &location)]);
        Self {
            id,
            ctx,
            rpc,
            location,
            group,
            attempt: 0,
            ranges,
            fragments: Vec::new(),
            plan: RecoveryPlan::default(),
            state: OperationState::Initial,
            status: OperationStatus::InProgress,
            outcome: Arc::new(OnceLock::new()),
            dependencies,
            obstructions,
        }
    }

    /// Rebuilds the operation from its last recorded meta-log state; the
    /// range and fragment lists are recovered from the persisted plan.
    pub fn resume(
        ctx: Arc<Context>,
        rpc: Arc<dyn RecoveryRpc>,
        entity: &RecoverRangesEntity,
    ) -> Self {
        let ranges = entity
            .plan
            .receiver_plan
            .get_locations()
            .iter()
            .flat_map(|location| entity.plan.receiver_plan.get_state_specs_for(location))
            .collect();
        let mut op = Self::new(ctx, rpc, entity.location.clone(), entity.group, ranges);
        op.attempt = entity.attempt;
        op.state = entity.state;
        op.fragments = entity.plan.replay_plan.get_fragments();
        op.plan = entity.plan.clone();
        op
    }

    pub fn group(&self) -> RangeGroup {
        self.group
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn entity(&self) -> RecoverRangesEntity {
        RecoverRangesEntity {
            location: self.location.clone(),
            group: self.group,
            attempt: self.attempt,
            state: self.state,
            plan: self.plan.clone(),
        }
    }

    fn record_state(&self) -> Result<()> {
        self.ctx.record_state(&self.entity())
    }

    /// Shared flag the parent operation reads before finalizing: set to
    /// true on success, false on permanent failure.
    pub fn outcome_handle(&self) -> Arc<OnceLock<bool>> {
        self.outcome.clone()
    }

    fn complete_ok(&mut self) {
        self.outcome.set(true).ok();
        self.status = OperationStatus::CompleteOk;
    }

    fn fail(&mut self, error: Error) {
        error!(location = %self.location, group = %self.group, %error,
               "recover ranges failed");
        self.outcome.set(false).ok();
        self.status = OperationStatus::CompleteError(error);
    }

    /// Drops back to INITIAL for plan repair on the next invocation.
    fn reenter_initial(&mut self) -> Result<()> {
        self.state = OperationState::Initial;
        self.record_state()
    }

    fn probe(&self, site: &str) -> Result<()> {
        maybe_fail(&format!(
            "recover-server-ranges-{}-{site}",
            self.group.as_str()
        ))?;
        Ok(())
    }

    // ========================================================================
    // Plan construction and repair
    // ========================================================================

    /// Builds a fresh plan, or repairs the existing one by reassigning
    /// every entry whose location is no longer connected.
    fn get_recovery_plan(&mut self) -> Result<()> {
        let connected: Vec<Location> = self.ctx.get_connected_locations().into_iter().collect();
        assert!(
            !connected.is_empty(),
            "recovery requires at least one connected server"
        );

        if self.plan.is_unknown() {
            self.plan = RecoveryPlan::new(self.group);
            if self.fragments.is_empty() {
                self.read_fragment_ids()?;
            }
            let ranges = self.ranges.clone();
            self.assign_ranges(&ranges, &connected);
            let fragments = self.fragments.clone();
            self.assign_players(&fragments, &connected);
            return Ok(());
        }

        let connected_set: BTreeSet<&Location> = connected.iter().collect();

        // Snapshot the indexes before reassigning: repair mutates the
        // plan it reads.
        let players: Vec<Location> = self.plan.replay_plan.get_locations().into_iter().collect();
        for player in players {
            if !connected_set.contains(&player) {
                let fragments = self.plan.replay_plan.get_fragments_for(&player);
                info!(%player, count = fragments.len(),
                      "reassigning fragments from disconnected player");
                self.assign_players(&fragments, &connected);
            }
        }

        let receivers: Vec<Location> =
            self.plan.receiver_plan.get_locations().into_iter().collect();
        for receiver in receivers {
            if !connected_set.contains(&receiver) {
                let ranges = self.plan.receiver_plan.get_state_specs_for(&receiver);
                info!(%receiver, count = ranges.len(),
                      "reassigning ranges from disconnected receiver");
                self.assign_ranges(&ranges, &connected);
            }
        }
        Ok(())
    }

    fn assign_ranges(&mut self, ranges: &[QualifiedRangeStateSpec], connected: &[Location]) {
        for (range, location) in ranges.iter().zip(connected.iter().cycle()) {
            self.plan
                .receiver_plan
                .insert(location.clone(), range.spec.clone(), range.state);
        }
    }

    fn assign_players(&mut self, fragments: &[u32], connected: &[Location]) {
        for (&fragment, location) in fragments.iter().zip(connected.iter().cycle()) {
            self.plan.replay_plan.insert(location.clone(), fragment);
        }
    }

    /// Enumerates the failed server's log fragments for this group.
    fn read_fragment_ids(&mut self) -> Result<()> {
        let dir = self
            .ctx
            .layout
            .commit_log_dir(self.location.as_str(), self.group.as_str());
        self.fragments = fragment_ids(&dir)?;
        Ok(())
    }

    /// Every player and every receiver in the plan must still be
    /// connected.
    fn validate_recovery_plan(&self) -> bool {
        if self.plan.is_unknown() {
            return false;
        }
        let connected = self.ctx.get_connected_locations();
        self.plan
            .replay_plan
            .get_locations()
            .iter()
            .chain(self.plan.receiver_plan.get_locations().iter())
            .all(|location| connected.contains(location))
    }

    // ========================================================================
    // Phase drivers
    // ========================================================================

    /// The log phase: phantom-receive to every receiver, then fragment
    /// replay on every player, tracked to completion.
    fn replay_commit_log(&mut self) -> Result<bool> {
        self.attempt += 1;

        let fragments = self.plan.replay_plan.get_fragments();
        for receiver in self.plan.receiver_plan.get_locations() {
            let ranges = self.plan.receiver_plan.get_ranges_for(&receiver);
            let request = PhantomReceive {
                location: self.location.clone(),
                fragments: fragments.clone(),
                ranges,
            };
            if let Err(rpc_error) = self.rpc.phantom_receive(&receiver, request) {
                error!(%receiver, error = %rpc_error, "phantom receive failed");
                return Ok(false);
            }
        }

        let tracker = Arc::new(ReplayTracker::new(self.attempt));
        self.ctx.install_replay_tracker(self.id, tracker.clone());
        let timeout = self.ctx.failover.replay_timeout();

        for player in self.plan.replay_plan.get_locations() {
            let player_fragments = self.plan.replay_plan.get_fragments_for(&player);
            tracker.add(&player_fragments);
            let request = ReplayFragments {
                op_id: self.id,
                attempt: self.attempt,
                recover_location: self.location.clone(),
                group: self.group,
                fragments: player_fragments.clone(),
                receiver_plan: self.plan.receiver_plan.entries(),
                timeout_ms: timeout.as_millis() as u32,
            };
            if let Err(rpc_error) = self.rpc.replay_fragments(&player, request) {
                warn!(%player, error = %rpc_error, "replay fragments send failed");
                tracker.set_errors(&player_fragments, rpc_error.code());
            }
        }

        let errors = tracker.wait_for_completion(timeout);
        self.ctx.erase_replay_tracker(self.id);
        Ok(!errors)
    }

    /// Prepare phase: receivers merge buffered fragments and stage their
    /// phantom ranges.
    fn prepare_to_commit(&mut self) -> Result<bool> {
        let tracker = Arc::new(RangeTracker::new(self.attempt));
        self.ctx.install_prepare_tracker(self.id, tracker.clone());
        let errors = self.drive_range_phase(&tracker, |rpc, dest, request| {
            rpc.phantom_prepare_ranges(dest, request)
        });
        self.ctx.erase_prepare_tracker(self.id);
        Ok(!errors)
    }

    /// Commit phase: receivers durably flip their phantom ranges live.
    fn commit(&mut self) -> Result<bool> {
        let tracker = Arc::new(RangeTracker::new(self.attempt));
        self.ctx.install_commit_tracker(self.id, tracker.clone());
        let errors = self.drive_range_phase(&tracker, |rpc, dest, request| {
            rpc.phantom_commit_ranges(dest, request)
        });
        self.ctx.erase_commit_tracker(self.id);
        Ok(!errors)
    }

    fn drive_range_phase(
        &self,
        tracker: &Arc<RangeTracker>,
        send: impl Fn(&dyn RecoveryRpc, &Location, PhantomRangesRequest) -> Result<()>,
    ) -> bool {
        let timeout = self.ctx.failover.request_timeout();
        for receiver in self.plan.receiver_plan.get_locations() {
            let ranges = self.plan.receiver_plan.get_ranges_for(&receiver);
            tracker.add(&ranges);
            let request = PhantomRangesRequest {
                op_id: self.id,
                attempt: self.attempt,
                location: self.location.clone(),
                ranges: ranges.clone(),
                timeout_ms: timeout.as_millis() as u32,
            };
            if let Err(rpc_error) = send(self.rpc.as_ref(), &receiver, request) {
                warn!(%receiver, error = %rpc_error, "range phase send failed");
                tracker.set_range_errors(&ranges, rpc_error.code());
            }
        }
        tracker.wait_for_completion(timeout)
    }

    /// Acknowledge phase: best-effort. The flip-live is already durable
    /// on the destinations; a failure here is logged and swallowed.
    fn acknowledge(&self) {
        for receiver in self.plan.receiver_plan.get_locations() {
            let ranges = self.plan.receiver_plan.get_ranges_for(&receiver);
            match self
                .rpc
                .acknowledge_load(&receiver, AcknowledgeLoad { ranges })
            {
                Ok(response) => {
                    for (range, code) in &response.results {
                        if !code.is_ok() {
                            warn!(%receiver, %range, %code, "acknowledge load range error");
                        }
                    }
                }
                Err(rpc_error) => {
                    warn!(%receiver, error = %rpc_error, "acknowledge load failed");
                }
            }
        }
    }
}

impl Operation for RecoverRanges {
    fn id(&self) -> i64 {
        self.id
    }

    fn label(&self) -> String {
        format!("RecoverServerRanges {} type={}", self.location, self.group)
    }

    fn status(&self) -> &OperationStatus {
        &self.status
    }

    fn dependencies(&self) -> BTreeSet<String> {
        self.dependencies.clone()
    }

    fn obstructions(&self) -> BTreeSet<String> {
        self.obstructions.clone()
    }

    fn execute(&mut self) -> Vec<Box<dyn Operation>> {
        info!(location = %self.location, group = %self.group,
              attempt = self.attempt, state = self.state.as_str(),
              "entering RecoverServerRanges");

        if let Err(error) = self.run_states() {
            self.fail(error);
        }

        info!(location = %self.location, group = %self.group,
              attempt = self.attempt, state = self.state.as_str(),
              "leaving RecoverServerRanges");
        Vec::new()
    }
}

impl RecoverRanges {
    fn run_states(&mut self) -> Result<()> {
        // Set when the preceding state ran in this same invocation; the
        // plan was validated or built moments ago and needn't be
        // re-checked before falling through.
        let mut fell_through = false;

        if self.state == OperationState::Initial {
            if self.attempt >= self.ctx.failover.retry_cap {
                return Err(Error::RetriesExhausted {
                    location: self.location.clone(),
                    group: self.group,
                    attempts: self.attempt,
                });
            }
            self.get_recovery_plan()?;

            if self.fragments.is_empty() || self.ranges.is_empty() {
                info!(location = %self.location, group = %self.group,
                      num_fragments = self.fragments.len(),
                      num_ranges = self.ranges.len(),
                      "nothing to do, recovery complete");
                self.complete_ok();
                return Ok(());
            }

            self.state = OperationState::IssueRequests;
            self.probe("INITIAL-a")?;
            self.record_state()?;
            self.probe("INITIAL-b")?;
            fell_through = true;
        }

        if self.state == OperationState::IssueRequests {
            if !fell_through && !self.validate_recovery_plan() {
                return self.reenter_initial();
            }
            if !self.replay_commit_log()? {
                return self.reenter_initial();
            }
            self.state = OperationState::Prepare;
            self.record_state()?;
            fell_through = true;
        }

        if self.state == OperationState::Prepare {
            if !fell_through && !self.validate_recovery_plan() {
                return self.reenter_initial();
            }
            if !self.prepare_to_commit()? {
                return self.reenter_initial();
            }
            self.state = OperationState::Commit;
            self.record_state()?;
            fell_through = true;
        }

        if self.state == OperationState::Commit {
            if !fell_through && !self.validate_recovery_plan() {
                return self.reenter_initial();
            }
            if !self.commit()? {
                return self.reenter_initial();
            }
            self.state = OperationState::Acknowledge;
            self.record_state()?;
            fell_through = true;
        }

        if self.state == OperationState::Acknowledge {
            if !fell_through && !self.validate_recovery_plan() {
                return self.reenter_initial();
            }
            self.acknowledge();
            self.complete_ok();
        }
        Ok(())
    }
}

/// Durable meta-log image of a [`RecoverRanges`] operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverRangesEntity {
    pub location: Location,
    pub group: RangeGroup,
    pub attempt: u32,
    pub state: OperationState,
    pub plan: RecoveryPlan,
}

impl RecoverRangesEntity {
    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let location = Location::from(get_vstr_utf8(input)?);
        let group_raw = get_i32(input)?;
        let group =
            RangeGroup::from_i32(group_raw).ok_or(tabulite_wire::WireError::InvalidValue {
                field: "range group",
                value: i64::from(group_raw),
            })?;
        let attempt = get_i32(input)? as u32;
        let state_raw = get_i32(input)?;
        let state = OperationState::from_i32(state_raw).ok_or(
            tabulite_wire::WireError::InvalidValue {
                field: "operation state",
                value: i64::from(state_raw),
            },
        )?;
        let plan = RecoveryPlan::decode(input)?;
        Ok(Self {
            location,
            group,
            attempt,
            state,
            plan,
        })
    }
}

impl MetaLogEntity for RecoverRangesEntity {
    fn type_tag(&self) -> u32 {
        MML_RECOVER_RANGES_TAG
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        put_vstr(buf, self.location.as_str().as_bytes());
        put_i32(buf, self.group.as_i32());
        put_i32(buf, self.attempt as i32);
        put_i32(buf, self.state.as_i32());
        self.plan.encode(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabulite_types::{QualifiedRangeSpec, RangeSpec, TableId};

    #[test]
    fn entity_round_trips() {
        let mut plan = RecoveryPlan::new(RangeGroup::User);
        plan.receiver_plan.insert(
            Location::from("rs2"),
            QualifiedRangeSpec::new(TableId::new("7", 1), RangeSpec::new(&b"a"[..], &b"m"[..])),
            RangeState::SteadyState,
        );
        plan.replay_plan.insert(Location::from("rs3"), 42);

        let entity = RecoverRangesEntity {
            location: Location::from("rs1"),
            group: RangeGroup::User,
            attempt: 3,
            state: OperationState::Prepare,
            plan,
        };
        let mut buf = BytesMut::new();
        entity.encode_payload(&mut buf);
        assert_eq!(RecoverRangesEntity::decode(&mut &buf[..]).unwrap(), entity);
    }

    #[test]
    fn group_dependency_edges() {
        // USER recovery waits on every earlier group
        let deps = dependency::group_dependencies(RangeGroup::User);
        assert_eq!(deps, ["ROOT", "METADATA", "SYSTEM"].map(String::from));
        assert!(dependency::group_dependencies(RangeGroup::Root).is_empty());
    }
}

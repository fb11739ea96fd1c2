//! Top-level recovery operation for one failed range server.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::thread;

use bytes::BytesMut;
use tabulite_chaos::maybe_fail;
use tabulite_config::DataLayout;
use tabulite_log::metalog::{MetaLogEntity, MetaLogReader, MetaLogWriter};
use tabulite_log::rsml::RangeEntity;
use tabulite_types::{Location, QualifiedRangeStateSpec, RangeGroup};
use tabulite_wire::serial::{get_i32, get_vstr_utf8, put_i32, put_vstr};
use tracing::{error, info};

use crate::dependency;
use crate::lock::{LockHandle, LockService, LockStatus};
use crate::ops::{RecoverRanges, RecoverRangesEntity, MML_RECOVER_SERVER_TAG};
use crate::processor::{Operation, OperationState, OperationStatus};
use crate::rpc::RecoveryRpc;
use crate::{Context, Error, Result};

const LOCK_MAX_RETRIES: u32 = 10;

/// Recovers everything one failed range server owned.
///
/// States: INITIAL (read the server's meta-log, bin its ranges by group)
/// → ISSUE_REQUESTS (spawn one [`RecoverRanges`] per non-empty group) →
/// FINALIZE (retire the server's durable state, release its lock).
pub struct RecoverServer {
    id: i64,
    ctx: Arc<Context>,
    rpc: Arc<dyn RecoveryRpc>,
    locks: Arc<dyn LockService>,
    location: Location,
    state: OperationState,
    status: OperationStatus,
    lock_handle: Option<LockHandle>,
    groups: [Vec<QualifiedRangeStateSpec>; 4],
    sub_outcomes: Vec<Arc<OnceLock<bool>>>,
    dependencies: BTreeSet<String>,
    obstructions: BTreeSet<String>,
    grace_waited: bool,
}

impl RecoverServer {
    pub fn new(
        ctx: Arc<Context>,
        rpc: Arc<dyn RecoveryRpc>,
        locks: Arc<dyn LockService>,
        location: Location,
    ) -> Self {
        let id = ctx.next_op_id();
        Self {
            id,
            ctx,
            rpc,
            locks,
            location,
            state: OperationState::Initial,
            status: OperationStatus::InProgress,
            lock_handle: None,
            groups: Default::default(),
            sub_outcomes: Vec::new(),
            dependencies: BTreeSet::new(),
            obstructions: BTreeSet::from([dependency::RECOVER_SERVER.to_string()]),
            grace_waited: false,
        }
    }

    /// Rebuilds the operation from its last recorded meta-log state.
    pub fn resume(
        ctx: Arc<Context>,
        rpc: Arc<dyn RecoveryRpc>,
        locks: Arc<dyn LockService>,
        entity: &RecoverServerEntity,
    ) -> Self {
        let mut op = Self::new(ctx, rpc, locks, entity.location.clone());
        op.state = entity.state;
        op
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    fn entity(&self) -> RecoverServerEntity {
        RecoverServerEntity {
            location: self.location.clone(),
            state: self.state,
        }
    }

    fn fail(&mut self, error: Error) {
        error!(location = %self.location, %error, "recover server failed");
        self.status = OperationStatus::CompleteError(error);
    }

    /// Polls the failed server's connection state through the grace
    /// period. Returns true if the server came back.
    fn wait_for_server(&self) -> bool {
        let interval = self.ctx.failover.grace_period() / 10;
        for _ in 0..10 {
            if self.ctx.is_connected(&self.location) {
                return true;
            }
            thread::sleep(interval);
        }
        self.ctx.is_connected(&self.location)
    }

    /// Wins the exclusive lock on the failed server's coordination file,
    /// retrying through conflicts up to the retry cap.
    fn acquire_server_lock(&self) -> Result<LockHandle> {
        let path = DataLayout::server_lock_file(self.location.as_str());
        let retry_interval = self.ctx.failover.connection_retry_interval();
        let handle = self.locks.open(&path)?;
        let mut reported = false;

        for attempt in 0..=LOCK_MAX_RETRIES {
            match self.locks.try_lock(handle)? {
                LockStatus::Granted => {
                    info!(%path, "obtained lock on server file");
                    return Ok(handle);
                }
                LockStatus::Busy => {
                    if !reported {
                        info!(%path, "couldn't obtain lock due to conflict, entering retry loop");
                        reported = true;
                    }
                    if attempt == LOCK_MAX_RETRIES {
                        break;
                    }
                    thread::sleep(retry_interval);
                }
            }
        }
        self.locks.release(handle)?;
        Err(Error::LockConflict {
            path,
            attempts: LOCK_MAX_RETRIES,
        })
    }

    /// Reads the failed server's meta-log and bins its live ranges into
    /// the four recovery groups. Phantom entries are skipped; whichever
    /// recovery created them still owns them.
    fn read_rsml(&mut self) -> Result<()> {
        let path = self.ctx.layout.server_meta_log(self.location.as_str());
        for record in MetaLogReader::read(&path)? {
            let Some(entity) = RangeEntity::from_record(&record)? else {
                continue;
            };
            if entity.state.is_phantom() {
                continue;
            }
            let group = entity.spec.group();
            let index = match group {
                RangeGroup::Root => 0,
                RangeGroup::Metadata => 1,
                RangeGroup::System => 2,
                RangeGroup::User => 3,
            };
            self.groups[index].push(QualifiedRangeStateSpec::new(entity.spec, entity.state));
        }
        Ok(())
    }

    fn initial(&mut self) -> Result<()> {
        self.read_rsml()?;
        self.state = OperationState::IssueRequests;
        maybe_fail("recover-server-INITIAL-a")?;
        self.ctx.record_state(&self.entity())?;
        self.ctx.set_removed(&self.location, true);
        maybe_fail("recover-server-INITIAL-b")?;
        Ok(())
    }

    fn issue_requests(&mut self) -> Result<Vec<Box<dyn Operation>>> {
        let mut spawned: Vec<RecoverRanges> = Vec::new();
        for (index, group) in RangeGroup::ALL.iter().enumerate() {
            if self.groups[index].is_empty() {
                continue;
            }
            let sub = RecoverRanges::new(
                self.ctx.clone(),
                self.rpc.clone(),
                self.location.clone(),
                *group,
                std::mem::take(&mut self.groups[index]),
            );
            self.dependencies
                .insert(dependency::group_obstruction(*group, &self.location));
            self.sub_outcomes.push(sub.outcome_handle());
            spawned.push(sub);
        }
        self.state = OperationState::Finalize;

        // One durable batch: every new sub-operation plus the updated
        // parent.
        let entities: Vec<RecoverRangesEntity> =
            spawned.iter().map(RecoverRanges::entity).collect();
        let parent = self.entity();
        let mut refs: Vec<&dyn MetaLogEntity> = Vec::with_capacity(entities.len() + 1);
        for entity in &entities {
            refs.push(entity);
        }
        refs.push(&parent);
        self.ctx.record_state_batch(&refs)?;
        maybe_fail("recover-server-ISSUE_REQUESTS")?;

        Ok(spawned
            .into_iter()
            .map(|op| Box::new(op) as Box<dyn Operation>)
            .collect())
    }

    fn finalize(&mut self) -> Result<()> {
        maybe_fail("recover-server-FINALIZE-a")?;
        // A failed group recovery leaves the server's durable state in
        // place for the retry the operator will drive.
        if self
            .sub_outcomes
            .iter()
            .any(|outcome| outcome.get() != Some(&true))
        {
            return Err(Error::RecoveryIncomplete {
                location: self.location.clone(),
            });
        }
        // An empty meta-log atomically retires everything the dead
        // server owned.
        let rsml = self.ctx.layout.server_meta_log(self.location.as_str());
        MetaLogWriter::create(&rsml, &[])?;
        self.ctx.set_removed(&self.location, false);
        if let Some(handle) = self.lock_handle.take() {
            self.locks.release(handle)?;
        }
        self.status = OperationStatus::CompleteOk;
        maybe_fail("recover-server-FINALIZE-b")?;
        Ok(())
    }
}

impl Operation for RecoverServer {
    fn id(&self) -> i64 {
        self.id
    }

    fn label(&self) -> String {
        format!("RecoverServer {}", self.location)
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
        if self.lock_handle.is_none() {
            if self.state == OperationState::Initial && !self.grace_waited {
                self.grace_waited = true;
                if self.wait_for_server() {
                    info!(location = %self.location,
                          "server reconnected within grace period, abandoning recovery");
                    self.status = OperationStatus::CompleteOk;
                    return Vec::new();
                }
            }
            match self.acquire_server_lock() {
                Ok(handle) => self.lock_handle = Some(handle),
                Err(lock_error) => {
                    if self.state != OperationState::Initial {
                        // Nobody else may legally hold this lock once the
                        // operation has passed INITIAL.
                        self.fail(lock_error);
                    } else if self.ctx.is_connected(&self.location) {
                        info!(location = %self.location,
                              "server temporarily disconnected but back online");
                        self.status = OperationStatus::CompleteOk;
                    } else {
                        self.fail(lock_error);
                    }
                    return Vec::new();
                }
            }
        }

        info!(location = %self.location, state = self.state.as_str(),
              "entering RecoverServer");

        let spawned = match self.state {
            OperationState::Initial => self.initial().map(|()| Vec::new()),
            OperationState::IssueRequests => self.issue_requests(),
            OperationState::Finalize => self.finalize().map(|()| Vec::new()),
            other => unreachable!("unrecognized RecoverServer state {other:?}"),
        };

        info!(location = %self.location, state = self.state.as_str(),
              "leaving RecoverServer");

        match spawned {
            Ok(spawned) => spawned,
            Err(error) => {
                self.fail(error);
                Vec::new()
            }
        }
    }
}

/// Durable meta-log image of a [`RecoverServer`] operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverServerEntity {
    pub location: Location,
    pub state: OperationState,
}

impl RecoverServerEntity {
    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let location = Location::from(get_vstr_utf8(input)?);
        let state_raw = get_i32(input)?;
        let state = OperationState::from_i32(state_raw).ok_or(
            tabulite_wire::WireError::InvalidValue {
                field: "operation state",
                value: i64::from(state_raw),
            },
        )?;
        Ok(Self { location, state })
    }
}

impl MetaLogEntity for RecoverServerEntity {
    fn type_tag(&self) -> u32 {
        MML_RECOVER_SERVER_TAG
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        put_vstr(buf, self.location.as_str().as_bytes());
        put_i32(buf, self.state.as_i32());
    }
}

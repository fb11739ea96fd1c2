//! Master context: server registry, recovery trackers, durable state.
//!
//! One `Context` lives for the master's lifetime. It owns the
//! [`ServerList`] behind a single coarse mutex (lookups never suspend;
//! the only blocking point is [`Context::wait_for_server`]), the three
//! tracker maps keyed by operation id, and the master meta-log writer,
//! which is the sole writer of durable master state.
//!
//! Completion reports from range servers land here first: the context
//! decodes the payload, finds the tracker installed for the operation id,
//! and forwards the results. Reports for unknown operations or stale
//! attempts are logged and dropped; they are expected after restarts and
//! are never fatal.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tabulite_config::{DataLayout, FailoverConfig};
use tabulite_log::metalog::{MetaLogEntity, MetaLogWriter};
use tabulite_types::Location;
use tabulite_wire::message::{RangesComplete, ReplayComplete};
use tracing::{debug, warn};

use crate::server::{RangeServerConnection, ServerList};
use crate::tracker::{RangeTracker, ReplayTracker};
use crate::Result;

#[derive(Default)]
struct TrackerMaps {
    replay: HashMap<i64, Arc<ReplayTracker>>,
    prepare: HashMap<i64, Arc<RangeTracker>>,
    commit: HashMap<i64, Arc<RangeTracker>>,
}

/// Authoritative master-side state shared by every recovery operation.
pub struct Context {
    servers: Mutex<ServerList>,
    server_cond: Condvar,
    trackers: Mutex<TrackerMaps>,
    mml: Mutex<MetaLogWriter>,
    next_op_id: AtomicI64,
    pub failover: FailoverConfig,
    pub layout: DataLayout,
}

impl Context {
    /// Opens (or creates) the master meta-log under `layout` and builds
    /// an empty registry.
    pub fn new(failover: FailoverConfig, layout: DataLayout) -> Result<Self> {
        let mml = MetaLogWriter::open(&layout.master_meta_log())?;
        Ok(Self {
            servers: Mutex::new(ServerList::new()),
            server_cond: Condvar::new(),
            trackers: Mutex::new(TrackerMaps::default()),
            mml: Mutex::new(mml),
            next_op_id: AtomicI64::new(1),
            failover,
            layout,
        })
    }

    /// Mints an operation id.
    pub fn next_op_id(&self) -> i64 {
        self.next_op_id.fetch_add(1, Ordering::Relaxed)
    }

    // ========================================================================
    // Server registry
    // ========================================================================

    pub fn add_server(&self, conn: RangeServerConnection) {
        self.servers.lock().unwrap().add_server(conn);
    }

    /// Marks a server connected. Returns true iff this call transitioned
    /// the server from disconnected to connected; signals
    /// [`wait_for_server`](Self::wait_for_server) when the first server
    /// appears.
    pub fn connect_server(
        &self,
        location: &Location,
        hostname: &str,
        local_addr: SocketAddr,
        public_addr: SocketAddr,
    ) -> bool {
        let mut servers = self.servers.lock().unwrap();
        let (transitioned, first) =
            servers.connect_server(location, hostname, local_addr, public_addr);
        if first {
            self.server_cond.notify_all();
        }
        transitioned
    }

    pub fn disconnect_server(&self, location: &Location) -> bool {
        self.servers.lock().unwrap().disconnect_server(location)
    }

    pub fn erase_server(&self, location: &Location) {
        self.servers.lock().unwrap().erase_server(location);
    }

    /// Blocks until at least one server is connected.
    pub fn wait_for_server(&self) {
        let mut servers = self.servers.lock().unwrap();
        while servers.connected_count() == 0 {
            servers = self.server_cond.wait(servers).unwrap();
        }
    }

    pub fn is_connected(&self, location: &Location) -> bool {
        self.servers
            .lock()
            .unwrap()
            .find_by_location(location)
            .is_some_and(|conn| conn.connected())
    }

    pub fn find_server_by_location(&self, location: &Location) -> Option<RangeServerConnection> {
        self.servers
            .lock()
            .unwrap()
            .find_by_location(location)
            .cloned()
    }

    pub fn find_server_by_hostname(&self, hostname: &str) -> Option<RangeServerConnection> {
        self.servers
            .lock()
            .unwrap()
            .find_by_hostname(hostname)
            .cloned()
    }

    pub fn find_server_by_public_addr(&self, addr: SocketAddr) -> Option<RangeServerConnection> {
        self.servers
            .lock()
            .unwrap()
            .find_by_public_addr(addr)
            .cloned()
    }

    pub fn find_server_by_local_addr(&self, addr: SocketAddr) -> Option<RangeServerConnection> {
        self.servers
            .lock()
            .unwrap()
            .find_by_local_addr(addr)
            .cloned()
    }

    pub fn next_available_server(&self) -> Option<Location> {
        self.servers.lock().unwrap().next_available_server()
    }

    pub fn set_removed(&self, location: &Location, removed: bool) {
        self.servers.lock().unwrap().set_removed(location, removed);
    }

    pub fn get_servers(&self) -> Vec<RangeServerConnection> {
        self.servers.lock().unwrap().get_servers()
    }

    pub fn get_connected_locations(&self) -> BTreeSet<Location> {
        self.servers.lock().unwrap().get_connected_locations()
    }

    pub fn get_unbalanced_servers(&self, locations: &[Location]) -> Vec<RangeServerConnection> {
        self.servers.lock().unwrap().get_unbalanced_servers(locations)
    }

    pub fn set_servers_balanced(&self, locations: &[Location]) {
        let mut servers = self.servers.lock().unwrap();
        for location in locations {
            servers.set_balanced(location);
        }
    }

    // ========================================================================
    // Durable master state
    // ========================================================================

    /// Appends one state record to the master meta-log.
    pub fn record_state(&self, entity: &dyn MetaLogEntity) -> Result<()> {
        self.mml.lock().unwrap().append(entity)?;
        Ok(())
    }

    /// Appends several state records as one durable batch.
    pub fn record_state_batch(&self, entities: &[&dyn MetaLogEntity]) -> Result<()> {
        self.mml.lock().unwrap().append_batch(entities)?;
        Ok(())
    }

    // ========================================================================
    // Recovery trackers
    // ========================================================================

    /// Installs a replay tracker for an operation id, replacing any
    /// existing one.
    pub fn install_replay_tracker(&self, op_id: i64, tracker: Arc<ReplayTracker>) {
        self.trackers.lock().unwrap().replay.insert(op_id, tracker);
    }

    pub fn erase_replay_tracker(&self, op_id: i64) {
        self.trackers.lock().unwrap().replay.remove(&op_id);
    }

    pub fn install_prepare_tracker(&self, op_id: i64, tracker: Arc<RangeTracker>) {
        self.trackers.lock().unwrap().prepare.insert(op_id, tracker);
    }

    pub fn erase_prepare_tracker(&self, op_id: i64) {
        self.trackers.lock().unwrap().prepare.remove(&op_id);
    }

    pub fn install_commit_tracker(&self, op_id: i64, tracker: Arc<RangeTracker>) {
        self.trackers.lock().unwrap().commit.insert(op_id, tracker);
    }

    pub fn erase_commit_tracker(&self, op_id: i64) {
        self.trackers.lock().unwrap().commit.remove(&op_id);
    }

    // ========================================================================
    // Completion dispatch
    // ========================================================================

    /// Applies a replay-complete payload to the matching replay tracker.
    ///
    /// Unknown operation ids and stale attempts are dropped with a
    /// warning; both are routine after a restart.
    pub fn replay_complete(&self, payload: &[u8]) -> Result<()> {
        let report = ReplayComplete::decode(&mut &*payload)?;
        debug!(op_id = report.op_id, attempt = report.attempt, "replay complete");
        let tracker = self
            .trackers
            .lock()
            .unwrap()
            .replay
            .get(&report.op_id)
            .cloned();
        match tracker {
            Some(tracker) => {
                if !tracker.complete(report.attempt, &report.fragments) {
                    warn!(
                        op_id = report.op_id,
                        attempt = report.attempt,
                        "non-pending replay complete message received"
                    );
                }
            }
            None => warn!(
                op_id = report.op_id,
                attempt = report.attempt,
                "no replay tracker found for operation"
            ),
        }
        Ok(())
    }

    /// Applies a prepare report to the matching prepare tracker.
    pub fn prepare_complete(&self, payload: &[u8]) -> Result<()> {
        let report = RangesComplete::decode(&mut &*payload)?;
        debug!(op_id = report.op_id, attempt = report.attempt, "prepare complete");
        let tracker = self
            .trackers
            .lock()
            .unwrap()
            .prepare
            .get(&report.op_id)
            .cloned();
        match tracker {
            Some(tracker) => tracker.result_callback(report.attempt, &report.results),
            None => warn!(op_id = report.op_id, "no prepare tracker found for operation"),
        }
        Ok(())
    }

    /// Applies a commit report to the matching commit tracker.
    pub fn commit_complete(&self, payload: &[u8]) -> Result<()> {
        let report = RangesComplete::decode(&mut &*payload)?;
        debug!(op_id = report.op_id, attempt = report.attempt, "commit complete");
        let tracker = self
            .trackers
            .lock()
            .unwrap()
            .commit
            .get(&report.op_id)
            .cloned();
        match tracker {
            Some(tracker) => tracker.result_callback(report.attempt, &report.results),
            None => warn!(op_id = report.op_id, "no commit tracker found for operation"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tabulite_types::ErrorCode;
    use tempfile::TempDir;

    fn test_context() -> (Context, TempDir) {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path());
        (
            Context::new(FailoverConfig::default(), layout).unwrap(),
            dir,
        )
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn connect_reports_per_server_transition() {
        let (ctx, _dir) = test_context();
        ctx.add_server(RangeServerConnection::new(
            Location::from("rs1"),
            "host1",
            addr(1),
            addr(1001),
        ));
        assert!(ctx.connect_server(&Location::from("rs1"), "host1", addr(1), addr(1001)));
        assert!(!ctx.connect_server(&Location::from("rs1"), "host1", addr(1), addr(1001)));
    }

    #[test]
    fn tracker_install_overwrites_and_erase_is_idempotent() {
        let (ctx, _dir) = test_context();
        let first = Arc::new(ReplayTracker::new(1));
        let second = Arc::new(ReplayTracker::new(2));
        ctx.install_replay_tracker(7, first);
        ctx.install_replay_tracker(7, second.clone());

        // completion for attempt 2 must land on the second tracker
        let mut buf = BytesMut::new();
        ReplayComplete {
            op_id: 7,
            attempt: 2,
            fragments: vec![(1, ErrorCode::Ok)],
        }
        .encode(&mut buf);
        second.add(&[1]);
        ctx.replay_complete(&buf).unwrap();
        assert!(!second.wait_for_completion(std::time::Duration::from_millis(10)));

        ctx.erase_replay_tracker(7);
        ctx.erase_replay_tracker(7);
    }

    #[test]
    fn wait_for_server_wakes_on_first_connection() {
        let (ctx, _dir) = test_context();
        let ctx = Arc::new(ctx);
        let waiter = {
            let ctx = ctx.clone();
            std::thread::spawn(move || ctx.wait_for_server())
        };
        // give the waiter a moment to block
        std::thread::sleep(std::time::Duration::from_millis(20));
        ctx.connect_server(&Location::from("rs1"), "host1", addr(1), addr(1001));
        waiter.join().unwrap();
        assert!(ctx.is_connected(&Location::from("rs1")));
    }

    #[test]
    fn unknown_op_id_is_dropped() {
        let (ctx, _dir) = test_context();
        let mut buf = BytesMut::new();
        ReplayComplete {
            op_id: 99,
            attempt: 1,
            fragments: vec![],
        }
        .encode(&mut buf);
        // no tracker installed: logged and dropped, not an error
        ctx.replay_complete(&buf).unwrap();
    }

    #[test]
    fn malformed_completion_payload_is_an_error() {
        let (ctx, _dir) = test_context();
        assert!(ctx.replay_complete(&[0xff]).is_err());
    }
}

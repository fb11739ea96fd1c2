//! Fragment replay driver.

use std::path::Path;

use tabulite_config::FailoverConfig;
use tabulite_log::fragment::FragmentReader;
use tabulite_plan::ReceiverPlan;
use tabulite_types::ErrorCode;
use tabulite_wire::message::{ReplayComplete, ReplayFragments};
use tracing::{info, warn};

use crate::replay_buffer::{ReplayBuffer, UpdateSender};
use crate::Result;

/// Plays a replay-fragments request: reads each assigned fragment of the
/// failed server's log, routes its cells through the receiver plan, and
/// reports one per-fragment summary to the master.
pub struct ReplayPlayer<'a> {
    sender: &'a dyn UpdateSender,
    config: &'a FailoverConfig,
}

impl<'a> ReplayPlayer<'a> {
    pub fn new(sender: &'a dyn UpdateSender, config: &'a FailoverConfig) -> Self {
        Self { sender, config }
    }

    /// Replays every fragment in `request` from `commit_log_dir`.
    ///
    /// Fragments fail independently; a read error on one is reported in
    /// the summary and does not stop the rest.
    pub fn play(&self, commit_log_dir: &Path, request: &ReplayFragments) -> Result<()> {
        info!(op_id = request.op_id, attempt = request.attempt,
              location = %request.recover_location, group = %request.group,
              fragments = request.fragments.len(), "replaying fragments");

        let plan = ReceiverPlan::from_entries(request.receiver_plan.clone());
        let mut buffer = ReplayBuffer::new(
            self.sender,
            request.recover_location.clone(),
            plan,
            self.config,
        );

        let mut results = Vec::with_capacity(request.fragments.len());
        for &fragment in &request.fragments {
            buffer.begin_fragment(fragment);
            let code = match self.play_fragment(commit_log_dir, fragment, &mut buffer) {
                Ok(()) => ErrorCode::Ok,
                Err(replay_error) => {
                    warn!(fragment, error = %replay_error, "fragment replay failed");
                    replay_error.code()
                }
            };
            results.push((fragment, code));
        }

        self.sender.replay_complete(ReplayComplete {
            op_id: request.op_id,
            attempt: request.attempt,
            fragments: results,
        })
    }

    fn play_fragment(
        &self,
        commit_log_dir: &Path,
        fragment: u32,
        buffer: &mut ReplayBuffer<'_>,
    ) -> Result<()> {
        let reader = FragmentReader::open(commit_log_dir, fragment)?;
        for block in reader.blocks()? {
            for (key, value) in &block.cells {
                buffer.add(&block.table, key, value)?;
            }
        }
        buffer.finish_fragment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Mutex;
    use tabulite_log::codec::CompressionKind;
    use tabulite_log::fragment::FragmentWriter;
    use tabulite_types::{
        CellKey, Location, QualifiedRangeSpec, RangeSpec, RangeState, TableId,
    };
    use tabulite_wire::message::{PhantomUpdate, PhantomUpdateResponse, ReceiverEntry};
    use tempfile::TempDir;

    #[derive(Default)]
    struct CollectingSender {
        updates: Mutex<Vec<PhantomUpdate>>,
        reports: Mutex<Vec<ReplayComplete>>,
    }

    impl UpdateSender for CollectingSender {
        fn phantom_update(
            &self,
            _dest: &Location,
            update: PhantomUpdate,
        ) -> Result<PhantomUpdateResponse> {
            let response = PhantomUpdateResponse {
                error: ErrorCode::Ok,
                range: update.range.clone(),
                fragment: update.fragment,
            };
            self.updates.lock().unwrap().push(update);
            Ok(response)
        }

        fn replay_complete(&self, report: ReplayComplete) -> Result<()> {
            self.reports.lock().unwrap().push(report);
            Ok(())
        }
    }

    fn request(fragments: Vec<u32>) -> ReplayFragments {
        ReplayFragments {
            op_id: 9,
            attempt: 1,
            recover_location: Location::from("rs1"),
            group: tabulite_types::RangeGroup::User,
            fragments,
            receiver_plan: vec![ReceiverEntry {
                location: Location::from("d1"),
                spec: QualifiedRangeSpec::new(
                    TableId::new("7", 1),
                    RangeSpec::new(&b"a"[..], &b"m"[..]),
                ),
                state: RangeState::SteadyState,
            }],
            timeout_ms: 10_000,
        }
    }

    #[test]
    fn player_streams_fragment_and_reports_completion() {
        let dir = TempDir::new().unwrap();
        let table = TableId::new("7", 1);
        let mut writer = FragmentWriter::open(dir.path(), 42, CompressionKind::Lz4).unwrap();
        writer
            .append_cells(
                &table,
                &[
                    (CellKey::new(&b"b"[..], 1), Bytes::from_static(b"v1")),
                    (CellKey::new(&b"z"[..], 2), Bytes::from_static(b"dropped")),
                ],
            )
            .unwrap();
        writer.sync().unwrap();

        let sender = CollectingSender::default();
        let config = FailoverConfig::default();
        ReplayPlayer::new(&sender, &config)
            .play(dir.path(), &request(vec![42]))
            .unwrap();

        let reports = sender.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].fragments, vec![(42, ErrorCode::Ok)]);

        let updates = sender.updates.lock().unwrap();
        // single final update carrying the in-plan cell only
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].more);
        let cells = tabulite_wire::serial::get_cell_block(&updates[0].payload).unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].0.row.as_ref(), b"b");
    }

    #[test]
    fn missing_fragment_reports_error_but_summary_still_sent() {
        let dir = TempDir::new().unwrap();
        let sender = CollectingSender::default();
        let config = FailoverConfig::default();
        ReplayPlayer::new(&sender, &config)
            .play(dir.path(), &request(vec![7]))
            .unwrap();

        let reports = sender.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].fragments[0].0, 7);
        assert_ne!(reports[0].fragments[0].1, ErrorCode::Ok);
    }
}

//! Phantom ranges.
//!
//! A phantom range is a range in the process of being resurrected on its
//! new destination, invisible to clients. It moves through
//!
//! ```text
//! INIT → FINISHED_REPLAY → RANGE_CREATED → RANGE_PREPARED → LIVE
//! ```
//!
//! INIT while players stream fragment data in; FINISHED_REPLAY once every
//! expected fragment delivered its final batch; RANGE_CREATED once the
//! in-memory range object exists; RANGE_PREPARED once the buffered data
//! is merged and the transfer log written; LIVE after the commit phase
//! durably flips it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use tabulite_log::codec::CompressionKind;
use tabulite_log::fragment::FragmentWriter;
use tabulite_types::{QualifiedRangeSpec, RangeState};
use tabulite_wire::serial::{put_vi32, put_vstr};
use tracing::{debug, warn};

use crate::fragment_data::FragmentData;
use crate::range::Range;
use crate::schema::Schema;
use crate::Result;

/// Pause between attempts to find a fresh transfer-log directory name
/// when a same-second collision occurs.
const TRANSFER_LOG_RETRY: Duration = Duration::from_millis(1200);

/// Life-cycle state of a phantom range on its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PhantomState {
    Init,
    FinishedReplay,
    RangeCreated,
    RangePrepared,
    Live,
}

#[derive(Debug)]
struct Inner {
    initial_state: RangeState,
    fragments: BTreeMap<u32, FragmentData>,
    outstanding: usize,
    state: PhantomState,
    range: Option<Range>,
    transfer_log: Option<PathBuf>,
}

/// One range being resurrected. All access is serialized by the
/// per-phantom mutex.
#[derive(Debug)]
pub struct PhantomRange {
    spec: QualifiedRangeSpec,
    schema: Arc<Schema>,
    inner: Mutex<Inner>,
}

impl PhantomRange {
    pub fn new(
        spec: QualifiedRangeSpec,
        initial_state: RangeState,
        schema: Arc<Schema>,
        fragments: &[u32],
    ) -> Self {
        let fragment_map: BTreeMap<u32, FragmentData> = fragments
            .iter()
            .map(|&id| (id, FragmentData::new()))
            .collect();
        Self {
            spec,
            schema,
            inner: Mutex::new(Inner {
                initial_state,
                outstanding: fragment_map.len(),
                fragments: fragment_map,
                state: PhantomState::Init,
                range: None,
                transfer_log: None,
            }),
        }
    }

    pub fn spec(&self) -> &QualifiedRangeSpec {
        &self.spec
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The range state this phantom was seeded with (carried over from a
    /// prior attempt).
    pub fn initial_state(&self) -> RangeState {
        self.inner.lock().unwrap().initial_state
    }

    pub fn state(&self) -> PhantomState {
        self.inner.lock().unwrap().state
    }

    /// Buffers one phantom-update payload.
    ///
    /// Returns false for a late duplicate (the fragment already received
    /// its final batch); state is untouched in that case. The final
    /// batch of the last outstanding fragment moves the phantom to
    /// FINISHED_REPLAY.
    ///
    /// # Panics
    ///
    /// A fragment id outside the expected set is a programmer error.
    pub fn add(&self, fragment: u32, more: bool, payload: Bytes) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let data = inner
            .fragments
            .get_mut(&fragment)
            .unwrap_or_else(|| panic!("fragment {fragment} not expected by {}", self.spec));

        if data.complete() {
            return false;
        }
        data.add(more, payload);
        if !more {
            debug_assert!(inner.outstanding > 0);
            inner.outstanding -= 1;
            if inner.outstanding == 0 {
                inner.state = PhantomState::FinishedReplay;
            }
        }
        true
    }

    /// Fragments that have not yet received their final batch.
    pub fn incomplete_fragments(&self) -> Vec<u32> {
        let inner = self.inner.lock().unwrap();
        inner
            .fragments
            .iter()
            .filter(|(_, data)| !data.complete())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Drops the buffered data of incomplete fragments; used when the
    /// receiver abandons a replay attempt and expects a re-send.
    pub fn purge_incomplete_fragments(&self) {
        let mut inner = self.inner.lock().unwrap();
        for data in inner.fragments.values_mut() {
            if !data.complete() {
                data.discard_events();
            }
        }
    }

    /// Builds the in-memory range object for this phantom, finalizing
    /// any transfer log a prior attempt left behind. Idempotent with a
    /// warning if the range already exists.
    pub fn create_range(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state >= PhantomState::RangeCreated {
            warn!(range = %self.spec, "range already created for phantom range");
            return Ok(());
        }
        if let Some(prior) = inner.transfer_log.take() {
            if prior.exists() {
                warn!(range = %self.spec, log = %prior.display(),
                      "removing transfer log from earlier attempt");
                std::fs::remove_dir_all(&prior)?;
            }
        }
        inner.range = Some(Range::new(self.spec.clone(), RangeState::Phantom));
        inner.state = PhantomState::RangeCreated;
        Ok(())
    }

    /// Merges every buffered fragment into the range and writes the
    /// phantom commit log.
    ///
    /// The log directory is named
    /// `<log_dir>/<table_id>/<first-16-hex-of-md5(end_row)>-<unix_seconds>`;
    /// on a name collision the allocation sleeps and retries with a
    /// fresh timestamp. Sets `is_empty` to false if any fragment
    /// contributed data. Idempotent with a warning once prepared.
    pub fn populate_range_and_log(&self, log_dir: &Path, is_empty: &mut bool) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.state >= PhantomState::RangePrepared {
            warn!(range = %self.spec, "range already prepared for phantom range");
            return Ok(());
        }
        assert!(
            inner.state >= PhantomState::RangeCreated,
            "populate called before create_range for {}",
            self.spec
        );

        let dir = self.allocate_transfer_log(log_dir)?;
        let mut writer = FragmentWriter::open_path(dir.join("0"), CompressionKind::None)?;

        let range = inner.range.as_mut().expect("range exists after RANGE_CREATED");
        let mut latest_revision = i64::MIN;
        for data in inner.fragments.values() {
            let mut payload = BytesMut::new();
            put_vstr(&mut payload, self.spec.table.id.as_bytes());
            put_vi32(&mut payload, self.spec.table.generation as i32);
            let prefix_len = payload.len();

            let revision = data.merge(range, &mut payload)?;
            if revision > latest_revision {
                latest_revision = revision;
            }
            if payload.len() > prefix_len {
                *is_empty = false;
                writer.append_payload(&payload)?;
            }
        }
        writer.sync()?;
        debug!(range = %self.spec, log = %dir.display(), latest_revision,
               "phantom range prepared");

        inner.transfer_log = Some(dir);
        inner.state = PhantomState::RangePrepared;
        Ok(())
    }

    fn allocate_transfer_log(&self, log_dir: &Path) -> Result<PathBuf> {
        let digest = format!("{:x}", md5::compute(&self.spec.range.end_row));
        let prefix = &digest[..16];
        let mut first = true;
        loop {
            if !first {
                thread::sleep(TRANSFER_LOG_RETRY);
            }
            first = false;
            let seconds = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock after epoch")
                .as_secs();
            let dir = log_dir
                .join(&self.spec.table.id)
                .join(format!("{prefix}-{seconds}"));
            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
                return Ok(dir);
            }
        }
    }

    /// Durably committed by the destination: the range serves reads and
    /// writes from here on.
    pub fn mark_live(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(range) = inner.range.as_mut() {
            range.set_state(RangeState::SteadyState);
        }
        inner.state = PhantomState::Live;
    }

    /// Transfer-log directory, once prepared.
    pub fn transfer_log(&self) -> Option<PathBuf> {
        self.inner.lock().unwrap().transfer_log.clone()
    }

    /// Runs `f` against the in-memory range, if created.
    pub fn with_range<R>(&self, f: impl FnOnce(&Range) -> R) -> Option<R> {
        self.inner.lock().unwrap().range.as_ref().map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tabulite_types::{CellKey, RangeSpec, TableId};
    use tabulite_wire::serial::put_cell;
    use tempfile::TempDir;

    fn spec() -> QualifiedRangeSpec {
        QualifiedRangeSpec::new(
            TableId::new("7", 1),
            RangeSpec::new(&b"a"[..], &b"m"[..]),
        )
    }

    fn phantom(fragments: &[u32]) -> PhantomRange {
        let spec = spec();
        let schema = Arc::new(Schema::new(&spec.table, vec!["cf".to_string()]));
        PhantomRange::new(spec, RangeState::SteadyState, schema, fragments)
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

    #[test]
    fn finished_replay_after_every_final_batch() {
        let phantom = phantom(&[1, 2]);
        assert_eq!(phantom.state(), PhantomState::Init);

        assert!(phantom.add(1, true, payload("b", 1, "x")));
        assert!(phantom.add(1, false, payload("c", 2, "y")));
        assert_eq!(phantom.state(), PhantomState::Init);
        assert_eq!(phantom.incomplete_fragments(), vec![2]);

        assert!(phantom.add(2, false, Bytes::new()));
        assert_eq!(phantom.state(), PhantomState::FinishedReplay);
    }

    #[test]
    fn late_duplicate_is_rejected_without_state_change() {
        let phantom = phantom(&[1]);
        assert!(phantom.add(1, false, payload("b", 1, "x")));
        let state = phantom.state();
        assert!(!phantom.add(1, false, payload("b", 2, "y")));
        assert!(!phantom.add(1, true, payload("b", 3, "z")));
        assert_eq!(phantom.state(), state);
    }

    #[test]
    #[should_panic(expected = "not expected")]
    fn unexpected_fragment_is_fatal() {
        let phantom = phantom(&[1]);
        phantom.add(9, true, Bytes::new());
    }

    #[test]
    fn prepare_merges_data_and_writes_transfer_log() {
        let dir = TempDir::new().unwrap();
        let phantom = phantom(&[1]);
        phantom.add(1, true, payload("b", 5, "new"));
        phantom.add(1, false, payload("b", 3, "old"));

        phantom.create_range().unwrap();
        assert_eq!(phantom.state(), PhantomState::RangeCreated);

        let mut is_empty = true;
        phantom
            .populate_range_and_log(dir.path(), &mut is_empty)
            .unwrap();
        assert!(!is_empty);
        assert_eq!(phantom.state(), PhantomState::RangePrepared);

        let log = phantom.transfer_log().unwrap();
        assert!(log.starts_with(dir.path().join("7")));
        assert!(log.join("0").exists());

        // revision tie-break applied during the merge
        let value = phantom
            .with_range(|range| range.get(b"b").cloned())
            .unwrap()
            .unwrap();
        assert_eq!(value.as_ref(), b"new");
    }

    #[test]
    fn create_and_populate_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let phantom = phantom(&[1]);
        phantom.add(1, false, payload("b", 1, "v"));

        phantom.create_range().unwrap();
        phantom.create_range().unwrap();

        let mut is_empty = true;
        phantom
            .populate_range_and_log(dir.path(), &mut is_empty)
            .unwrap();
        phantom
            .populate_range_and_log(dir.path(), &mut is_empty)
            .unwrap();
        assert_eq!(phantom.state(), PhantomState::RangePrepared);
    }

    #[test]
    fn empty_fragments_leave_is_empty_set() {
        let dir = TempDir::new().unwrap();
        let phantom = phantom(&[1]);
        phantom.add(1, false, Bytes::new());
        phantom.create_range().unwrap();
        let mut is_empty = true;
        phantom
            .populate_range_and_log(dir.path(), &mut is_empty)
            .unwrap();
        assert!(is_empty);
    }

    #[test]
    fn mark_live_flips_range_state() {
        let phantom = phantom(&[1]);
        phantom.add(1, false, payload("b", 1, "v"));
        phantom.create_range().unwrap();
        phantom.mark_live();
        assert_eq!(phantom.state(), PhantomState::Live);
        let state = phantom.with_range(Range::state).unwrap();
        assert_eq!(state, RangeState::SteadyState);
    }
}

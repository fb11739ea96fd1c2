//! Player-side replay buffering.
//!
//! While a player scans a fragment, every cell is routed through the
//! receiver plan to the destination that will own its row and staged in
//! a per-range buffer. Two thresholds bound memory: a per-range byte
//! limit and an aggregate limit across all ranges; whichever trips
//! first flushes the staged batches as phantom-update messages with
//! `more = true`. Finishing a fragment sends a final batch per range
//! with `more = false`, empty or not, so receivers can count the
//! fragment complete.
//!
//! Cells whose row misses the plan are dropped: they belong to a range
//! already flipped live by an earlier attempt. Ranges whose receiver
//! reports the fragment complete are dropped for the rest of that
//! fragment; ranges whose receiver errors are evicted from the player's
//! local plan copy and left for the master's next attempt.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{Bytes, BytesMut};
use tabulite_config::FailoverConfig;
use tabulite_plan::ReceiverPlan;
use tabulite_types::{CellKey, ErrorCode, Location, QualifiedRangeSpec, TableId};
use tabulite_wire::message::{PhantomUpdate, PhantomUpdateResponse, ReplayComplete};
use tabulite_wire::serial::put_cell;
use tracing::warn;

use crate::Result;

/// Outbound seam for a player: updates to receivers, one summary to the
/// master.
pub trait UpdateSender: Send + Sync {
    /// Delivers one phantom-update to its receiver and returns the
    /// receiver's reply.
    fn phantom_update(&self, dest: &Location, update: PhantomUpdate)
        -> Result<PhantomUpdateResponse>;

    /// Delivers the player's replay summary to the master.
    fn replay_complete(&self, report: ReplayComplete) -> Result<()>;
}

/// Staged cells bound for one range on one destination.
#[derive(Debug)]
pub struct RangeReplayBuffer {
    location: Location,
    cells: BytesMut,
}

impl RangeReplayBuffer {
    pub fn new(location: Location) -> Self {
        Self {
            location,
            cells: BytesMut::new(),
        }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Stages one cell; returns the bytes added.
    pub fn add(&mut self, key: &CellKey, value: &[u8]) -> usize {
        let before = self.cells.len();
        put_cell(&mut self.cells, key, value);
        self.cells.len() - before
    }

    pub fn memory_used(&self) -> usize {
        self.cells.len()
    }

    /// Takes the staged payload, leaving the buffer empty.
    pub fn take_payload(&mut self) -> Bytes {
        self.cells.split().freeze()
    }
}

/// Routes and stages one fragment's cells across all planned ranges.
pub struct ReplayBuffer<'a> {
    sender: &'a dyn UpdateSender,
    recover_location: Location,
    plan: ReceiverPlan,
    buffers: BTreeMap<QualifiedRangeSpec, RangeReplayBuffer>,
    completed: BTreeSet<QualifiedRangeSpec>,
    memory_used: usize,
    flush_limit_aggregate: usize,
    flush_limit_per_range: usize,
    fragment: u32,
}

impl<'a> ReplayBuffer<'a> {
    pub fn new(
        sender: &'a dyn UpdateSender,
        recover_location: Location,
        plan: ReceiverPlan,
        config: &FailoverConfig,
    ) -> Self {
        let buffers = plan
            .get_locations()
            .into_iter()
            .flat_map(|location| {
                plan.get_ranges_for(&location)
                    .into_iter()
                    .map(move |range| (range, RangeReplayBuffer::new(location.clone())))
            })
            .collect();
        Self {
            sender,
            recover_location,
            plan,
            buffers,
            completed: BTreeSet::new(),
            memory_used: 0,
            flush_limit_aggregate: config.flush_limit_aggregate,
            flush_limit_per_range: config.flush_limit_per_range,
            fragment: 0,
        }
    }

    /// Resets per-fragment state for the next fragment.
    pub fn begin_fragment(&mut self, fragment: u32) {
        self.fragment = fragment;
        self.completed.clear();
    }

    /// Routes one cell to its planned receiver.
    pub fn add(&mut self, table: &TableId, key: &CellKey, value: &[u8]) -> Result<()> {
        // cells outside the plan belong to ranges already recovered
        let Some(range) = self.plan.get_range(table, &key.row) else {
            return Ok(());
        };
        if self.completed.contains(&range) {
            return Ok(());
        }
        let Some(buffer) = self.buffers.get_mut(&range) else {
            return Ok(());
        };
        self.memory_used += buffer.add(key, value);
        let over_per_range = buffer.memory_used() > self.flush_limit_per_range;
        if over_per_range || self.memory_used > self.flush_limit_aggregate {
            self.flush()?;
        }
        Ok(())
    }

    /// Sends every non-empty staged batch with `more = true`.
    pub fn flush(&mut self) -> Result<()> {
        self.send_updates(true, false)
    }

    /// Sends the final batch of the current fragment for every surviving
    /// range, empty batches included, with `more = false`.
    pub fn finish_fragment(&mut self) -> Result<()> {
        self.send_updates(false, true)
    }

    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    fn send_updates(&mut self, more: bool, include_empty: bool) -> Result<()> {
        let ranges: Vec<QualifiedRangeSpec> = self.buffers.keys().cloned().collect();
        for range in ranges {
            if self.completed.contains(&range) {
                continue;
            }
            let buffer = self.buffers.get_mut(&range).expect("buffer keyed by range");
            if !include_empty && buffer.memory_used() == 0 {
                continue;
            }
            let payload = buffer.take_payload();
            self.memory_used -= payload.len();
            let dest = buffer.location().clone();
            let update = PhantomUpdate {
                location: self.recover_location.clone(),
                range: range.clone(),
                fragment: self.fragment,
                more,
                payload,
            };
            match self.sender.phantom_update(&dest, update) {
                Ok(response) if response.error.is_ok() => {}
                Ok(response) if response.error == ErrorCode::FragmentAlreadyComplete => {
                    // receiver finished this fragment in a prior attempt
                    self.completed.insert(range);
                }
                Ok(response) => {
                    warn!(%dest, %range, error = %response.error,
                          "phantom update rejected, evicting range");
                    self.evict(&range);
                }
                Err(send_error) => {
                    warn!(%dest, %range, error = %send_error,
                          "phantom update send failed, evicting range");
                    self.evict(&range);
                }
            }
        }
        Ok(())
    }

    fn evict(&mut self, range: &QualifiedRangeSpec) {
        if let Some(buffer) = self.buffers.remove(range) {
            self.memory_used -= buffer.memory_used();
        }
        self.plan.erase(range);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tabulite_types::{RangeSpec, RangeState};

    fn qrs(start: &str, end: &str) -> QualifiedRangeSpec {
        QualifiedRangeSpec::new(
            TableId::new("7", 1),
            RangeSpec::new(start.as_bytes().to_vec(), end.as_bytes().to_vec()),
        )
    }

    #[derive(Default)]
    struct RecordingSender {
        updates: Mutex<Vec<(Location, PhantomUpdate)>>,
        complete_reply: Mutex<BTreeSet<QualifiedRangeSpec>>,
    }

    impl UpdateSender for RecordingSender {
        fn phantom_update(
            &self,
            dest: &Location,
            update: PhantomUpdate,
        ) -> Result<PhantomUpdateResponse> {
            let error = if self.complete_reply.lock().unwrap().contains(&update.range) {
                ErrorCode::FragmentAlreadyComplete
            } else {
                ErrorCode::Ok
            };
            let response = PhantomUpdateResponse {
                error,
                range: update.range.clone(),
                fragment: update.fragment,
            };
            self.updates.lock().unwrap().push((dest.clone(), update));
            Ok(response)
        }

        fn replay_complete(&self, _report: ReplayComplete) -> Result<()> {
            Ok(())
        }
    }

    fn plan() -> ReceiverPlan {
        let mut plan = ReceiverPlan::default();
        plan.insert(Location::from("d1"), qrs("a", "m"), RangeState::SteadyState);
        plan.insert(Location::from("d2"), qrs("m", "z"), RangeState::SteadyState);
        plan
    }

    fn config() -> FailoverConfig {
        FailoverConfig {
            flush_limit_aggregate: 1024 * 1024,
            flush_limit_per_range: 1024 * 1024,
            ..FailoverConfig::default()
        }
    }

    #[test]
    fn cells_route_to_their_planned_receiver() {
        let sender = RecordingSender::default();
        let config = config();
        let mut buffer =
            ReplayBuffer::new(&sender, Location::from("rs1"), plan(), &config);
        buffer.begin_fragment(42);

        let table = TableId::new("7", 1);
        buffer.add(&table, &CellKey::new(&b"b"[..], 1), b"v1").unwrap();
        buffer.add(&table, &CellKey::new(&b"q"[..], 2), b"v2").unwrap();
        // outside any planned range: silently dropped
        buffer.add(&table, &CellKey::new(&b"zz"[..], 3), b"v3").unwrap();
        buffer.finish_fragment().unwrap();

        let updates = sender.updates.lock().unwrap();
        // one final update per surviving range
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|(_, update)| !update.more));
        let to_d1 = updates
            .iter()
            .find(|(dest, _)| dest == &Location::from("d1"))
            .unwrap();
        assert!(!to_d1.1.payload.is_empty());
    }

    #[test]
    fn per_range_threshold_triggers_flush() {
        let sender = RecordingSender::default();
        let config = FailoverConfig {
            flush_limit_per_range: 16,
            ..config()
        };
        let mut buffer =
            ReplayBuffer::new(&sender, Location::from("rs1"), plan(), &config);
        buffer.begin_fragment(1);

        let table = TableId::new("7", 1);
        buffer
            .add(&table, &CellKey::new(&b"b"[..], 1), &[0u8; 32])
            .unwrap();
        // the oversized staged batch flushed with more=true
        let updates = sender.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].1.more);
        drop(updates);
        assert_eq!(buffer.memory_used(), 0);
    }

    #[test]
    fn fragment_complete_reply_suppresses_further_sends() {
        let sender = RecordingSender::default();
        sender.complete_reply.lock().unwrap().insert(qrs("a", "m"));
        let config = FailoverConfig {
            flush_limit_per_range: 8,
            ..config()
        };
        let mut buffer =
            ReplayBuffer::new(&sender, Location::from("rs1"), plan(), &config);
        buffer.begin_fragment(1);

        let table = TableId::new("7", 1);
        buffer
            .add(&table, &CellKey::new(&b"b"[..], 1), &[0u8; 16])
            .unwrap();
        // completed: later adds for the range are dropped locally
        buffer
            .add(&table, &CellKey::new(&b"c"[..], 2), &[0u8; 16])
            .unwrap();
        buffer.finish_fragment().unwrap();

        let updates = sender.updates.lock().unwrap();
        let to_completed: Vec<_> = updates
            .iter()
            .filter(|(_, update)| update.range == qrs("a", "m"))
            .collect();
        assert_eq!(to_completed.len(), 1);
    }

    #[test]
    fn completed_set_resets_between_fragments() {
        let sender = RecordingSender::default();
        sender.complete_reply.lock().unwrap().insert(qrs("a", "m"));
        let config = config();
        let mut buffer =
            ReplayBuffer::new(&sender, Location::from("rs1"), plan(), &config);

        buffer.begin_fragment(1);
        buffer.finish_fragment().unwrap();
        sender.complete_reply.lock().unwrap().clear();

        buffer.begin_fragment(2);
        let table = TableId::new("7", 1);
        buffer.add(&table, &CellKey::new(&b"b"[..], 1), b"v").unwrap();
        buffer.finish_fragment().unwrap();

        let updates = sender.updates.lock().unwrap();
        let fragment2: Vec<_> = updates
            .iter()
            .filter(|(_, update)| update.fragment == 2 && update.range == qrs("a", "m"))
            .collect();
        assert_eq!(fragment2.len(), 1);
        assert!(!fragment2[0].1.payload.is_empty());
    }
}

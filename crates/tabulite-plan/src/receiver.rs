//! Range → destination assignment.

use std::collections::BTreeSet;

use bytes::BytesMut;
use tabulite_types::{
    Location, QualifiedRangeSpec, QualifiedRangeStateSpec, RangeSpec, RangeState, TableId,
};
use tabulite_wire::message::{get_receiver_entries, put_receiver_entries, ReceiverEntry};
use tabulite_wire::Result;

/// Assignment of recovered ranges to destination servers.
///
/// The primary index is the range itself (ordered, for row lookups); the
/// per-location view is derived by scan. Inserting a range that is
/// already present replaces the prior entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverPlan {
    entries: std::collections::BTreeMap<QualifiedRangeSpec, (Location, RangeState)>,
}

impl ReceiverPlan {
    /// Assigns `spec` to `location`, replacing any prior assignment of the
    /// same range.
    pub fn insert(&mut self, location: Location, spec: QualifiedRangeSpec, state: RangeState) {
        self.entries.insert(spec, (location, state));
    }

    /// Removes a range from the plan. Idempotent.
    pub fn erase(&mut self, spec: &QualifiedRangeSpec) {
        self.entries.remove(spec);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Finds the destination owning `(table, row)`.
    ///
    /// Probes with the single-point interval `("", row)`: the candidate is
    /// the smallest range of the same table at or above the probe whose
    /// interval actually contains the row.
    pub fn get_location(&self, table: &TableId, row: &[u8]) -> Option<Location> {
        self.get_range(table, row)
            .map(|spec| self.entries[&spec].0.clone())
    }

    /// Finds the planned range owning `(table, row)`.
    pub fn get_range(&self, table: &TableId, row: &[u8]) -> Option<QualifiedRangeSpec> {
        let probe = QualifiedRangeSpec::new(table.clone(), RangeSpec::point(row.to_vec()));
        for spec in self.entries.range(probe..).map(|(spec, _)| spec) {
            if spec.table != *table {
                return None;
            }
            if spec.range.contains(row) {
                return Some(spec.clone());
            }
            if row <= spec.range.start_row.as_ref() {
                // gone past every interval that could hold the row
                return None;
            }
        }
        None
    }

    /// Distinct destinations in the plan.
    pub fn get_locations(&self) -> BTreeSet<Location> {
        self.entries
            .values()
            .map(|(location, _)| location.clone())
            .collect()
    }

    /// Every planned range, in range order.
    pub fn get_ranges(&self) -> Vec<QualifiedRangeSpec> {
        self.entries.keys().cloned().collect()
    }

    /// Ranges assigned to one destination, in range order.
    pub fn get_ranges_for(&self, location: &Location) -> Vec<QualifiedRangeSpec> {
        self.entries
            .iter()
            .filter(|(_, (entry_location, _))| entry_location == location)
            .map(|(spec, _)| spec.clone())
            .collect()
    }

    /// Ranges plus their states for one destination.
    pub fn get_state_specs_for(&self, location: &Location) -> Vec<QualifiedRangeStateSpec> {
        self.entries
            .iter()
            .filter(|(_, (entry_location, _))| entry_location == location)
            .map(|(spec, (_, state))| QualifiedRangeStateSpec::new(spec.clone(), *state))
            .collect()
    }

    /// All entries in encoding order: by location, then by range.
    pub fn entries(&self) -> Vec<ReceiverEntry> {
        let mut entries: Vec<ReceiverEntry> = self
            .entries
            .iter()
            .map(|(spec, (location, state))| ReceiverEntry {
                location: location.clone(),
                spec: spec.clone(),
                state: *state,
            })
            .collect();
        entries.sort_by(|a, b| {
            a.location
                .cmp(&b.location)
                .then_with(|| a.spec.cmp(&b.spec))
        });
        entries
    }

    pub fn from_entries(entries: Vec<ReceiverEntry>) -> Self {
        let mut plan = Self::default();
        for entry in entries {
            plan.insert(entry.location, entry.spec, entry.state);
        }
        plan
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put_receiver_entries(buf, &self.entries());
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        Ok(Self::from_entries(get_receiver_entries(input)?))
    }
}

//! Fragment → player assignment.

use std::collections::{BTreeMap, BTreeSet};

use bytes::BytesMut;
use tabulite_types::Location;
use tabulite_wire::serial::{get_i32, get_vi32, get_vstr_utf8, put_i32, put_vi32, put_vstr};
use tabulite_wire::{Result, WireError};

/// Assignment of log fragments to player servers.
///
/// Keyed uniquely by fragment id; inserting a fragment that is already
/// present replaces the prior assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayPlan {
    entries: BTreeMap<u32, Location>,
}

impl ReplayPlan {
    pub fn insert(&mut self, location: Location, fragment: u32) {
        self.entries.insert(fragment, location);
    }

    /// Removes a fragment from the plan. Idempotent.
    pub fn erase(&mut self, fragment: u32) {
        self.entries.remove(&fragment);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Who is playing `fragment`?
    pub fn get_location(&self, fragment: u32) -> Option<Location> {
        self.entries.get(&fragment).cloned()
    }

    /// Distinct players in the plan.
    pub fn get_locations(&self) -> BTreeSet<Location> {
        self.entries.values().cloned().collect()
    }

    /// Every assigned fragment, ascending.
    pub fn get_fragments(&self) -> Vec<u32> {
        self.entries.keys().copied().collect()
    }

    /// Fragments assigned to one player, ascending.
    pub fn get_fragments_for(&self, location: &Location) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|(_, entry_location)| *entry_location == location)
            .map(|(&fragment, _)| fragment)
            .collect()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut entries: Vec<(&Location, u32)> = self
            .entries
            .iter()
            .map(|(&fragment, location)| (location, fragment))
            .collect();
        entries.sort();
        put_i32(buf, entries.len() as i32);
        for (location, fragment) in entries {
            put_vstr(buf, location.as_str().as_bytes());
            put_vi32(buf, fragment as i32);
        }
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let count = get_i32(input)?;
        if count < 0 {
            return Err(WireError::InvalidValue {
                field: "replay entry count",
                value: i64::from(count),
            });
        }
        let mut plan = Self::default();
        for _ in 0..count {
            let location = Location::from(get_vstr_utf8(input)?);
            let fragment = get_vi32(input)? as u32;
            plan.insert(location, fragment);
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_lookup_and_enumeration() {
        let mut plan = ReplayPlan::default();
        plan.insert(Location::from("rs1"), 42);
        plan.insert(Location::from("rs2"), 7);
        plan.insert(Location::from("rs1"), 9);

        assert_eq!(plan.get_location(42), Some(Location::from("rs1")));
        assert_eq!(plan.get_location(99), None);
        assert_eq!(plan.get_fragments(), vec![7, 9, 42]);
        assert_eq!(plan.get_fragments_for(&Location::from("rs1")), vec![9, 42]);
    }

    #[test]
    fn reinsert_replaces_player() {
        let mut plan = ReplayPlan::default();
        plan.insert(Location::from("rs1"), 42);
        plan.insert(Location::from("rs2"), 42);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.get_location(42), Some(Location::from("rs2")));
    }

    #[test]
    fn encoding_round_trips() {
        let mut plan = ReplayPlan::default();
        plan.insert(Location::from("rs2"), 3);
        plan.insert(Location::from("rs1"), 11);
        let mut buf = BytesMut::new();
        plan.encode(&mut buf);
        assert_eq!(ReplayPlan::decode(&mut &buf[..]).unwrap(), plan);
    }
}

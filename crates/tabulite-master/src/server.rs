//! Range-server registry.
//!
//! The master tracks every range server it has ever admitted in a
//! [`ServerList`]: a slab of connection entries indexed five ways: in
//! admission order (for round-robin assignment), uniquely by location id,
//! uniquely by public address, and non-uniquely by hostname and local
//! address. The slab owns the entries; everything else holds slot
//! indexes, so re-registration and erasure never invalidate a lookup
//! structure behind its back.

use std::collections::HashMap;
use std::net::SocketAddr;

use tabulite_types::Location;
use tracing::info;

/// One admitted range server and its connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeServerConnection {
    pub location: Location,
    pub hostname: String,
    pub local_addr: SocketAddr,
    pub public_addr: SocketAddr,
    connected: bool,
    removed: bool,
    balanced: bool,
}

impl RangeServerConnection {
    pub fn new(
        location: Location,
        hostname: impl Into<String>,
        local_addr: SocketAddr,
        public_addr: SocketAddr,
    ) -> Self {
        Self {
            location,
            hostname: hostname.into(),
            local_addr,
            public_addr,
            connected: false,
            removed: false,
            balanced: false,
        }
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    /// A server is removed while a recovery operation owns its state.
    pub fn removed(&self) -> bool {
        self.removed
    }

    pub fn balanced(&self) -> bool {
        self.balanced
    }
}

/// The five-way-indexed server registry. All synchronization lives in the
/// owning [`Context`](crate::Context); this container is the data.
#[derive(Debug, Default)]
pub struct ServerList {
    slots: Vec<Option<RangeServerConnection>>,
    by_location: HashMap<Location, usize>,
    by_public: HashMap<SocketAddr, usize>,
    by_hostname: HashMap<String, Vec<usize>>,
    by_local: HashMap<SocketAddr, Vec<usize>>,
    cursor: usize,
    connected_count: usize,
}

impl ServerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a new server.
    ///
    /// # Panics
    ///
    /// A duplicate location id means the caller failed to deduplicate
    /// registrations; that is an invariant violation, not an error to
    /// handle.
    pub fn add_server(&mut self, conn: RangeServerConnection) {
        assert!(
            !self.by_location.contains_key(&conn.location),
            "duplicate range server location {}",
            conn.location
        );
        self.insert(conn);
    }

    fn insert(&mut self, conn: RangeServerConnection) -> usize {
        assert!(
            !self.by_public.contains_key(&conn.public_addr),
            "public address {} already registered",
            conn.public_addr
        );
        let slot = self.slots.len();
        self.by_location.insert(conn.location.clone(), slot);
        self.by_public.insert(conn.public_addr, slot);
        self.by_hostname
            .entry(conn.hostname.clone())
            .or_default()
            .push(slot);
        self.by_local.entry(conn.local_addr).or_default().push(slot);
        self.slots.push(Some(conn));
        slot
    }

    fn unlink(&mut self, slot: usize) -> Option<RangeServerConnection> {
        let conn = self.slots[slot].take()?;
        self.by_location.remove(&conn.location);
        self.by_public.remove(&conn.public_addr);
        if let Some(slots) = self.by_hostname.get_mut(&conn.hostname) {
            slots.retain(|&s| s != slot);
        }
        if let Some(slots) = self.by_local.get_mut(&conn.local_addr) {
            slots.retain(|&s| s != slot);
        }
        Some(conn)
    }

    /// Marks a server connected, re-registering its addresses.
    ///
    /// Idempotent: reconnecting an existing location replaces its entry
    /// (the server may have moved hosts). Returns true iff this call
    /// transitioned the server from disconnected to connected, and
    /// whether the global connected count rose from zero.
    pub fn connect_server(
        &mut self,
        location: &Location,
        hostname: &str,
        local_addr: SocketAddr,
        public_addr: SocketAddr,
    ) -> (bool, bool) {
        let prior = self
            .by_location
            .get(location)
            .copied()
            .and_then(|slot| self.unlink(slot));

        let was_connected = prior.as_ref().is_some_and(RangeServerConnection::connected);
        let mut conn = prior.unwrap_or_else(|| {
            RangeServerConnection::new(location.clone(), hostname, local_addr, public_addr)
        });
        conn.hostname = hostname.to_string();
        conn.local_addr = local_addr;
        conn.public_addr = public_addr;
        conn.connected = true;
        info!(%location, hostname, "range server connected");
        self.insert(conn);

        let transitioned = !was_connected;
        if transitioned {
            self.connected_count += 1;
        }
        (transitioned, transitioned && self.connected_count == 1)
    }

    /// Marks a server disconnected. The connected count only moves if
    /// the server was connected.
    pub fn disconnect_server(&mut self, location: &Location) -> bool {
        let Some(&slot) = self.by_location.get(location) else {
            return false;
        };
        let conn = self.slots[slot].as_mut().expect("indexed slot is live");
        if !conn.connected {
            return false;
        }
        conn.connected = false;
        debug_assert!(self.connected_count > 0);
        self.connected_count -= 1;
        info!(%location, "range server disconnected");
        true
    }

    /// Drops a server from the registry entirely.
    pub fn erase_server(&mut self, location: &Location) {
        if let Some(&slot) = self.by_location.get(location) {
            if let Some(conn) = self.unlink(slot) {
                if conn.connected {
                    self.connected_count -= 1;
                }
            }
            self.cursor = 0;
        }
    }

    pub fn connected_count(&self) -> usize {
        self.connected_count
    }

    pub fn find_by_location(&self, location: &Location) -> Option<&RangeServerConnection> {
        self.by_location
            .get(location)
            .and_then(|&slot| self.slots[slot].as_ref())
    }

    fn entry_mut(&mut self, location: &Location) -> Option<&mut RangeServerConnection> {
        let slot = *self.by_location.get(location)?;
        self.slots[slot].as_mut()
    }

    /// Hostname lookup; `None` on miss or on an ambiguous hostname.
    pub fn find_by_hostname(&self, hostname: &str) -> Option<&RangeServerConnection> {
        match self.by_hostname.get(hostname).map(Vec::as_slice) {
            Some([slot]) => self.slots[*slot].as_ref(),
            _ => None,
        }
    }

    pub fn find_by_public_addr(&self, addr: SocketAddr) -> Option<&RangeServerConnection> {
        self.by_public
            .get(&addr)
            .and_then(|&slot| self.slots[slot].as_ref())
    }

    /// Local-address lookup; among servers sharing the address, the first
    /// connected one wins.
    pub fn find_by_local_addr(&self, addr: SocketAddr) -> Option<&RangeServerConnection> {
        self.by_local.get(&addr).and_then(|slots| {
            slots
                .iter()
                .filter_map(|&slot| self.slots[slot].as_ref())
                .find(|conn| conn.connected)
        })
    }

    /// Round-robin over the admission sequence, returning the next
    /// connected server.
    ///
    /// Never yields the same server twice in succession unless it is the
    /// only connected one; yields `None` only when nothing is connected.
    pub fn next_available_server(&mut self) -> Option<Location> {
        if self.slots.is_empty() {
            return None;
        }
        for _ in 0..self.slots.len() {
            self.cursor = (self.cursor + 1) % self.slots.len();
            if let Some(conn) = &self.slots[self.cursor] {
                if conn.connected {
                    return Some(conn.location.clone());
                }
            }
        }
        None
    }

    pub fn set_removed(&mut self, location: &Location, removed: bool) {
        if let Some(conn) = self.entry_mut(location) {
            conn.removed = removed;
        }
    }

    pub fn set_balanced(&mut self, location: &Location) {
        if let Some(conn) = self.entry_mut(location) {
            conn.balanced = true;
        }
    }

    fn live_entries(&self) -> impl Iterator<Item = &RangeServerConnection> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// Every admitted, non-removed server.
    pub fn get_servers(&self) -> Vec<RangeServerConnection> {
        self.live_entries()
            .filter(|conn| !conn.removed)
            .cloned()
            .collect()
    }

    /// Locations of every connected, non-removed server.
    pub fn get_connected_locations(&self) -> std::collections::BTreeSet<Location> {
        self.live_entries()
            .filter(|conn| !conn.removed && conn.connected)
            .map(|conn| conn.location.clone())
            .collect()
    }

    /// Filters the named servers down to those neither removed nor
    /// balanced; the balancer's work queue after a recovery finishes.
    pub fn get_unbalanced_servers(&self, locations: &[Location]) -> Vec<RangeServerConnection> {
        locations
            .iter()
            .filter_map(|location| self.find_by_location(location))
            .filter(|conn| !conn.removed && !conn.balanced)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn server(name: &str, port: u16) -> RangeServerConnection {
        RangeServerConnection::new(Location::from(name), format!("host-{name}"), addr(port), addr(port + 1000))
    }

    fn connect(list: &mut ServerList, name: &str, port: u16) -> (bool, bool) {
        list.connect_server(
            &Location::from(name),
            &format!("host-{name}"),
            addr(port),
            addr(port + 1000),
        )
    }

    #[test]
    #[should_panic(expected = "duplicate range server location")]
    fn duplicate_location_is_fatal() {
        let mut list = ServerList::new();
        list.add_server(server("rs1", 1));
        list.add_server(server("rs1", 2));
    }

    #[test]
    fn connect_counts_and_first_connection_signal() {
        let mut list = ServerList::new();
        list.add_server(server("rs1", 1));
        list.add_server(server("rs2", 2));

        assert_eq!(connect(&mut list, "rs1", 1), (true, true));
        assert_eq!(connect(&mut list, "rs1", 1), (false, false));
        assert_eq!(connect(&mut list, "rs2", 2), (true, false));
        assert_eq!(list.connected_count(), 2);
    }

    #[test]
    fn disconnect_only_moves_count_when_connected() {
        let mut list = ServerList::new();
        list.add_server(server("rs1", 1));
        assert!(!list.disconnect_server(&Location::from("rs1")));
        connect(&mut list, "rs1", 1);
        assert!(list.disconnect_server(&Location::from("rs1")));
        assert!(!list.disconnect_server(&Location::from("rs1")));
        assert_eq!(list.connected_count(), 0);
    }

    #[test]
    fn reconnect_after_move_replaces_entry() {
        let mut list = ServerList::new();
        list.add_server(server("rs1", 1));
        connect(&mut list, "rs1", 1);
        // server restarts on a different address
        list.disconnect_server(&Location::from("rs1"));
        list.connect_server(&Location::from("rs1"), "host-rs1b", addr(50), addr(1050));

        assert!(list.find_by_public_addr(addr(1001)).is_none());
        let conn = list.find_by_public_addr(addr(1050)).unwrap();
        assert_eq!(conn.location, Location::from("rs1"));
        assert_eq!(list.connected_count(), 1);
    }

    #[test]
    fn lookups_miss_cleanly() {
        let list = ServerList::new();
        assert!(list.find_by_location(&Location::from("rs9")).is_none());
        assert!(list.find_by_hostname("nowhere").is_none());
        assert!(list.find_by_public_addr(addr(9)).is_none());
        assert!(list.find_by_local_addr(addr(9)).is_none());
    }

    #[test]
    fn round_robin_skips_disconnected_and_rotates() {
        let mut list = ServerList::new();
        for (name, port) in [("rs1", 1), ("rs2", 2), ("rs3", 3)] {
            list.add_server(server(name, port));
        }
        assert!(list.next_available_server().is_none());

        connect(&mut list, "rs1", 1);
        connect(&mut list, "rs3", 3);

        let first = list.next_available_server().unwrap();
        let second = list.next_available_server().unwrap();
        assert_ne!(first, second);
        let third = list.next_available_server().unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn sole_connected_server_repeats() {
        let mut list = ServerList::new();
        list.add_server(server("rs1", 1));
        connect(&mut list, "rs1", 1);
        assert_eq!(list.next_available_server(), Some(Location::from("rs1")));
        assert_eq!(list.next_available_server(), Some(Location::from("rs1")));
    }

    #[test]
    fn unbalanced_filter() {
        let mut list = ServerList::new();
        list.add_server(server("rs1", 1));
        list.add_server(server("rs2", 2));
        list.set_balanced(&Location::from("rs1"));
        list.set_removed(&Location::from("rs2"), true);

        let names = [Location::from("rs1"), Location::from("rs2")];
        assert!(list.get_unbalanced_servers(&names).is_empty());

        list.set_removed(&Location::from("rs2"), false);
        let unbalanced = list.get_unbalanced_servers(&names);
        assert_eq!(unbalanced.len(), 1);
        assert_eq!(unbalanced[0].location, Location::from("rs2"));
    }

    #[test]
    fn at_most_one_entry_per_location_and_public_addr() {
        let mut list = ServerList::new();
        list.add_server(server("rs1", 1));
        connect(&mut list, "rs1", 1);
        connect(&mut list, "rs1", 1);
        list.disconnect_server(&Location::from("rs1"));
        connect(&mut list, "rs1", 1);

        assert_eq!(list.get_servers().len(), 1);
        assert_eq!(list.by_location.len(), 1);
        assert_eq!(list.by_public.len(), 1);
    }

    #[test]
    fn add_disconnect_connect_equals_single_connect() {
        let mut longhand = ServerList::new();
        longhand.add_server(server("rs1", 1));
        longhand.disconnect_server(&Location::from("rs1"));
        connect(&mut longhand, "rs1", 1);

        let mut shorthand = ServerList::new();
        connect(&mut shorthand, "rs1", 1);

        for list in [&longhand, &shorthand] {
            let conn = list.find_by_location(&Location::from("rs1")).unwrap();
            assert!(conn.connected());
            assert_eq!(list.connected_count(), 1);
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        proptest! {
            /// One entry per location id and per public address, for any
            /// history of add/connect/disconnect/erase interleavings.
            #[test]
            fn registry_stays_uniquely_indexed(
                ops in proptest::collection::vec((0u8..4, 0u16..3), 0..48)
            ) {
                let mut list = ServerList::new();
                for (op, i) in ops {
                    let name = format!("rs{i}");
                    let location = Location::from(name.as_str());
                    match op {
                        0 => {
                            if list.find_by_location(&location).is_none() {
                                list.add_server(server(&name, i + 1));
                            }
                        }
                        1 => {
                            connect(&mut list, &name, i + 1);
                        }
                        2 => {
                            list.disconnect_server(&location);
                        }
                        _ => {
                            list.erase_server(&location);
                        }
                    }
                }

                let live = list.get_servers();
                let locations: BTreeSet<_> =
                    live.iter().map(|conn| conn.location.clone()).collect();
                let publics: BTreeSet<_> =
                    live.iter().map(|conn| conn.public_addr).collect();
                prop_assert_eq!(locations.len(), live.len());
                prop_assert_eq!(publics.len(), live.len());
                prop_assert_eq!(
                    list.get_connected_locations().len(),
                    list.connected_count()
                );
            }
        }
    }
}

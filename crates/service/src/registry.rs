use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use ahash::AHashMap;

use crate::{PeerId, SERVER_ID};

/// One registered peer.
///
/// `last_send` tracks outbound traffic toward the peer (data or
/// keep-alive), not inbound. Records are never destroyed; unregistration is
/// out of scope and a re-registration simply overwrites the address.
#[derive(Debug, Clone, Copy)]
pub struct PeerRecord {
    pub address: SocketAddr,
    pub last_send: Instant,
    pub is_server: bool,
}

/// The relay's registry: `id -> record` plus a parallel `address -> id`
/// reverse map, so that rewriting client traffic toward the server does not
/// scan the whole table. The reverse map is invalidated whenever a
/// re-registration moves an id to a new address.
///
/// Direct-mode peers are kept separately, keyed by their UDP source port
/// (which doubles as their pseudo id on the wire).
pub struct Registry {
    peers: AHashMap<PeerId, PeerRecord>,
    addresses: AHashMap<SocketAddr, PeerId>,
    direct_ports: AHashMap<u16, SocketAddr>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            peers: AHashMap::with_capacity(64),
            addresses: AHashMap::with_capacity(64),
            direct_ports: AHashMap::new(),
        }
    }

    /// Bind `id` to `address`, overwriting any previous binding. Returns
    /// whether the id was already registered.
    pub fn insert(&mut self, id: PeerId, address: SocketAddr, now: Instant) -> bool {
        // An address identifies at most one record, so an id switching
        // address must drop the stale reverse entry, and a new id claiming
        // an already-bound address evicts the previous owner.
        if let Some(previous) = self.addresses.insert(address, id) {
            if previous != id {
                self.peers.remove(&previous);
            }
        }

        let record = PeerRecord {
            address,
            last_send: now,
            is_server: id == SERVER_ID,
        };

        match self.peers.insert(id, record) {
            Some(old) => {
                if old.address != address {
                    self.addresses.remove(&old.address);
                }

                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerRecord> {
        self.peers.get(&id)
    }

    pub fn server(&self) -> Option<&PeerRecord> {
        self.peers.get(&SERVER_ID)
    }

    pub fn id_of(&self, address: &SocketAddr) -> Option<PeerId> {
        self.addresses.get(address).copied()
    }

    /// Refresh the outbound timestamp after sending toward `id`.
    pub fn touch(&mut self, id: PeerId, now: Instant) {
        if let Some(record) = self.peers.get_mut(&id) {
            record.last_send = now;
        }
    }

    /// Records whose last outbound traffic is at least `interval` old.
    /// Refreshes their timestamps, the caller is committing to send.
    pub fn stale(&mut self, now: Instant, interval: Duration) -> Vec<(PeerId, SocketAddr)> {
        let mut stale = Vec::new();

        for (id, record) in self.peers.iter_mut() {
            if now.duration_since(record.last_send) >= interval {
                record.last_send = now;
                stale.push((*id, record.address));
            }
        }

        stale
    }

    /// Track a direct-mode sender by source port. Returns whether the port
    /// was unknown until now.
    pub fn insert_direct(&mut self, port: u16, address: SocketAddr) -> bool {
        self.direct_ports.insert(port, address).is_none()
    }

    pub fn direct_address(&self, port: u16) -> Option<SocketAddr> {
        self.direct_ports.get(&port).copied()
    }

    pub fn bindings(&self) -> Vec<(PeerId, SocketAddr)> {
        self.peers
            .iter()
            .map(|(id, record)| (*id, record.address))
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn insert_tracks_reverse_map() {
        let mut registry = Registry::new();
        let now = Instant::now();

        assert!(!registry.insert(SERVER_ID, addr(1000), now));
        assert!(!registry.insert(42, addr(2000), now));

        assert_eq!(registry.id_of(&addr(2000)), Some(42));
        assert!(registry.server().unwrap().is_server);
        assert!(!registry.get(42).unwrap().is_server);
    }

    #[test]
    fn reregistration_moves_address() {
        let mut registry = Registry::new();
        let now = Instant::now();

        registry.insert(42, addr(2000), now);
        assert!(registry.insert(42, addr(2001), now));

        assert_eq!(registry.id_of(&addr(2000)), None);
        assert_eq!(registry.id_of(&addr(2001)), Some(42));
        assert_eq!(registry.get(42).unwrap().address, addr(2001));
    }

    #[test]
    fn address_claim_evicts_previous_owner() {
        let mut registry = Registry::new();
        let now = Instant::now();

        registry.insert(42, addr(2000), now);
        registry.insert(43, addr(2000), now);

        assert!(registry.get(42).is_none());
        assert_eq!(registry.id_of(&addr(2000)), Some(43));
    }

    #[test]
    fn stale_refreshes_timestamps() {
        let mut registry = Registry::new();
        let now = Instant::now();
        let interval = Duration::from_secs(1);

        registry.insert(42, addr(2000), now);
        assert!(registry.stale(now, interval).is_empty());

        let later = now + Duration::from_millis(1100);
        assert_eq!(registry.stale(later, interval), vec![(42, addr(2000))]);
        assert!(registry.stale(later, interval).is_empty());
    }
}

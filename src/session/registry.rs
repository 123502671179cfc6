//! Peer registry
//!
//! Server-side map of connected peers keyed by their host-assigned id.
//! The host owns the peer slots; the registry only records what the
//! application needs to look a peer up between polls.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::network::PeerId;

/// A peer known to the server session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredPeer {
    pub id: PeerId,
    pub address: Option<SocketAddr>,
    pub connected_at: Instant,
}

/// `PeerId -> RegisteredPeer` for the life of a server session
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, RegisteredPeer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly connected peer, replacing any stale entry for the id
    pub fn insert(&mut self, id: PeerId, address: Option<SocketAddr>) {
        let previous = self.peers.insert(id, RegisteredPeer {
            id,
            address,
            connected_at: Instant::now(),
        });
        if previous.is_some() {
            tracing::warn!("Peer {} registered twice, replacing stale entry", id);
        }
    }

    pub fn remove(&mut self, id: PeerId) -> Option<RegisteredPeer> {
        self.peers.remove(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<&RegisteredPeer> {
        self.peers.get(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Registered ids in ascending order
    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_insert_and_remove() {
        let mut registry = PeerRegistry::new();
        let addr = "127.0.0.1:5000".parse().ok();

        registry.insert(3, addr);
        registry.insert(1, None);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(3));
        assert_eq!(registry.get(3).and_then(|p| p.address), addr);
        assert_eq!(registry.ids(), vec![1, 3]);

        assert_eq!(registry.remove(3).map(|p| p.id), Some(3));
        assert!(registry.remove(3).is_none());
        assert_eq!(registry.ids(), vec![1]);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reinsert_replaces_entry() {
        let mut registry = PeerRegistry::new();
        registry.insert(0, None);
        registry.insert(0, "127.0.0.1:5001".parse().ok());

        assert_eq!(registry.len(), 1);
        assert!(registry.get(0).and_then(|p| p.address).is_some());
    }

    proptest! {
        #[test]
        fn test_ids_stay_unique(ops in proptest::collection::vec((any::<bool>(), 0u32..8), 0..64)) {
            let mut registry = PeerRegistry::new();
            let mut model = std::collections::BTreeSet::new();

            for (connect, id) in ops {
                if connect {
                    registry.insert(id, None);
                    model.insert(id);
                } else {
                    registry.remove(id);
                    model.remove(&id);
                }
            }

            let ids = registry.ids();
            prop_assert_eq!(ids.len(), registry.len());
            prop_assert_eq!(ids, model.into_iter().collect::<Vec<_>>());
        }
    }
}

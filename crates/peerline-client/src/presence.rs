//! Presence: the other peers currently connected to the relay.

use peerline_common::{PeerId, PeerInfo};

/// Renders presence and raises "call requested" as `UserIntent::Call`.
pub trait PresenceView: Send {
    fn render(&mut self, peers: &[PeerInfo]);
    fn peer_added(&mut self, peer: &PeerInfo);
    fn peer_removed(&mut self, id: &PeerId);
}

/// Ordered, de-duplicated peer list that never contains this client.
#[derive(Debug, Clone, Default)]
pub struct PresenceSet {
    self_id: Option<PeerId>,
    peers: Vec<PeerInfo>,
}

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records our own id. Returns `true` if that removed an entry.
    pub fn set_self(&mut self, id: PeerId) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.id != id);
        self.self_id = Some(id);
        self.peers.len() != before
    }

    /// Replace everything with a relay snapshot, keeping its order.
    pub fn replace(&mut self, snapshot: Vec<PeerInfo>) {
        self.peers.clear();
        for peer in snapshot {
            self.add(peer);
        }
    }

    /// Returns `false` for ourselves or an already listed peer.
    pub fn add(&mut self, peer: PeerInfo) -> bool {
        if self.self_id.as_ref() == Some(&peer.id) || self.contains(&peer.id) {
            return false;
        }
        self.peers.push(peer);
        true
    }

    pub fn remove(&mut self, id: &PeerId) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| &p.id != id);
        self.peers.len() != before
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| &p.id == id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.get(id).is_some()
    }

    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.iter()
    }

    /// Zero-based position, as shown in listings.
    pub fn nth(&self, index: usize) -> Option<&PeerInfo> {
        self.peers.get(index)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Forget everything, including our own id.
    pub fn clear(&mut self) {
        self.peers.clear();
        self.self_id = None;
    }
}

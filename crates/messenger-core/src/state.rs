//! Mutable messenger state owned by the controller task.
//!
//! Nothing here is shared: the controller holds the only [`CoreState`] and
//! the presentation layer sees clones handed out through commands.

use std::collections::HashMap;

use messenger_shared::types::{DiscoveredService, MachineId, Mode, Peer, PeerRole};

#[derive(Debug)]
pub struct CoreState {
    identity: MachineId,
    mode: Mode,
    /// Bumped on every mode switch.
    generation: u64,
    peers: HashMap<String, Peer>,
    discovered: HashMap<MachineId, DiscoveredService>,
    username: Option<String>,
}

impl CoreState {
    pub fn new(identity: MachineId) -> Self {
        Self {
            identity,
            mode: Mode::default(),
            generation: 0,
            peers: HashMap::new(),
            discovered: HashMap::new(),
            username: None,
        }
    }

    pub fn identity(&self) -> &MachineId {
        &self.identity
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Enter `mode`, dropping every peer, discovered service and the join.
    pub fn begin_mode(&mut self, mode: Mode) -> u64 {
        self.mode = mode;
        self.generation += 1;
        self.clear();
        self.generation
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.discovered.clear();
        self.username = None;
    }

    // -- Peers --

    /// Returns `false` if a peer with the same key was already present; the
    /// entry is refreshed either way.
    pub fn add_peer(&mut self, peer: Peer) -> bool {
        self.peers.insert(peer.key(), peer).is_none()
    }

    pub fn remove_peer(&mut self, key: &str) -> Option<Peer> {
        self.peers.remove(key)
    }

    /// Remove a peer learned through a client session, by identity.
    pub fn remove_remote_peer(&mut self, machine_id: &MachineId, role: PeerRole) -> Option<Peer> {
        match self.peers.get(machine_id.as_str()) {
            Some(peer) if peer.role == role => self.peers.remove(machine_id.as_str()),
            _ => None,
        }
    }

    pub fn drain_peers(&mut self, role: PeerRole) -> Vec<Peer> {
        let keys: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.role == role)
            .map(|(k, _)| k.clone())
            .collect();
        keys.iter().filter_map(|k| self.peers.remove(k)).collect()
    }

    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        peers.sort_by_key(|p| p.connected_at);
        peers
    }

    pub fn peer_count(&self, role: PeerRole) -> usize {
        self.peers.values().filter(|p| p.role == role).count()
    }

    // -- Discovery --

    /// Record a discovered service. Our own identity is never recorded.
    pub fn add_discovered(&mut self, service: DiscoveredService) -> bool {
        if service.id == self.identity {
            return false;
        }
        self.discovered.insert(service.id.clone(), service);
        true
    }

    pub fn remove_discovered(&mut self, id: &MachineId) -> Option<DiscoveredService> {
        self.discovered.remove(id)
    }

    pub fn set_connected(&mut self, host: &str, port: u16, connected: bool) {
        for service in self.discovered.values_mut() {
            if service.matches_endpoint(host, port) {
                service.connected = connected;
            }
        }
    }

    pub fn discovered(&self) -> Vec<DiscoveredService> {
        let mut services: Vec<DiscoveredService> = self.discovered.values().cloned().collect();
        services.sort_by_key(|s| s.discovered_at);
        services
    }

    pub fn discovered_count(&self) -> usize {
        self.discovered.len()
    }

    // -- Room --

    pub fn join(&mut self, username: String) {
        self.username = Some(username);
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn is_joined(&self) -> bool {
        self.username.is_some()
    }
}

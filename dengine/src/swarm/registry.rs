use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// Where an endpoint was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Pex,
    Dht,
    Manual,
    Incoming,
}

/// Connection state of a known endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Connecting,
    Connected,
    Banned,
}

/// A known peer endpoint with its connection history.
#[derive(Debug, Clone)]
pub struct SwarmPeer {
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub state: PeerState,
    pub last_connect_attempt: Option<Instant>,
    pub last_connect_success: Option<Instant>,
    pub consecutive_failures: u32,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
}

impl SwarmPeer {
    fn new(addr: SocketAddr, source: PeerSource) -> SwarmPeer {
        SwarmPeer {
            addr,
            source,
            state: PeerState::Idle,
            last_connect_attempt: None,
            last_connect_success: None,
            consecutive_failures: 0,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
        }
    }
}

/// Failures after which an endpoint is demoted to banned.
const BAN_AFTER_FAILURES: u32 = 8;

/// The deduplicated set of endpoints known for one torrent.
///
/// Keyed by `(ip, port)`; the address family is part of the `IpAddr`.
#[derive(Debug, Default)]
pub struct Swarm {
    peers: HashMap<SocketAddr, SwarmPeer>,
}

impl Swarm {
    pub fn new() -> Swarm {
        Swarm::default()
    }

    /// Returns the existing entry or registers a new idle one.
    ///
    /// A later sighting never downgrades the source of an existing entry;
    /// it only revives the entry's presence.
    pub fn add_peer(&mut self, addr: SocketAddr, source: PeerSource) -> &SwarmPeer {
        self.peers
            .entry(addr)
            .or_insert_with(|| SwarmPeer::new(addr, source))
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&SwarmPeer> {
        self.peers.get(addr)
    }

    /// Marks an outbound attempt.
    pub fn mark_connecting(&mut self, addr: &SocketAddr, now: Instant) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.state = PeerState::Connecting;
            peer.last_connect_attempt = Some(now);
        }
    }

    /// Marks a successful handshake.
    pub fn mark_connected(&mut self, addr: &SocketAddr, now: Instant) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.state = PeerState::Connected;
            peer.last_connect_success = Some(now);
            peer.consecutive_failures = 0;
        }
    }

    /// Marks a clean close; the endpoint goes back to idle.
    pub fn mark_disconnected(&mut self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.get_mut(addr) {
            if peer.state != PeerState::Banned {
                peer.state = PeerState::Idle;
            }
        }
    }

    /// Marks a failed attempt or dropped connection; repeated failure bans.
    pub fn mark_failed(&mut self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.get_mut(addr) {
            if peer.state == PeerState::Banned {
                return;
            }
            peer.consecutive_failures += 1;
            peer.state = if peer.consecutive_failures >= BAN_AFTER_FAILURES {
                PeerState::Banned
            } else {
                PeerState::Idle
            };
        }
    }

    /// Bans an endpoint outright (self-connection, corruption verdict).
    pub fn ban(&mut self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.state = PeerState::Banned;
        }
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        matches!(self.peers.get(addr).map(|p| p.state), Some(PeerState::Banned))
    }

    pub fn record_downloaded(&mut self, addr: &SocketAddr, bytes: u64) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.bytes_downloaded += bytes;
        }
    }

    pub fn record_uploaded(&mut self, addr: &SocketAddr, bytes: u64) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.bytes_uploaded += bytes;
        }
    }

    pub fn connected_count(&self) -> usize {
        self.count_state(PeerState::Connected)
    }

    pub fn connecting_count(&self) -> usize {
        self.count_state(PeerState::Connecting)
    }

    pub fn known_count(&self) -> usize {
        self.peers.len()
    }

    fn count_state(&self, state: PeerState) -> usize {
        self.peers.values().filter(|p| p.state == state).count()
    }

    /// Idle, non-banned endpoints available for an outbound attempt.
    pub fn idle_candidates(&self) -> Vec<&SwarmPeer> {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Idle)
            .collect()
    }

    pub fn connected_addrs(&self) -> Vec<SocketAddr> {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .map(|p| p.addr)
            .collect()
    }
}

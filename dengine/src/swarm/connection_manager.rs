use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;

use super::registry::{PeerSource, Swarm, SwarmPeer};

/// Window after an attempt during which a candidate is penalized.
const COOLDOWN: Duration = Duration::from_secs(60);
/// Failure penalty stops growing past this many failures.
const FAILURE_PENALTY_CAP: u32 = 3;
/// A choked peer silent for this long is flagged.
const CHOKED_STALL: Duration = Duration::from_secs(120);
/// Minimum smoothed download rate for an unchoked, interested peer.
const MIN_UNCHOKED_RATE: f64 = 1024.0;
/// Grace period before rate-based flagging applies.
const RATE_GRACE: Duration = Duration::from_secs(30);

/// Candidate scoring, admission batching, maintenance cadence and slow-peer
/// detection for one torrent's swarm.
pub struct ConnectionManager {
    maintenance_min: Duration,
    maintenance_base: Duration,
    maintenance_max: Duration,
}

impl ConnectionManager {
    pub fn new(
        maintenance_min: Duration,
        maintenance_base: Duration,
        maintenance_max: Duration,
    ) -> ConnectionManager {
        ConnectionManager {
            maintenance_min,
            maintenance_base,
            maintenance_max,
        }
    }

    /// Scores a candidate endpoint; higher is better.
    pub fn score(&self, peer: &SwarmPeer, now: Instant) -> i64 {
        let mut score: i64 = 0;

        if peer.last_connect_success.is_some() {
            score += 50;
        }

        score += match peer.source {
            PeerSource::Manual => 20,
            PeerSource::Tracker => 10,
            PeerSource::Pex | PeerSource::Dht | PeerSource::Incoming => 0,
        };

        score -= 20 * peer.consecutive_failures.min(FAILURE_PENALTY_CAP) as i64;

        if let Some(attempt) = peer.last_connect_attempt {
            if now.duration_since(attempt) < COOLDOWN {
                score -= 30;
            }
        }

        score += ((1.0 + peer.bytes_downloaded as f64).ln() * 2.0) as i64;

        // jitter breaks ties so the whole swarm does not dial the same peer
        score += rand::thread_rng().gen_range(0..=10);

        score
    }

    /// Picks up to `slots` of the best idle candidates to dial.
    pub fn pick_candidates(&self, swarm: &Swarm, slots: usize, now: Instant) -> Vec<SocketAddr> {
        if slots == 0 {
            return Vec::new();
        }
        let mut scored: Vec<(i64, SocketAddr)> = swarm
            .idle_candidates()
            .into_iter()
            .map(|peer| (self.score(peer, now), peer.addr))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(slots).map(|(_, addr)| addr).collect()
    }

    /// Next maintenance delay given how full the peer set is: aggressive
    /// while starved, relaxed when saturated.
    pub fn maintenance_interval(&self, in_use: usize, capacity: usize) -> Duration {
        if capacity == 0 {
            return self.maintenance_max;
        }
        let utilization = in_use as f64 / capacity as f64;
        if utilization < 0.5 {
            self.maintenance_min
        } else if utilization <= 0.8 {
            self.maintenance_base
        } else {
            self.maintenance_max
        }
    }

    /// Flags a connected peer that is not worth its slot. Returns the reason
    /// the torrent passes along when closing.
    pub fn slow_peer_reason(&self, activity: &PeerActivity, now: Instant) -> Option<String> {
        if activity.peer_choking_us {
            let silent_for = now.duration_since(
                activity.last_received.unwrap_or(activity.connected_at),
            );
            if silent_for >= CHOKED_STALL {
                return Some(format!(
                    "choked and silent for {}s",
                    silent_for.as_secs()
                ));
            }
            return None;
        }
        if activity.am_interested
            && now.duration_since(activity.connected_at) >= RATE_GRACE
            && activity.smoothed_rate_bps < MIN_UNCHOKED_RATE
        {
            return Some(format!(
                "unchoked but rate {:.0} B/s below minimum",
                activity.smoothed_rate_bps
            ));
        }
        None
    }
}

/// Activity snapshot of one connected peer, fed to slow-peer detection.
#[derive(Debug, Clone)]
pub struct PeerActivity {
    pub peer_choking_us: bool,
    pub am_interested: bool,
    pub last_received: Option<Instant>,
    pub smoothed_rate_bps: f64,
    pub connected_at: Instant,
}

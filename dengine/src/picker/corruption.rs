use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A ban verdict for one contributor of a failed piece.
#[derive(Debug, Clone, PartialEq)]
pub struct BanDecision {
    pub peer: SocketAddr,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug)]
struct FailureRecord {
    contributors: Vec<SocketAddr>,
    at: Instant,
}

/// Tracks hash failures per contributing peer and decides bans.
///
/// A sole contributor of a failed piece is proof of guilt. Mixed pieces need
/// repeated failures, with the required count scaling up as the swarm gets
/// sparser so a small swarm is not decimated by one bad piece.
#[derive(Debug)]
pub struct CorruptionTracker {
    min_failures_for_ban: u32,
    max_failures_for_ban: u32,
    failure_window: Duration,
    failures: Vec<FailureRecord>,
}

impl CorruptionTracker {
    pub fn new(
        min_failures_for_ban: u32,
        max_failures_for_ban: u32,
        failure_window: Duration,
    ) -> CorruptionTracker {
        CorruptionTracker {
            min_failures_for_ban,
            max_failures_for_ban,
            failure_window,
            failures: Vec::new(),
        }
    }

    /// Default thresholds: 3 failures in a healthy swarm, up to 6 in a
    /// sparse one, hour-long memory.
    pub fn with_defaults() -> CorruptionTracker {
        CorruptionTracker::new(3, 6, Duration::from_secs(3600))
    }

    /// Records a hash failure and returns any resulting ban decisions.
    ///
    /// `swarm_health` is the connected-peer ratio in [0, 1]; 1 means a full
    /// peer set, 0 means nearly alone.
    pub fn record_failure(
        &mut self,
        contributors: Vec<SocketAddr>,
        swarm_health: f64,
        now: Instant,
    ) -> Vec<BanDecision> {
        self.prune(now);
        if contributors.is_empty() {
            return Vec::new();
        }

        if contributors.len() == 1 {
            let peer = contributors[0];
            self.failures.push(FailureRecord { contributors, at: now });
            return vec![BanDecision {
                peer,
                confidence: 1.0,
                reason: "sole contributor".to_string(),
            }];
        }

        self.failures.push(FailureRecord {
            contributors: contributors.clone(),
            at: now,
        });

        let threshold = self.effective_min_failures(swarm_health);
        let mut decisions = Vec::new();
        for peer in contributors {
            let involved: Vec<&FailureRecord> = self
                .failures
                .iter()
                .filter(|f| f.contributors.contains(&peer))
                .collect();
            let count = involved.len() as u32;
            if count < threshold {
                continue;
            }
            let mut partners: Vec<SocketAddr> = involved
                .iter()
                .flat_map(|f| f.contributors.iter().copied())
                .filter(|p| *p != peer)
                .collect();
            partners.sort_unstable_by_key(|p| (p.ip(), p.port()));
            partners.dedup();

            // repeated failures across different partner sets point at the
            // common element
            let diversity = (partners.len() as f64 / count as f64).min(1.0);
            let confidence = (count as f64 / (count as f64 + 1.0)) * (0.5 + 0.5 * diversity);
            decisions.push(BanDecision {
                peer,
                confidence,
                reason: format!(
                    "{} hash failures with {} distinct partners",
                    count,
                    partners.len()
                ),
            });
        }
        decisions
    }

    /// Required failure count given swarm health: `min` when healthy,
    /// `max` when sparse.
    pub fn effective_min_failures(&self, swarm_health: f64) -> u32 {
        let health = swarm_health.clamp(0.0, 1.0);
        let span = (self.max_failures_for_ban - self.min_failures_for_ban) as f64;
        self.min_failures_for_ban + ((1.0 - health) * span).round() as u32
    }

    fn prune(&mut self, now: Instant) {
        let window = self.failure_window;
        self.failures
            .retain(|f| now.duration_since(f.at) < window);
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }
}

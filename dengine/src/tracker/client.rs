use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::common::info_hash::InfoHash;

/// Announce lifecycle events (BEP-3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
    None,
}

/// One announce to one tracker URL.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub url: String,
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}

/// What a tracker answered.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub complete: u32,
    pub incomplete: u32,
    pub peers: Vec<SocketAddr>,
}

/// Possible tracker client errors.
#[derive(Debug)]
pub enum TrackerClientError {
    Unreachable(String),
    Rejected(String),
    MalformedResponse(String),
}

/// The tracker wire client the host plugs in (HTTP and UDP trackers are
/// external collaborators of the engine).
pub trait TrackerClient: Send + Sync {
    fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerClientError>;
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(30);
const MAX_BACKOFF: Duration = Duration::from_secs(1800);

/// Per-URL announce schedule with exponential backoff on failure.
#[derive(Debug)]
pub struct AnnounceSchedule {
    pub url: String,
    next_announce: Option<Instant>,
    failures: u32,
}

impl AnnounceSchedule {
    pub fn new(url: String) -> AnnounceSchedule {
        AnnounceSchedule {
            url,
            next_announce: None,
            failures: 0,
        }
    }

    /// Whether an announce to this URL is due.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.next_announce {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Tracker answered: honor its interval, reset the backoff.
    pub fn on_success(&mut self, interval: Duration, now: Instant) {
        self.failures = 0;
        self.next_announce = Some(now + interval);
    }

    /// Tracker failed: retry after an exponentially growing delay.
    pub fn on_failure(&mut self, now: Instant) {
        let backoff = INITIAL_BACKOFF
            .saturating_mul(1u32 << self.failures.min(6))
            .min(MAX_BACKOFF);
        self.failures += 1;
        self.next_announce = Some(now + backoff);
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

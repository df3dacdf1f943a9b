use std::net::IpAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use sha1::{Digest, Sha1};

/// Secrets rotate on this cadence; a token stays valid across one rotation,
/// which comfortably covers a get_peers/announce_peer cycle.
const ROTATION_INTERVAL: Duration = Duration::from_secs(300);

/// Issues and validates announce tokens (BEP-5).
///
/// A token is `SHA-1(ip || secret)`. Validation accepts the current and the
/// previous secret, so tokens expire after roughly ten minutes.
#[derive(Debug)]
pub struct TokenStore {
    current_secret: [u8; 16],
    previous_secret: Option<[u8; 16]>,
    rotated_at: Instant,
}

impl TokenStore {
    pub fn new(now: Instant) -> TokenStore {
        TokenStore {
            current_secret: rand::thread_rng().gen(),
            previous_secret: None,
            rotated_at: now,
        }
    }

    /// Rotates the secret if the interval elapsed. Called from the node's
    /// periodic maintenance.
    pub fn maybe_rotate(&mut self, now: Instant) {
        if now.duration_since(self.rotated_at) >= ROTATION_INTERVAL {
            self.previous_secret = Some(self.current_secret);
            self.current_secret = rand::thread_rng().gen();
            self.rotated_at = now;
        }
    }

    /// Forces a rotation regardless of elapsed time.
    pub fn rotate(&mut self, now: Instant) {
        self.previous_secret = Some(self.current_secret);
        self.current_secret = rand::thread_rng().gen();
        self.rotated_at = now;
    }

    /// The token handed out in get_peers responses to `ip`.
    pub fn generate(&self, ip: &IpAddr) -> Vec<u8> {
        Self::derive(ip, &self.current_secret)
    }

    /// Accepts tokens derived from the current or the previous secret.
    pub fn validate(&self, ip: &IpAddr, token: &[u8]) -> bool {
        if Self::derive(ip, &self.current_secret) == token {
            return true;
        }
        match &self.previous_secret {
            Some(previous) => Self::derive(ip, previous) == token,
            None => false,
        }
    }

    fn derive(ip: &IpAddr, secret: &[u8; 16]) -> Vec<u8> {
        let mut hasher = Sha1::new();
        match ip {
            IpAddr::V4(v4) => hasher.update(v4.octets()),
            IpAddr::V6(v6) => hasher.update(v6.octets()),
        }
        hasher.update(secret);
        hasher.finalize().to_vec()
    }
}

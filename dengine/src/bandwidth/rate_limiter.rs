use std::sync::Mutex;
use std::time::Instant;

/// A token bucket capping one transfer direction.
///
/// Capacity is twice the per-second refill rate, allowing a one-second
/// burst. A rate of 0 disables the bucket entirely.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    rate_bytes_per_sec: u64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: u64) -> TokenBucket {
        TokenBucket {
            state: Mutex::new(BucketState {
                rate_bytes_per_sec,
                tokens: (rate_bytes_per_sec * 2) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Changes the rate. 0 means unlimited.
    pub fn set_rate(&self, rate_bytes_per_sec: u64) {
        let mut state = self.state.lock().unwrap();
        state.rate_bytes_per_sec = rate_bytes_per_sec;
        state.tokens = state.tokens.min((rate_bytes_per_sec * 2) as f64);
    }

    /// Non-blocking consume. Returns whether `n` bytes worth of tokens were
    /// available.
    pub fn try_consume(&self, n: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.rate_bytes_per_sec == 0 {
            return true;
        }
        Self::refill(&mut state);
        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    /// Milliseconds until `n` tokens will be available, for callers that
    /// failed `try_consume` and want to retry.
    pub fn ms_until_available(&self, n: u64) -> u64 {
        let mut state = self.state.lock().unwrap();
        if state.rate_bytes_per_sec == 0 {
            return 0;
        }
        Self::refill(&mut state);
        if state.tokens >= n as f64 {
            return 0;
        }
        let missing = n as f64 - state.tokens;
        (missing * 1000.0 / state.rate_bytes_per_sec as f64).ceil() as u64
    }

    fn refill(state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        let capacity = (state.rate_bytes_per_sec * 2) as f64;
        state.tokens = (state.tokens + elapsed * state.rate_bytes_per_sec as f64).min(capacity);
    }
}

/// The download/upload bucket pair a torrent or engine carries.
#[derive(Debug)]
pub struct RateLimiter {
    pub download: TokenBucket,
    pub upload: TokenBucket,
}

impl RateLimiter {
    pub fn new(download_bytes_per_sec: u64, upload_bytes_per_sec: u64) -> RateLimiter {
        RateLimiter {
            download: TokenBucket::new(download_bytes_per_sec),
            upload: TokenBucket::new(upload_bytes_per_sec),
        }
    }
}

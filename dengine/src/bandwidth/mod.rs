pub mod accounting;
pub mod rate_limiter;

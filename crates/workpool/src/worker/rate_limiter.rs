//! Token-bucket admission control
//!
//! Tokens are refilled lazily from elapsed time on every call, so the limiter
//! needs no background ticker. It is owned by the pool and never global.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::config::RateLimitConfig;
use crate::error::PoolError;

/// Float slack so that a bucket refilled to 0.999999… still counts as one token
const TOKEN_EPSILON: f64 = 1e-9;

/// Shortest sleep between two acquisition attempts
const MIN_WAIT: Duration = Duration::from_micros(100);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with capacity `burst` and refill `rate` tokens/second
///
/// The bucket starts full.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a rate limiter from validated parameters
    pub fn new(config: &RateLimitConfig) -> Self {
        let burst = f64::from(config.burst.max(1));
        // NaN or negative rates never refill
        let rate = if config.rate > 0.0 { config.rate } else { 0.0 };
        Self {
            rate,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token if one is available, without waiting
    pub fn allow(&self) -> bool {
        self.try_acquire().is_ok()
    }

    /// Wait until a token is available
    ///
    /// Returns [`PoolError::Cancelled`] as soon as `cancel` fires; no token is
    /// consumed in that case.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), PoolError> {
        loop {
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }

            let delay = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(delay) => delay,
            };

            trace!(delay_us = delay.as_micros() as u64, "Rate limited, waiting for token");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Tokens currently in the bucket (after refill)
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst as u32
    }

    /// Consume one token or report how long until one is available
    fn try_acquire(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());

        if bucket.tokens + TOKEN_EPSILON >= 1.0 {
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
            return Ok(());
        }

        let missing = 1.0 - bucket.tokens;
        let wait = Duration::try_from_secs_f64(missing / self.rate).unwrap_or(Duration::MAX);
        Err(wait.max(MIN_WAIT))
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if elapsed.is_zero() {
            return;
        }
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        bucket.last_refill = now;
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .finish_non_exhaustive()
    }
}

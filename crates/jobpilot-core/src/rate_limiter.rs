//! Token-bucket admission control for outbound platform calls.
//!
//! Every detail fetch and chat initiation passes through
//! [`RateLimiter::acquire`]. Tokens refill lazily: each call adds
//! `floor(elapsed * rate)` tokens, capped at `capacity`.
//!
//! # Example
//!
//! ```rust,no_run
//! use jobpilot_core::rate_limiter::RateLimiter;
//!
//! # async fn run() -> Result<(), jobpilot_core::AppError> {
//! // 2 calls per second, bursts of up to 5
//! let limiter = RateLimiter::new(2.0, 5)?;
//! limiter.acquire().await;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::AppError;

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// Async token bucket.
///
/// The bucket sits behind a `tokio` mutex, so waiters queue in FIFO order
/// and the lock is never held across a kernel block. Dropping an
/// `acquire` future (timeout, task abort) releases its place in the queue
/// without consuming a token.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    capacity: u32,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket refilling at `rate` tokens per second.
    pub fn new(rate: f64, capacity: u32) -> Result<Self, AppError> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(AppError::ConfigError(format!(
                "Rate limiter rate must be positive, got {rate}"
            )));
        }
        if capacity == 0 {
            return Err(AppError::ConfigError(
                "Rate limiter capacity must be at least 1".into(),
            ));
        }
        Ok(Self {
            rate,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Suspend until a token is available, then take it.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        loop {
            self.refill(&mut bucket);
            if bucket.tokens > 0 {
                bucket.tokens -= 1;
                return;
            }
            let wait = self.time_to_next_token(&bucket);
            tracing::trace!(wait_ms = %wait.as_millis(), "Rate limiter waiting for token");
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token only if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut bucket) = self.bucket.try_lock() else {
            return false;
        };
        self.refill(&mut bucket);
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens currently in the bucket, after a refill.
    pub async fn available(&self) -> u32 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let earned = (elapsed.as_secs_f64() * self.rate).floor();
        if earned < 1.0 {
            return;
        }
        let room = f64::from(self.capacity - bucket.tokens);
        if earned >= room {
            bucket.tokens = self.capacity;
            bucket.last_refill = now;
        } else {
            bucket.tokens += earned as u32;
            // Keep the fractional remainder so frequent callers still refill.
            bucket.last_refill += Duration::from_secs_f64(earned / self.rate);
        }
    }

    fn time_to_next_token(&self, bucket: &Bucket) -> Duration {
        let period = Duration::from_secs_f64(1.0 / self.rate);
        let since = bucket.last_refill.elapsed();
        period
            .checked_sub(since)
            .unwrap_or(Duration::ZERO)
            .max(Duration::from_millis(1))
    }
}

//! One retry policy shared by every collaborator call.
//!
//! HTTP helpers use [`RetryPolicy::http`] (bounded, exponential); the chat
//! transport uses [`RetryPolicy::reconnect`] (unbounded, fixed interval).

use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, ErrorKind};

/// Backoff schedule and retry predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; `None` retries forever.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Random extra delay, uniform in `[0, jitter)`.
    pub jitter: Duration,
    /// Error kinds worth another attempt.
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::http()
    }
}

impl RetryPolicy {
    /// 5 attempts, delays 1s, 2s, 4s, 8s capped at 10s.
    pub fn http() -> Self {
        Self {
            max_attempts: Some(5),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: Duration::from_millis(250),
            retry_on: vec![ErrorKind::TransientNetwork],
        }
    }

    /// Unbounded retries at a fixed interval. Auth and protocol failures
    /// are retried too: the caller refreshes credentials between attempts.
    pub fn reconnect(interval: Duration) -> Self {
        Self {
            max_attempts: None,
            base_delay: interval,
            max_delay: interval,
            multiplier: 1.0,
            jitter: Duration::ZERO,
            retry_on: vec![
                ErrorKind::TransientNetwork,
                ErrorKind::Protocol,
                ErrorKind::Auth,
            ],
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_on(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.retry_on = kinds;
        self
    }

    pub fn should_retry(&self, error: &AppError) -> bool {
        self.retry_on.contains(&error.kind())
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }

    /// Delay before retry number `attempt` (0-indexed: the wait after the
    /// first failure is attempt 0).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let base = self.base_delay.as_secs_f64() * exp;
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter_ms = rand_jitter_ms(self.jitter.as_millis() as u64);
        Duration::from_secs_f64(capped) + Duration::from_millis(jitter_ms)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent. The last error is returned.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut operation: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut attempts = 0u32;
        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            attempts += 1;

            if !self.should_retry(&err) || !self.allows(attempts) {
                if attempts > 1 {
                    tracing::warn!(op = op_name, attempts, error = %err, "Giving up after retries");
                }
                return Err(err);
            }

            let delay = self.delay_for_attempt(attempts - 1);
            tracing::debug!(
                op = op_name,
                attempt = attempts,
                delay_ms = %delay.as_millis(),
                error = %err,
                "Retrying after failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

// xorshift64 seeded from the clock; jitter only, not crypto.
fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
        | 1;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn http_schedule_doubles_and_caps() {
        let policy = RetryPolicy::http().with_jitter(Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(10));
    }

    #[test]
    fn jitter_is_bounded() {
        let policy = RetryPolicy::http().with_jitter(Duration::from_millis(100));
        for _ in 0..50 {
            let d = policy.delay_for_attempt(0);
            assert!(d >= Duration::from_secs(1));
            assert!(d < Duration::from_millis(1100));
        }
    }

    #[test]
    fn reconnect_is_fixed_and_unbounded() {
        let policy = RetryPolicy::reconnect(Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(12), Duration::from_secs(8));
        assert!(policy.allows(10_000));
        assert!(policy.should_retry(&AppError::AuthError("rc=4".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_up_to_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::http();

        let counter = calls.clone();
        let result: Result<(), AppError> = policy
            .run("fetch_detail", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::from_status(403, "forbidden"))
                }
            })
            .await;

        assert!(matches!(result, Err(AppError::HttpStatus { status: 403, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn structural_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::http();

        let counter = calls.clone();
        let result: Result<(), AppError> = policy
            .run("fetch_detail", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::MissingField("zpData.jobCard".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::http();

        let counter = calls.clone();
        let value = policy
            .run("fetch_detail", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(AppError::Timeout(10))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

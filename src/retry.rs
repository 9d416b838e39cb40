//! Retry and backoff helpers
//!
//! `retry_async` drives fallible outbound work (channel replies) with
//! exponential backoff plus jitter; `ExponentialBackoff` paces adapter
//! restarts in the channel supervisor.

use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry policy for outbound operations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first; values below 1 count as 1
    pub attempts: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Relative jitter in `[0, 1]` applied to each delay
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            min_delay_ms: 400,
            max_delay_ms: 30_000,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    fn clamp(&self, delay_ms: u64) -> u64 {
        delay_ms.max(self.min_delay_ms).min(self.max_delay_ms.max(self.min_delay_ms))
    }
}

/// Delay before retrying after failed `attempt` (1-based), without jitter:
/// `min_delay * 2^(attempt-1)` clamped to `[min_delay, max_delay]`.
pub fn compute_backoff(policy: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let delay = policy.min_delay_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(policy.clamp(delay))
}

/// Scale `delay` by a random factor in `[1 - jitter, 1 + jitter]`, keeping
/// the result inside the policy bounds.
pub fn apply_jitter(policy: &RetryConfig, delay: Duration) -> Duration {
    let jitter = policy.jitter.clamp(0.0, 1.0);
    if jitter == 0.0 {
        return delay;
    }
    let offset: f64 = rand::thread_rng().gen_range(-1.0..=1.0) * jitter;
    let scaled = (delay.as_millis() as f64 * (1.0 + offset)).round().max(0.0) as u64;
    Duration::from_millis(policy.clamp(scaled))
}

/// Run `op` until it succeeds, attempts run out, or `should_retry` declines.
///
/// `op` receives the 1-based attempt number. The last error is returned.
pub async fn retry_async<T, F, Fut, P>(
    policy: &RetryConfig,
    label: &str,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error, u32) -> bool,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= attempts || !should_retry(&err, attempt) {
                    return Err(err);
                }
                let delay = apply_jitter(policy, compute_backoff(policy, attempt));
                tracing::debug!(
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err.to_error_shape().message,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Doubling delay with a cap, reset after a successful start
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following call returns twice as much, up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(attempts: u32) -> RetryConfig {
        RetryConfig {
            attempts,
            min_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_compute_backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(compute_backoff(&p, 1), Duration::from_millis(100));
        assert_eq!(compute_backoff(&p, 2), Duration::from_millis(200));
        assert_eq!(compute_backoff(&p, 4), Duration::from_millis(800));
        assert_eq!(compute_backoff(&p, 5), Duration::from_millis(1_000));
        assert_eq!(compute_backoff(&p, 60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let p = RetryConfig {
            jitter: 0.5,
            ..policy(3)
        };
        for _ in 0..200 {
            let d = apply_jitter(&p, Duration::from_millis(400));
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(600));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_async_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry_async(&policy(3), "test", |_, _| true, move |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(Error::Unavailable("flaky".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_async_returns_last_error() {
        let err = retry_async(&policy(2), "test", |_, _| true, |attempt| async move {
            Err::<(), _>(Error::Unavailable(format!("attempt {}", attempt)))
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Unavailable: attempt 2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_async_respects_predicate() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = retry_async(
            &policy(5),
            "test",
            |err, _| err.retryable(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::invalid("bad payload")) }
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_async_clamps_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let _ = retry_async(&policy(0), "test", |_, _| true, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::Unavailable("down".into())) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exponential_backoff() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(60));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}

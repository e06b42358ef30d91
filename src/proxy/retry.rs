// SPDX-License-Identifier: MIT
//! Exponential backoff with jitter for upstream and provider calls.
//!
//! Formula: `min(base * multiplier^attempt, max) ± jitter`, where jitter is
//! a uniform fraction of the computed delay.

use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try). Default: 3
    pub max_attempts: u32,
    /// Delay before the second attempt. Default: 100 ms
    pub base_delay: Duration,
    /// Upper bound on any single delay. Default: 5 s
    pub max_delay: Duration,
    /// Growth multiplier per attempt. Default: 2.0
    pub multiplier: f64,
    /// Jitter as a fraction of the computed delay (0.0–1.0). Default: 0.25
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_fraction: 0.25,
        }
    }
}

impl RetryPolicy {
    /// A config suitable for quick unit tests (no real waiting).
    pub fn instant() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retrying after `attempt` (0-indexed) has failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_millis() as f64);
        let jitter_range = capped * self.jitter_fraction;
        // Uniform jitter in ±jitter_range/2.
        let jitter = (fastrand::f64() - 0.5) * jitter_range;
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Retry an async operation with exponential backoff.
///
/// Calls `f()` up to `policy.max_attempts` times, sleeping the computed
/// backoff between failures. Returns the first success or the last error.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_err: Option<E> = None;
    for attempt in 0..policy.max_attempts {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "retry succeeded");
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt + 1 < policy.max_attempts {
                    let delay = policy.delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max = policy.max_attempts,
                        delay_ms = delay.as_millis(),
                        err = %e,
                        "attempt failed — backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("max_attempts must be at least 1"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_and_cap() {
        let p = RetryPolicy {
            jitter_fraction: 0.0,
            ..Default::default()
        };
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(10), Duration::from_secs(5)); // capped
    }

    #[test]
    fn jitter_stays_in_band() {
        let p = RetryPolicy::default();
        for attempt in 0..5 {
            let nominal = 100.0 * 2f64.powi(attempt);
            let d = p.delay(attempt as u32).as_millis() as f64;
            let capped = nominal.min(5000.0);
            assert!(d >= capped * 0.875 - 1.0 && d <= capped * 1.125 + 1.0);
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            retry_with_backoff(&RetryPolicy::instant(), || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("boom".to_string())
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> =
            retry_with_backoff(&RetryPolicy::instant(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("always".to_string())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

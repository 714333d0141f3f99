/*
 * modelboost - Adaptive model delivery for the temple virtual tour.
 * Copyright (C) 2025  modelboost contributors
 */

//! Injectable retry policy with exponential backoff.

use crate::error::DeliveryResult;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles each time
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Single attempt, errors surface immediately
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn exponential(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Delay after failed attempt `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. The last error is returned.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> DeliveryResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DeliveryResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_retries && e.is_retryable() => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        op = label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delays_double_from_initial() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(30), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(1));
        let calls = &AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = policy
            .run("test", move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(DeliveryError::network("mem://x", "reset"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(1));
        let calls = &AtomicU32::new(0);

        let result: DeliveryResult<()> = policy
            .run("test", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DeliveryError::network("mem://x", "reset"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(1));
        let calls = &AtomicU32::new(0);

        let result: DeliveryResult<()> = policy
            .run("test", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DeliveryError::HttpStatus {
                    url: "mem://x".into(),
                    status: 404,
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_none_is_single_attempt() {
        let calls = &AtomicU32::new(0);
        let result: DeliveryResult<()> = RetryPolicy::none()
            .run("test", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DeliveryError::network("mem://x", "reset"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

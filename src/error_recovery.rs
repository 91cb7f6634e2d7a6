//! Automatic error recovery strategies.
//!
//! Transient failures (`Communication`, `Timeout`) of a single hardware
//! command are retried with exponential backoff. Everything else is returned
//! to the caller on the first occurrence.

use crate::error::{FlowError, FlowResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Factor applied to the delay after every failed attempt.
    pub multiplier: f64,
    /// Upper bound for a single delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }

    pub(crate) fn validate(&self) -> FlowResult<()> {
        if self.max_attempts == 0 {
            return Err(FlowError::Configuration(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(FlowError::Configuration(
                "retry.multiplier must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are exhausted. `on_retry` is called with the failed
/// attempt number, its error and the delay before the next attempt.
///
/// Only the operation passed in is repeated; callers decide what a single
/// operation is.
pub async fn retry_transient<T, F, Fut, R>(
    policy: &RetryPolicy,
    mut op: F,
    mut on_retry: R,
) -> FlowResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = FlowResult<T>>,
    R: FnMut(u32, &FlowError, Duration),
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff_for(attempt);
                on_retry(attempt, &err, delay);
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky(calls: &AtomicU32, succeed_on_attempt: u32) -> FlowResult<u32> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= succeed_on_attempt {
            Ok(n)
        } else {
            Err(FlowError::Timeout {
                channel: "pump_a".into(),
                timeout: Duration::from_millis(50),
            })
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_succeeds() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let result = retry_transient(
            &RetryPolicy::default(),
            || async { flaky(&calls, 2) },
            |attempt, _, delay| retries.push((attempt, delay)),
        )
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(retries, vec![(1, Duration::from_millis(100))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_fails() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(
            &RetryPolicy::default(),
            || async { flaky(&calls, 10) },
            |_, _, _| {},
        )
        .await;
        assert!(matches!(result, Err(FlowError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: FlowResult<()> = retry_transient(
            &RetryPolicy::default(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FlowError::HardwareFault {
                    channel: "pump_a".into(),
                    message: "stall".into(),
                })
            },
            |_, _, _| {},
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

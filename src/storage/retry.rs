//! Retry policy for storage calls: exponential backoff with jitter, bounded by
//! attempt count and total elapsed time.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::StoreError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// No new attempt starts once this much time has passed.
    pub max_elapsed: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_elapsed: Duration::from_secs(900),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the next attempt after `attempts` failures (1-indexed),
    /// without jitter: `base_delay * multiplier^(attempts - 1)`, capped.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(attempts.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        // Up to +25% so concurrent runs for different sources spread out.
        let extra_ms = (delay.as_millis() as f64 * rand::random::<f64>() * 0.25) as u64;
        (delay + Duration::from_millis(extra_ms)).min(self.max_delay)
    }
}

#[derive(Debug)]
pub enum RetryError {
    /// The cancellation token fired while waiting or running.
    Cancelled,
    /// A non-transient error, or the last transient one once the budget ran out.
    Failed { attempts: u32, error: StoreError },
}

/// Runs `operation` until it succeeds, fails permanently, or the policy's
/// budget is spent. Backoff waits only suspend the calling task.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            outcome = operation() => outcome,
        };

        let error = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "storage call succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !error.is_transient() {
            return Err(RetryError::Failed {
                attempts: attempt,
                error,
            });
        }

        let delay = policy.with_jitter(policy.next_delay(attempt));
        if attempt >= policy.max_attempts || started.elapsed() + delay > policy.max_elapsed {
            warn!(operation = operation_name, attempt, %error, "retry budget exhausted");
            return Err(RetryError::Failed {
                attempts: attempt,
                error,
            });
        }

        warn!(
            operation = operation_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            %error,
            "transient storage failure, backing off"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

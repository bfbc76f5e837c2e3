//! Retry with bounded exponential backoff.
//!
//! Only failures classified retryable by [`BackendError::is_retryable`] are
//! retried: HTTP 429 and 5xx, network errors and timeouts. Client errors
//! (400/401/403/404/405/422) propagate immediately. Delays double per attempt
//! up to a ceiling, with ±25% jitter so concurrent callers do not retry in
//! lockstep.

use crate::backend::BackendError;
use crate::metrics;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry; doubles each attempt.
    pub base_delay: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
    /// Scale each delay by a uniform factor in `[0.75, 1.25]`.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy with the given retry count and delay bounds, jitter on.
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// Disable jitter (deterministic delays, mainly for tests).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Backoff delay for a 0-indexed attempt, before jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let factor = 0.75 + rand::thread_rng().gen_range(0.0..0.5);
        delay.mul_f64(factor)
    }

    /// Run `op`, retrying retryable failures with backoff.
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are exhausted, or the first
    /// non-retryable error immediately.
    pub async fn run<F, Fut, T>(&self, mut op: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt = attempt + 1, "succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.jittered(self.backoff_delay(attempt));
                    warn!(
                        attempt = attempt + 1,
                        total = self.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    metrics::inc_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if !e.is_retryable() {
                        warn!(error = %e, "error is not retryable");
                    } else {
                        warn!(attempts = attempt + 1, error = %e, "retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

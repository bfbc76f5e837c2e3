//! Per-backend call path: circuit gate → concurrency slot → retry → record.
//!
//! A [`BackendCaller`] owns one backend's breaker and limiter and turns every
//! outcome — including timeouts and panicked upstream parsing — into a
//! [`BackendResult`]; nothing escapes as an error. Failures of one caller are
//! invisible to its siblings.

use crate::backend::{max_tokens, BackendClient, BackendError};
use crate::config::{ResilienceConfig, TimeoutConfig};
use crate::context::ContextMessage;
use crate::metrics;
use crate::resilience::{BreakerSnapshot, CircuitBreaker, ConcurrencyLimiter, RetryPolicy};
use crate::{BackendResult, ErrorKind, RequestKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Combines one backend client with its failure-isolation stack.
pub struct BackendCaller {
    client: Arc<dyn BackendClient>,
    circuit: CircuitBreaker,
    limiter: ConcurrencyLimiter,
    retry: RetryPolicy,
    timeouts: TimeoutConfig,
}

impl BackendCaller {
    /// Build a caller for `client` with its own breaker and limiter.
    ///
    /// `concurrency` is this backend's slot count (the global budget divided
    /// among backends by the composition root).
    pub fn new(
        client: Arc<dyn BackendClient>,
        resilience: &ResilienceConfig,
        timeouts: TimeoutConfig,
        concurrency: usize,
    ) -> Self {
        let name = client.name().to_string();
        Self {
            circuit: CircuitBreaker::new(
                name.clone(),
                resilience.failure_threshold,
                resilience.recovery_timeout(),
                resilience.half_open_requests,
            ),
            limiter: ConcurrencyLimiter::new(name, concurrency),
            retry: RetryPolicy::new(
                resilience.max_retries,
                resilience.retry_base(),
                resilience.retry_max(),
            ),
            client,
            timeouts,
        }
    }

    /// Backend name.
    pub fn name(&self) -> &str {
        self.client.name()
    }

    /// This backend's circuit breaker (read access for monitoring).
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// This backend's concurrency limiter (read access for monitoring).
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Breaker snapshot for the status endpoint.
    pub async fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.circuit.snapshot().await
    }

    /// Call the backend for one request.
    ///
    /// Sequence: breaker gate, concurrency slot, retry-wrapped call under
    /// the per-kind timeout floor, then breaker + metrics recording. The
    /// slot is held for the whole retried call and released unconditionally.
    pub async fn call(
        &self,
        question: &str,
        context: &[ContextMessage],
        kind: RequestKind,
        request_id: &str,
    ) -> BackendResult {
        let name = self.client.name();

        if !self.circuit.allow().await {
            debug!(backend = name, request_id, "skipped, circuit open");
            metrics::record_backend_call(
                name,
                false,
                Duration::ZERO,
                ErrorKind::CircuitOpen.as_str(),
            );
            return BackendResult::err(
                name,
                ErrorKind::CircuitOpen,
                "backend temporarily unavailable",
                Duration::ZERO,
            );
        }

        let _slot = self.limiter.acquire().await;
        let started = Instant::now();
        let deadline = self.timeouts.for_kind(kind);
        let budget = max_tokens(question, kind);

        let outcome = self
            .retry
            .run(|| self.attempt(question, context, budget, deadline))
            .await;
        let latency = started.elapsed();

        match outcome {
            Ok(text) => {
                self.circuit.record_success().await;
                metrics::record_backend_call(name, true, latency, "");
                debug!(
                    backend = name,
                    request_id,
                    latency_ms = latency.as_millis() as u64,
                    "backend answered"
                );
                BackendResult::ok(name, text, latency)
            }
            Err(e) => {
                self.circuit.record_failure().await;
                metrics::record_backend_call(name, false, latency, e.kind().as_str());
                error!(
                    backend = name,
                    request_id,
                    latency_ms = latency.as_millis() as u64,
                    error = %e,
                    "backend call failed"
                );
                BackendResult::err(name, e.kind(), e.to_string(), latency)
            }
        }
    }

    async fn attempt(
        &self,
        question: &str,
        context: &[ContextMessage],
        budget: u32,
        deadline: Duration,
    ) -> Result<String, BackendError> {
        match tokio::time::timeout(deadline, self.client.call(question, context, budget)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted backend: fails with the given error a fixed number of times,
    /// then succeeds.
    struct Scripted {
        name: String,
        failures_before_success: usize,
        error: BackendError,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Scripted {
        fn new(name: &str, failures: usize, error: BackendError) -> Self {
            Self {
                name: name.to_string(),
                failures_before_success: failures,
                error,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn always_failing(name: &str, error: BackendError) -> Self {
            Self::new(name, usize::MAX, error)
        }
    }

    #[async_trait]
    impl BackendClient for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        async fn call(
            &self,
            question: &str,
            _context: &[ContextMessage],
            _max_tokens: u32,
        ) -> Result<String, BackendError> {
            tokio::time::sleep(self.delay).await;
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(self.error.clone())
            } else {
                Ok(format!("answer to {question}"))
            }
        }
    }

    fn resilience(max_retries: u32, failure_threshold: u32) -> ResilienceConfig {
        ResilienceConfig {
            failure_threshold,
            recovery_timeout_secs: 30,
            half_open_requests: 2,
            max_retries,
            retry_base_ms: 1,
            retry_max_ms: 5,
            max_concurrent_calls: 15,
        }
    }

    fn caller(client: Arc<dyn BackendClient>, max_retries: u32) -> BackendCaller {
        BackendCaller::new(client, &resilience(max_retries, 5), TimeoutConfig::default(), 5)
    }

    #[tokio::test]
    async fn test_success_produces_ok_result() {
        let c = caller(Arc::new(Scripted::new("fast", 0, BackendError::Timeout)), 2);
        let result = c.call("q", &[], RequestKind::Text, "r1").await;
        assert!(result.success);
        assert_eq!(result.backend, "fast");
        assert_eq!(result.text, "answer to q");
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let scripted = Arc::new(Scripted::new(
            "flaky",
            2,
            BackendError::Http {
                status: 500,
                body: String::new(),
            },
        ));
        let c = caller(scripted.clone(), 2);

        let result = c.call("q", &[], RequestKind::Text, "r1").await;
        assert!(result.success, "must succeed after two 500s with 2 retries");
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_once() {
        let scripted = Arc::new(Scripted::always_failing(
            "strict",
            BackendError::Http {
                status: 404,
                body: String::new(),
            },
        ));
        let c = caller(scripted.clone(), 3);

        let result = c.call("q", &[], RequestKind::Text, "r1").await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::ClientError));
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_and_short_circuits() {
        let scripted = Arc::new(Scripted::always_failing(
            "down",
            BackendError::Network("refused".into()),
        ));
        // failure_threshold 2, no retries: two calls open the circuit
        let c = BackendCaller::new(
            scripted.clone(),
            &resilience(0, 2),
            TimeoutConfig::default(),
            5,
        );

        let _ = c.call("q", &[], RequestKind::Text, "r1").await;
        let _ = c.call("q", &[], RequestKind::Text, "r2").await;

        let gated = c.call("q", &[], RequestKind::Text, "r3").await;
        assert_eq!(gated.error_kind, Some(ErrorKind::CircuitOpen));
        assert_eq!(gated.latency, Duration::ZERO);
        // The gated call never reached the backend
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_becomes_failure_result() {
        let mut scripted = Scripted::new("slow", 0, BackendError::Timeout);
        scripted.delay = Duration::from_millis(200);
        let mut timeouts = TimeoutConfig::default();
        timeouts.chat_secs = 0; // floor of zero forces immediate timeout

        let c = BackendCaller::new(
            Arc::new(scripted),
            &resilience(0, 5),
            timeouts,
            5,
        );
        let result = c.call("q", &[], RequestKind::Text, "r1").await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_limiter_slot_released_after_call() {
        let c = caller(Arc::new(Scripted::new("ok", 0, BackendError::Timeout)), 0);
        let _ = c.call("q", &[], RequestKind::Text, "r1").await;
        assert_eq!(c.limiter().used(), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_surfaces_after_retries_exhaust() {
        let scripted = Arc::new(Scripted::always_failing(
            "throttled",
            BackendError::Http {
                status: 429,
                body: String::new(),
            },
        ));
        let c = caller(scripted.clone(), 1);

        let result = c.call("q", &[], RequestKind::Text, "r1").await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::RateLimited));
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 2);
    }
}

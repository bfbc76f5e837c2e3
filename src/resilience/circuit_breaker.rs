//! Circuit Breaker
//!
//! Stops calling a backend after repeated failures and periodically probes
//! for recovery.
//!
//! ## States
//! - **Closed**: requests flow; a success decrements the failure counter, so
//!   isolated errors are forgiven
//! - **Open**: requests rejected until the recovery timeout elapses
//! - **Half-Open**: a bounded budget of trial requests is admitted; one
//!   failure reopens immediately, enough successes close
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use fanout_dispatch::resilience::CircuitBreaker;
//! # #[tokio::main]
//! # async fn main() {
//! let breaker = CircuitBreaker::new("groq", 5, Duration::from_secs(30), 3);
//!
//! if breaker.allow().await {
//!     // ... perform the backend call ...
//!     let call_succeeded = true;
//!     if call_succeeded {
//!         breaker.record_success().await;
//!     } else {
//!         breaker.record_failure().await;
//!     }
//! } else {
//!     // fail fast, backend is unavailable
//! }
//! # }
//! ```

use crate::metrics;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests flow through.
    Closed,
    /// Backend failing, requests rejected immediately.
    Open,
    /// Probing recovery with a bounded trial budget.
    HalfOpen,
}

impl CircuitState {
    /// Stable label used in logs and the status endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: closed=0, half_open=1, open=2.
    pub fn as_gauge(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    half_open_successes: u32,
    half_open_budget: u32,
    last_failure_at: Option<Instant>,
}

/// Per-backend circuit breaker.
///
/// All transitions happen under a single mutex, so an `allow()` that consumes
/// a half-open trial slot can never be oversubscribed by a concurrent caller.
/// Already-admitted calls are never cancelled by a later state change.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_requests: u32,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    ///
    /// * `failure_threshold` — failures (net of forgiving successes) before
    ///   the breaker opens
    /// * `recovery_timeout` — how long the open state blocks before probing
    /// * `half_open_requests` — trial budget while half-open; the same count
    ///   of recorded successes closes the breaker
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout: Duration,
        half_open_requests: u32,
    ) -> Self {
        let name = name.into();
        metrics::set_circuit_state(&name, CircuitState::Closed.as_gauge());
        Self {
            name,
            failure_threshold,
            recovery_timeout,
            half_open_requests,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                half_open_successes: 0,
                half_open_budget: 0,
                last_failure_at: None,
            }),
        }
    }

    /// Backend name this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask for permission to call the backend.
    ///
    /// Returns `false` while open (and the recovery timeout has not elapsed)
    /// or while half-open with the trial budget exhausted. A `true` from the
    /// half-open state consumes one trial slot.
    pub async fn allow(&self) -> bool {
        let mut s = self.state.lock().await;

        match s.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = s.last_failure_at.map(|t| t.elapsed());
                match elapsed {
                    Some(e) if e >= self.recovery_timeout => {
                        s.state = CircuitState::HalfOpen;
                        s.half_open_budget = self.half_open_requests;
                        s.half_open_successes = 0;
                        info!(backend = %self.name, "circuit entering half-open");
                        metrics::set_circuit_state(&self.name, CircuitState::HalfOpen.as_gauge());
                        // Grant the first trial slot to this caller
                        s.half_open_budget -= 1;
                        true
                    }
                    _ => {
                        debug!(backend = %self.name, "circuit open, request rejected");
                        false
                    }
                }
            }
            CircuitState::HalfOpen => {
                if s.half_open_budget > 0 {
                    s.half_open_budget -= 1;
                    true
                } else {
                    debug!(backend = %self.name, "half-open budget exhausted");
                    false
                }
            }
        }
    }

    /// Record a successful backend call.
    ///
    /// While half-open, enough successes close the breaker. While closed, a
    /// success decrements the failure counter (floor 0).
    pub async fn record_success(&self) {
        let mut s = self.state.lock().await;

        match s.state {
            CircuitState::HalfOpen => {
                s.half_open_successes += 1;
                if s.half_open_successes >= self.half_open_requests {
                    s.state = CircuitState::Closed;
                    s.failures = 0;
                    info!(backend = %self.name, "circuit closed, backend recovered");
                    metrics::set_circuit_state(&self.name, CircuitState::Closed.as_gauge());
                }
            }
            CircuitState::Closed => {
                s.failures = s.failures.saturating_sub(1);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed backend call.
    ///
    /// While half-open a single failure reopens immediately. While closed,
    /// hitting the failure threshold opens the breaker.
    pub async fn record_failure(&self) {
        let mut s = self.state.lock().await;
        s.failures += 1;
        s.last_failure_at = Some(Instant::now());

        match s.state {
            CircuitState::HalfOpen => {
                s.state = CircuitState::Open;
                warn!(backend = %self.name, "circuit reopened, half-open trial failed");
                metrics::set_circuit_state(&self.name, CircuitState::Open.as_gauge());
            }
            CircuitState::Closed => {
                if s.failures >= self.failure_threshold {
                    s.state = CircuitState::Open;
                    warn!(
                        backend = %self.name,
                        failures = s.failures,
                        threshold = self.failure_threshold,
                        "circuit opened"
                    );
                    metrics::set_circuit_state(&self.name, CircuitState::Open.as_gauge());
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Current state without consuming a trial slot.
    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Read-only snapshot for the status endpoint.
    pub async fn snapshot(&self) -> BreakerSnapshot {
        let s = self.state.lock().await;
        BreakerSnapshot {
            name: self.name.clone(),
            state: s.state,
            failures: s.failures,
            half_open_budget: s.half_open_budget,
        }
    }
}

/// Point-in-time view of a breaker, for monitoring.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    /// Backend name.
    pub name: String,
    /// State at snapshot time.
    pub state: CircuitState,
    /// Current failure counter.
    pub failures: u32,
    /// Remaining half-open trial slots (0 unless half-open).
    pub half_open_budget: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration, half_open: u32) -> CircuitBreaker {
        CircuitBreaker::new("test", threshold, recovery, half_open)
    }

    #[tokio::test]
    async fn test_closed_allows_requests() {
        let b = breaker(3, Duration::from_secs(30), 2);
        assert!(b.allow().await);
        assert_eq!(b.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_failure_threshold() {
        let b = breaker(3, Duration::from_secs(30), 2);
        for _ in 0..3 {
            b.record_failure().await;
        }
        assert_eq!(b.state().await, CircuitState::Open);
        assert!(!b.allow().await);
    }

    #[tokio::test]
    async fn test_success_decrements_failure_counter_while_closed() {
        let b = breaker(3, Duration::from_secs(30), 2);
        b.record_failure().await;
        b.record_failure().await;
        b.record_success().await;
        // Two failures minus one forgiving success: one more failure must
        // not reach the threshold of 3.
        b.record_failure().await;
        assert_eq!(b.state().await, CircuitState::Closed);
        b.record_failure().await;
        assert_eq!(b.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_blocks_until_recovery_timeout() {
        let b = breaker(1, Duration::from_millis(100), 2);
        b.record_failure().await;
        assert!(!b.allow().await);

        tokio::time::sleep(Duration::from_millis(150)).await;

        // First allow after the timeout transitions to half-open and grants
        // a trial slot.
        assert!(b.allow().await);
        assert_eq!(b.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_budget_is_bounded() {
        let b = breaker(1, Duration::from_millis(50), 2);
        b.record_failure().await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(b.allow().await); // trial 1 (transition)
        assert!(b.allow().await); // trial 2
        assert!(!b.allow().await, "budget of 2 must be exhausted");
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_immediately() {
        let b = breaker(1, Duration::from_millis(50), 3);
        b.record_failure().await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(b.allow().await);
        b.record_failure().await;
        assert_eq!(b.state().await, CircuitState::Open);
        assert!(!b.allow().await);
    }

    #[tokio::test]
    async fn test_half_open_successes_close_breaker() {
        let b = breaker(1, Duration::from_millis(50), 2);
        b.record_failure().await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(b.allow().await);
        b.record_success().await;
        assert_eq!(b.state().await, CircuitState::HalfOpen);

        assert!(b.allow().await);
        b.record_success().await;
        assert_eq!(b.state().await, CircuitState::Closed);

        // Failure counter was reset on close
        let snap = b.snapshot().await;
        assert_eq!(snap.failures, 0);
    }

    #[tokio::test]
    async fn test_reopen_resets_recovery_window() {
        let b = breaker(1, Duration::from_millis(100), 1);
        b.record_failure().await;
        tokio::time::sleep(Duration::from_millis(130)).await;

        assert!(b.allow().await);
        b.record_failure().await; // reopen, fresh last_failure_at

        // Well inside the new recovery window: still blocked.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!b.allow().await);
    }

    #[tokio::test]
    async fn test_snapshot_reports_state() {
        let b = breaker(2, Duration::from_secs(30), 3);
        b.record_failure().await;
        let snap = b.snapshot().await;
        assert_eq!(snap.name, "test");
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failures, 1);
    }

    #[test]
    fn test_state_gauge_encoding() {
        assert_eq!(CircuitState::Closed.as_gauge(), 0);
        assert_eq!(CircuitState::HalfOpen.as_gauge(), 1);
        assert_eq!(CircuitState::Open.as_gauge(), 2);
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(CircuitState::Closed.as_str(), "closed");
        assert_eq!(CircuitState::Open.as_str(), "open");
        assert_eq!(CircuitState::HalfOpen.as_str(), "half_open");
    }
}

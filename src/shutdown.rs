//! Graceful shutdown coordination.
//!
//! Tracks in-flight requests, answers liveness/readiness probes, and drains
//! active work within a timeout at shutdown. The drain timeout is non-fatal:
//! shutdown proceeds anyway and is reported as a partial drain.

use crate::metrics;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How often the drain loop re-checks the active count.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of the drain phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight request finished.
    Complete {
        /// How long the drain took.
        waited_secs: u64,
    },
    /// The timeout fired with work still in flight.
    TimedOut {
        /// Requests still active when the timeout fired.
        remaining: usize,
    },
}

/// Tracks readiness and in-flight work for coordinated shutdown.
pub struct ShutdownCoordinator {
    drain_timeout: Duration,
    ready: AtomicBool,
    shutting_down: AtomicBool,
    active: Arc<AtomicUsize>,
}

impl ShutdownCoordinator {
    /// Coordinator that waits up to `drain_timeout` for in-flight work.
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            drain_timeout,
            ready: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Liveness probe: if this code runs, the process is alive.
    pub fn is_alive(&self) -> bool {
        true
    }

    /// Readiness probe: false during startup and during shutdown drain.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.is_shutting_down()
    }

    /// Flip readiness (call with `true` once startup completes).
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
        info!(ready, "readiness changed");
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Requests currently in flight.
    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Register one in-flight request; the count drops when the guard drops.
    pub fn begin_request(&self) -> RequestGuard {
        let count = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_requests(count as i64);
        RequestGuard {
            active: Arc::clone(&self.active),
        }
    }

    /// Flip into the shutting-down state; new admissions are rejected from
    /// here on. Idempotent.
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            self.ready.store(false, Ordering::SeqCst);
            info!("shutdown initiated, new admissions rejected");
        }
    }

    /// Wait for in-flight requests to finish, up to the drain timeout.
    ///
    /// Logs progress once per second. A timeout is reported, not fatal.
    pub async fn drain(&self) -> DrainOutcome {
        let started = Instant::now();

        loop {
            let active = self.active_requests();
            if active == 0 {
                let waited_secs = started.elapsed().as_secs();
                info!(waited_secs, "drain complete, no requests in flight");
                return DrainOutcome::Complete { waited_secs };
            }

            if started.elapsed() >= self.drain_timeout {
                warn!(
                    remaining = active,
                    timeout_secs = self.drain_timeout.as_secs(),
                    "drain timeout, shutting down with requests in flight"
                );
                return DrainOutcome::TimedOut { remaining: active };
            }

            info!(
                active,
                elapsed_secs = started.elapsed().as_secs(),
                "draining in-flight requests"
            );
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Full shutdown sequence: flip readiness, then drain.
    pub async fn initiate_shutdown(&self) -> DrainOutcome {
        self.begin_shutdown();
        self.drain().await
    }
}

/// RAII registration of one in-flight request.
pub struct RequestGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let count = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_active_requests(count as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_until_set() {
        let c = ShutdownCoordinator::new(Duration::from_secs(1));
        assert!(c.is_alive());
        assert!(!c.is_ready());

        c.set_ready(true);
        assert!(c.is_ready());
    }

    #[test]
    fn test_shutdown_flips_readiness() {
        let c = ShutdownCoordinator::new(Duration::from_secs(1));
        c.set_ready(true);
        c.begin_shutdown();
        assert!(!c.is_ready());
        assert!(c.is_shutting_down());
        assert!(c.is_alive(), "liveness is independent of shutdown");
    }

    #[test]
    fn test_request_guard_tracks_active_count() {
        let c = ShutdownCoordinator::new(Duration::from_secs(1));
        assert_eq!(c.active_requests(), 0);

        let g1 = c.begin_request();
        let g2 = c.begin_request();
        assert_eq!(c.active_requests(), 2);

        drop(g1);
        assert_eq!(c.active_requests(), 1);
        drop(g2);
        assert_eq!(c.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_drain_completes_when_idle() {
        let c = ShutdownCoordinator::new(Duration::from_secs(5));
        let outcome = c.initiate_shutdown().await;
        assert!(matches!(outcome, DrainOutcome::Complete { .. }));
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_request() {
        let c = Arc::new(ShutdownCoordinator::new(Duration::from_secs(10)));

        let guard = c.begin_request();
        let worker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1100)).await;
            drop(guard);
        });

        let outcome = c.initiate_shutdown().await;
        assert!(matches!(outcome, DrainOutcome::Complete { .. }));
        assert_eq!(c.active_requests(), 0);
        let _ = worker.await;
    }

    #[tokio::test]
    async fn test_drain_timeout_is_nonfatal() {
        let c = ShutdownCoordinator::new(Duration::from_millis(100));
        let _held = c.begin_request();

        let outcome = c.initiate_shutdown().await;
        assert_eq!(outcome, DrainOutcome::TimedOut { remaining: 1 });
    }

    #[test]
    fn test_begin_shutdown_is_idempotent() {
        let c = ShutdownCoordinator::new(Duration::from_secs(1));
        c.begin_shutdown();
        c.begin_shutdown();
        assert!(c.is_shutting_down());
    }
}

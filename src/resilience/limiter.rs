//! Per-backend concurrency limiter.
//!
//! Wraps a fixed-size counting semaphore and exposes its occupancy for
//! observability and the autoscaler's admission decisions. Utilization at or
//! above 80% emits a warning; it is a signal, not a gate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

/// Bounds simultaneous in-flight calls to one backend.
pub struct ConcurrencyLimiter {
    name: String,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

impl ConcurrencyLimiter {
    /// Create a limiter with `capacity` slots.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Acquire a slot, waiting until one is free.
    ///
    /// The slot is released when the returned permit drops, so release
    /// happens unconditionally — on success, error or panic alike.
    pub async fn acquire(&self) -> SlotPermit {
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(p) => p,
            // The semaphore is never closed for the lifetime of the limiter.
            Err(_) => unreachable!("concurrency limiter semaphore closed"),
        };
        let used = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;

        let utilization = self.utilization_of(used);
        if utilization >= 80.0 {
            warn!(
                backend = %self.name,
                used,
                capacity = self.capacity,
                utilization_percent = utilization,
                "high concurrency load"
            );
        }

        SlotPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Slots currently held.
    pub fn used(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.used())
    }

    /// Occupancy as a percentage of capacity.
    pub fn utilization_percent(&self) -> f64 {
        self.utilization_of(self.used())
    }

    /// Configured slot count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn utilization_of(&self, used: usize) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (used as f64 / self.capacity as f64) * 100.0
    }
}

/// RAII slot handle; dropping it returns the slot to the limiter.
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release_track_occupancy() {
        let limiter = ConcurrencyLimiter::new("test", 3);
        assert_eq!(limiter.used(), 0);
        assert_eq!(limiter.available(), 3);

        let p1 = limiter.acquire().await;
        let p2 = limiter.acquire().await;
        assert_eq!(limiter.used(), 2);
        assert_eq!(limiter.available(), 1);

        drop(p1);
        assert_eq!(limiter.used(), 1);
        drop(p2);
        assert_eq!(limiter.used(), 0);
    }

    #[tokio::test]
    async fn test_utilization_percent() {
        let limiter = ConcurrencyLimiter::new("test", 4);
        let _p1 = limiter.acquire().await;
        assert!((limiter.utilization_percent() - 25.0).abs() < f64::EPSILON);
        let _p2 = limiter.acquire().await;
        assert!((limiter.utilization_percent() - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_acquire_blocks_at_capacity() {
        let limiter = Arc::new(ConcurrencyLimiter::new("test", 1));
        let held = limiter.acquire().await;

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let _p = limiter.acquire().await;
            })
        };

        // The waiter must not complete while the slot is held.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let joined = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(joined.is_ok(), "waiter must proceed after release");
    }

    #[tokio::test]
    async fn test_permit_released_even_if_task_panics() {
        let limiter = Arc::new(ConcurrencyLimiter::new("test", 1));

        let limiter_clone = Arc::clone(&limiter);
        let handle = tokio::spawn(async move {
            let _p = limiter_clone.acquire().await;
            panic!("simulated task failure");
        });
        let _ = handle.await;

        // The slot must be free again.
        let acquired =
            tokio::time::timeout(Duration::from_millis(200), limiter.acquire()).await;
        assert!(acquired.is_ok(), "slot must be released on panic");
    }

    #[tokio::test]
    async fn test_zero_capacity_reports_zero_utilization() {
        let limiter = ConcurrencyLimiter::new("test", 0);
        assert_eq!(limiter.utilization_percent(), 0.0);
        assert_eq!(limiter.available(), 0);
    }
}

//! Per-user sliding-window rate limiter.
//!
//! Keeps the last `calls_limit` request timestamps per user; entries older
//! than the window are pruned lazily on each check. Users idle beyond the
//! TTL are purged by a periodic sweep so memory stays bounded.
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use fanout_dispatch::resilience::UserRateLimiter;
//! # #[tokio::main]
//! # async fn main() {
//! let limiter = UserRateLimiter::new(5, Duration::from_secs(60), Duration::from_secs(3600));
//!
//! if limiter.allow(42) {
//!     // process the request
//! } else {
//!     let wait = limiter.remaining_wait(42);
//!     // tell the user to retry in `wait`
//! }
//! # }
//! ```

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct UserWindow {
    requests: VecDeque<Instant>,
    last_activity: Instant,
}

/// Sliding-window limiter shared across all users.
pub struct UserRateLimiter {
    windows: DashMap<u64, UserWindow>,
    calls_limit: usize,
    period: Duration,
    user_ttl: Duration,
}

impl UserRateLimiter {
    /// Create a limiter admitting `calls_limit` requests per `period` per
    /// user, purging users idle longer than `user_ttl`.
    pub fn new(calls_limit: usize, period: Duration, user_ttl: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            calls_limit,
            period,
            user_ttl,
        }
    }

    /// Check whether `user_id` may make a request now; records the request
    /// if admitted.
    pub fn allow(&self, user_id: u64) -> bool {
        let now = Instant::now();
        let mut entry = self.windows.entry(user_id).or_insert_with(|| UserWindow {
            requests: VecDeque::with_capacity(self.calls_limit),
            last_activity: now,
        });

        entry.last_activity = now;

        // Prune timestamps that have slid out of the window
        while let Some(oldest) = entry.requests.front() {
            if now.duration_since(*oldest) >= self.period {
                entry.requests.pop_front();
            } else {
                break;
            }
        }

        if entry.requests.len() < self.calls_limit {
            entry.requests.push_back(now);
            debug!(
                user_id,
                in_window = entry.requests.len(),
                limit = self.calls_limit,
                "rate limit check passed"
            );
            return true;
        }

        warn!(
            user_id,
            in_window = entry.requests.len(),
            limit = self.calls_limit,
            "rate limit exceeded"
        );
        false
    }

    /// Time until the oldest recorded request leaves the user's window.
    ///
    /// Zero for unknown users or users with spare quota.
    pub fn remaining_wait(&self, user_id: u64) -> Duration {
        let Some(entry) = self.windows.get(&user_id) else {
            return Duration::ZERO;
        };
        let Some(oldest) = entry.requests.front() else {
            return Duration::ZERO;
        };
        self.period.saturating_sub(oldest.elapsed())
    }

    /// Number of users currently tracked.
    pub fn active_users(&self) -> usize {
        self.windows.len()
    }

    /// Remove users idle beyond the TTL. Returns how many were purged.
    pub fn purge_idle(&self) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| w.last_activity.elapsed() <= self.user_ttl);
        let purged = before - self.windows.len();
        if purged > 0 {
            info!(purged, active = self.windows.len(), "purged idle users");
        }
        purged
    }

    /// Spawn the periodic idle-user sweep. Abort the handle on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                limiter.purge_idle();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exactly_calls_limit_admissions_per_window() {
        let limiter = UserRateLimiter::new(5, Duration::from_secs(60), Duration::from_secs(3600));

        for i in 0..5 {
            assert!(limiter.allow(1), "request {i} must be admitted");
        }
        assert!(!limiter.allow(1), "request 6 must be rejected");
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter =
            UserRateLimiter::new(2, Duration::from_millis(100), Duration::from_secs(3600));

        assert!(limiter.allow(1));
        assert!(limiter.allow(1));
        assert!(!limiter.allow(1));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.allow(1), "quota must return after the window slides");
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let limiter = UserRateLimiter::new(1, Duration::from_secs(60), Duration::from_secs(3600));

        assert!(limiter.allow(1));
        assert!(!limiter.allow(1));
        assert!(limiter.allow(2), "a different user has their own window");
    }

    #[tokio::test]
    async fn test_remaining_wait_unknown_user_is_zero() {
        let limiter = UserRateLimiter::new(5, Duration::from_secs(60), Duration::from_secs(3600));
        assert_eq!(limiter.remaining_wait(99), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_remaining_wait_counts_down_from_period() {
        let limiter = UserRateLimiter::new(1, Duration::from_secs(60), Duration::from_secs(3600));
        limiter.allow(1);

        let wait = limiter.remaining_wait(1);
        assert!(wait > Duration::from_secs(59));
        assert!(wait <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_purge_idle_removes_stale_users() {
        let limiter =
            UserRateLimiter::new(5, Duration::from_secs(60), Duration::from_millis(50));

        limiter.allow(1);
        limiter.allow(2);
        assert_eq!(limiter.active_users(), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let purged = limiter.purge_idle();
        assert_eq!(purged, 2);
        assert_eq!(limiter.active_users(), 0);
    }

    #[tokio::test]
    async fn test_purge_keeps_recently_active_users() {
        let limiter =
            UserRateLimiter::new(5, Duration::from_secs(60), Duration::from_secs(3600));

        limiter.allow(1);
        assert_eq!(limiter.purge_idle(), 0);
        assert_eq!(limiter.active_users(), 1);
    }

    #[tokio::test]
    async fn test_zero_limit_rejects_everything() {
        let limiter = UserRateLimiter::new(0, Duration::from_secs(60), Duration::from_secs(3600));
        assert!(!limiter.allow(1));
    }

    #[tokio::test]
    async fn test_sweeper_runs_in_background() {
        let limiter = Arc::new(UserRateLimiter::new(
            5,
            Duration::from_secs(60),
            Duration::from_millis(20),
        ));
        limiter.allow(7);

        let handle = limiter.spawn_sweeper(Duration::from_millis(40));
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.abort();

        assert_eq!(limiter.active_users(), 0, "sweeper must purge idle users");
    }

    #[tokio::test]
    async fn test_concurrent_users_do_not_interfere() {
        let limiter = Arc::new(UserRateLimiter::new(
            3,
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));

        let mut handles = Vec::new();
        for user in 0..20u64 {
            let l = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { l.allow(user) }));
        }

        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap_or(false) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 20, "each user gets their own quota");
    }
}

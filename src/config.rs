//! Declarative dispatcher configuration.
//!
//! Parsed from TOML with serde; every field has a documented default so an
//! empty file (or [`DispatchConfig::default`]) yields a working local setup.
//! Semantic constraints are checked by [`DispatchConfig::validate`] before a
//! config is accepted.

use crate::DispatchError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::RequestKind;

// ── Default value functions ──────────────────────────────────────────────

fn default_queue_capacity() -> usize {
    1000
}

fn default_min_workers() -> usize {
    2
}

fn default_max_workers() -> usize {
    20
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    30
}

fn default_half_open_requests() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    10_000
}

fn default_max_concurrent_calls() -> usize {
    15
}

fn default_cache_max_entries() -> usize {
    500
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_calls_limit() -> usize {
    5
}

fn default_rate_period_secs() -> u64 {
    60
}

fn default_user_ttl_secs() -> u64 {
    3600
}

fn default_oauth_secs() -> u64 {
    10
}

fn default_chat_secs() -> u64 {
    45
}

fn default_vision_secs() -> u64 {
    90
}

fn default_file_secs() -> u64 {
    60
}

fn default_dispatch_secs() -> u64 {
    90
}

fn default_drain_secs() -> u64 {
    30
}

fn default_max_context_messages() -> usize {
    20
}

fn default_min_question_chars() -> usize {
    2
}

fn default_max_question_chars() -> usize {
    10_000
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

// ── Sections ─────────────────────────────────────────────────────────────

/// Admission queue and worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Maximum queued requests; admission rejects at 95% of this.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Workers started at boot and kept alive when idle.
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Upper bound the autoscaler may grow the pool to.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
        }
    }
}

/// Circuit breaker, retry and per-backend concurrency settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResilienceConfig {
    /// Consecutive-ish failures before a breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open breaker blocks before probing recovery.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Trial calls admitted while half-open; the same count of successes
    /// closes the breaker.
    #[serde(default = "default_half_open_requests")]
    pub half_open_requests: u32,
    /// Retries after the first attempt (total attempts = max_retries + 1).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Backoff ceiling.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Total in-flight upstream calls, split evenly across backends.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_requests: default_half_open_requests(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            max_concurrent_calls: default_max_concurrent_calls(),
        }
    }
}

impl ResilienceConfig {
    /// Recovery timeout as a [`Duration`].
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    /// Base retry delay as a [`Duration`].
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    /// Maximum retry delay as a [`Duration`].
    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

/// Response cache sizing and expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Entries held before oldest-first eviction kicks in.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// Entry lifetime; older entries are treated as absent.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Interval of the background expired-entry sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Redis connection URL for the shared cache backend
    /// (only read when the `shared-cache` feature is enabled).
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            redis_url: None,
        }
    }
}

impl CacheConfig {
    /// Entry TTL as a [`Duration`].
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Per-user sliding-window rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Requests a single user may make per window.
    #[serde(default = "default_calls_limit")]
    pub calls_limit: usize,
    /// Window length in seconds.
    #[serde(default = "default_rate_period_secs")]
    pub period_secs: u64,
    /// Idle time after which a user's window record is purged.
    #[serde(default = "default_user_ttl_secs")]
    pub user_ttl_secs: u64,
    /// Interval of the background idle-user sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls_limit: default_calls_limit(),
            period_secs: default_rate_period_secs(),
            user_ttl_secs: default_user_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl RateLimitConfig {
    /// Window length as a [`Duration`].
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    /// Idle TTL as a [`Duration`].
    pub fn user_ttl(&self) -> Duration {
        Duration::from_secs(self.user_ttl_secs)
    }

    /// Sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Differentiated timeout floors.
///
/// Quick metadata operations (OAuth) get a short deadline; heavy content
/// (vision) gets a long one. The dispatcher's overall deadline is independent
/// and wins when shorter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutConfig {
    /// Token-fetch and other auth round-trips.
    #[serde(default = "default_oauth_secs")]
    pub oauth_secs: u64,
    /// Plain chat completions.
    #[serde(default = "default_chat_secs")]
    pub chat_secs: u64,
    /// Image-understanding requests.
    #[serde(default = "default_vision_secs")]
    pub vision_secs: u64,
    /// Document-understanding requests.
    #[serde(default = "default_file_secs")]
    pub file_secs: u64,
    /// Overall deadline for one progressive dispatch across all backends.
    #[serde(default = "default_dispatch_secs")]
    pub dispatch_secs: u64,
    /// How long shutdown waits for in-flight work before giving up.
    #[serde(default = "default_drain_secs")]
    pub drain_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            oauth_secs: default_oauth_secs(),
            chat_secs: default_chat_secs(),
            vision_secs: default_vision_secs(),
            file_secs: default_file_secs(),
            dispatch_secs: default_dispatch_secs(),
            drain_secs: default_drain_secs(),
        }
    }
}

impl TimeoutConfig {
    /// Per-backend timeout floor for a request kind.
    pub fn for_kind(&self, kind: RequestKind) -> Duration {
        let secs = match kind {
            RequestKind::Text => self.chat_secs,
            RequestKind::File => self.file_secs,
            RequestKind::Image => self.vision_secs,
        };
        Duration::from_secs(secs)
    }

    /// OAuth deadline as a [`Duration`].
    pub fn oauth(&self) -> Duration {
        Duration::from_secs(self.oauth_secs)
    }

    /// Overall dispatch deadline as a [`Duration`].
    pub fn dispatch(&self) -> Duration {
        Duration::from_secs(self.dispatch_secs)
    }

    /// Drain deadline as a [`Duration`].
    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }
}

/// Priority tier membership.
///
/// Users listed nowhere are free tier. Admission priority is
/// admin < premium < free (lower dequeues first).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TierConfig {
    /// User IDs dispatched ahead of everyone else.
    #[serde(default)]
    pub admin_users: Vec<u64>,
    /// User IDs dispatched ahead of the free tier.
    #[serde(default)]
    pub premium_users: Vec<u64>,
}

/// Input validation bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputConfig {
    /// Shortest accepted question, in characters.
    #[serde(default = "default_min_question_chars")]
    pub min_question_chars: usize,
    /// Longest accepted question, in characters.
    #[serde(default = "default_max_question_chars")]
    pub max_question_chars: usize,
    /// Most conversation messages passed to a backend as context.
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            min_question_chars: default_min_question_chars(),
            max_question_chars: default_max_question_chars(),
            max_context_messages: default_max_context_messages(),
        }
    }
}

/// Observability endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservabilityConfig {
    /// Bind address for the metrics/health HTTP server.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a dispatcher instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    /// Admission queue and worker pool sizing.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Breaker, retry and concurrency settings.
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Response cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Per-user rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Timeout floors.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Priority tier membership.
    #[serde(default)]
    pub tiers: TierConfig,
    /// Input validation bounds.
    #[serde(default)]
    pub input: InputConfig,
    /// Observability endpoint settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl DispatchConfig {
    /// Parse a configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Config`] on parse failure or when a semantic
    /// constraint is violated.
    pub fn from_toml(input: &str) -> Result<Self, DispatchError> {
        let config: Self =
            toml::from_str(input).map_err(|e| DispatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Config`] when the file cannot be read, parsed
    /// or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DispatchError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            DispatchError::Config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_toml(&raw)
    }

    /// Check semantic constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Config`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.queue.capacity == 0 {
            return Err(DispatchError::Config("queue.capacity must be > 0".into()));
        }
        if self.queue.min_workers == 0 {
            return Err(DispatchError::Config("queue.min_workers must be > 0".into()));
        }
        if self.queue.max_workers < self.queue.min_workers {
            return Err(DispatchError::Config(
                "queue.max_workers must be >= queue.min_workers".into(),
            ));
        }
        if self.resilience.failure_threshold == 0 {
            return Err(DispatchError::Config(
                "resilience.failure_threshold must be > 0".into(),
            ));
        }
        if self.resilience.half_open_requests == 0 {
            return Err(DispatchError::Config(
                "resilience.half_open_requests must be > 0".into(),
            ));
        }
        if self.resilience.max_concurrent_calls == 0 {
            return Err(DispatchError::Config(
                "resilience.max_concurrent_calls must be > 0".into(),
            ));
        }
        if self.resilience.retry_base_ms == 0 {
            return Err(DispatchError::Config(
                "resilience.retry_base_ms must be > 0".into(),
            ));
        }
        if self.resilience.retry_max_ms < self.resilience.retry_base_ms {
            return Err(DispatchError::Config(
                "resilience.retry_max_ms must be >= retry_base_ms".into(),
            ));
        }
        if self.rate_limit.calls_limit == 0 {
            return Err(DispatchError::Config(
                "rate_limit.calls_limit must be > 0".into(),
            ));
        }
        if self.rate_limit.period_secs == 0 {
            return Err(DispatchError::Config(
                "rate_limit.period_secs must be > 0".into(),
            ));
        }
        if self.cache.ttl_secs == 0 {
            return Err(DispatchError::Config("cache.ttl_secs must be > 0".into()));
        }
        if self.input.min_question_chars > self.input.max_question_chars {
            return Err(DispatchError::Config(
                "input.min_question_chars must be <= max_question_chars".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DispatchConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = DispatchConfig::from_toml("").unwrap();
        assert_eq!(config, DispatchConfig::default());
        assert_eq!(config.queue.capacity, 1000);
        assert_eq!(config.queue.min_workers, 2);
        assert_eq!(config.queue.max_workers, 20);
        assert_eq!(config.resilience.max_retries, 2);
        assert_eq!(config.rate_limit.calls_limit, 5);
    }

    #[test]
    fn test_partial_toml_overrides_only_named_fields() {
        let config = DispatchConfig::from_toml(
            r#"
[queue]
capacity = 50

[rate_limit]
calls_limit = 3
"#,
        )
        .unwrap();
        assert_eq!(config.queue.capacity, 50);
        assert_eq!(config.queue.min_workers, 2);
        assert_eq!(config.rate_limit.calls_limit, 3);
        assert_eq!(config.rate_limit.period_secs, 60);
    }

    #[test]
    fn test_invalid_toml_returns_config_error() {
        let result = DispatchConfig::from_toml("queue = 3");
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = DispatchConfig::from_toml("[queue]\ncapacity = 0");
        assert!(result.is_err());
    }

    #[test]
    fn test_max_workers_below_min_rejected() {
        let result = DispatchConfig::from_toml("[queue]\nmin_workers = 5\nmax_workers = 2");
        assert!(result.is_err());
    }

    #[test]
    fn test_retry_max_below_base_rejected() {
        let result =
            DispatchConfig::from_toml("[resilience]\nretry_base_ms = 2000\nretry_max_ms = 100");
        assert!(result.is_err());
    }

    #[test]
    fn test_timeout_for_kind() {
        let t = TimeoutConfig::default();
        assert_eq!(t.for_kind(RequestKind::Text), Duration::from_secs(45));
        assert_eq!(t.for_kind(RequestKind::File), Duration::from_secs(60));
        assert_eq!(t.for_kind(RequestKind::Image), Duration::from_secs(90));
    }

    #[test]
    fn test_tier_lists_parse() {
        let config = DispatchConfig::from_toml(
            r#"
[tiers]
admin_users = [1]
premium_users = [10, 11]
"#,
        )
        .unwrap();
        assert_eq!(config.tiers.admin_users, vec![1]);
        assert_eq!(config.tiers.premium_users, vec![10, 11]);
    }

    #[test]
    fn test_load_missing_file_returns_config_error() {
        let result = DispatchConfig::load("/nonexistent/dispatch.toml");
        assert!(matches!(result, Err(DispatchError::Config(_))));
    }

    #[test]
    fn test_config_roundtrips_through_toml() {
        let config = DispatchConfig::default();
        let raw = toml::to_string(&config).unwrap();
        let back = DispatchConfig::from_toml(&raw).unwrap();
        assert_eq!(config, back);
    }
}

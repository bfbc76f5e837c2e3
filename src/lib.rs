//! # fanout-dispatch
//!
//! A resilient dispatch layer that fans a single user question out to several
//! independent, unreliable AI text-generation backends over Tokio.
//!
//! ## Architecture
//!
//! ```text
//! caller → UserRateLimiter → AdmissionQueue (priority + backpressure)
//!        → worker → Dispatcher → per-backend:
//!            CircuitBreaker gate → ConcurrencyLimiter → RetryPolicy(HTTP)
//!        → ResponseCache → ResponseSink
//! ```
//!
//! Every backend fails independently: one slow or broken upstream never fails
//! the overall dispatch. Overload is shed at admission time, never mid-flight.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod backend;
pub mod cache;
pub mod caller;
pub mod config;
pub mod context;
pub mod core;
pub mod dispatcher;
pub mod metrics;
pub mod queue;
pub mod resilience;
pub mod shutdown;
pub mod validate;

#[cfg(feature = "observability-server")]
pub mod observability;

// Re-exports for convenience
pub use backend::{BackendClient, BackendError};
pub use cache::{CacheKey, MemoryCache, ResponseCache};
pub use config::DispatchConfig;
pub use context::{ContextMessage, ContextProvider};
pub use crate::core::DispatchCore;
pub use dispatcher::{Dispatcher, ResponseSink};
pub use queue::{Admission, AdmissionQueue, UserTier};
pub use shutdown::ShutdownCoordinator;

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`DispatchError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), DispatchError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| DispatchError::Other(format!("tracing init failed: {e}")))
}

/// Top-level crate errors.
///
/// Covers construction-time failures: configuration and subsystem
/// initialisation. Runtime dispatch failures use [`BackendError`] and
/// [`AdmissionError`] instead.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// A configuration value is missing or invalid.
    ///
    /// Returned at construction time so that misconfiguration surfaces
    /// immediately rather than at the first dispatch.
    #[error("configuration error: {0}")]
    Config(String),

    /// Metrics registry construction or registration failed.
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Reasons a request is rejected before any backend work begins.
///
/// These are the only failures surfaced to the caller at admission time;
/// everything after admission is reported per-backend inside a [`ResultSet`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdmissionError {
    /// The process is draining for restart; no new work is accepted.
    #[error("server is restarting, try again in a minute")]
    ShuttingDown,

    /// The admission queue is at its backpressure threshold.
    #[error("server is overloaded, try again in a minute")]
    Overloaded,

    /// The per-user sliding-window limit is exhausted.
    #[error("rate limit exceeded, retry in {}s", retry_after.as_secs())]
    RateLimited {
        /// Time until the oldest request leaves the user's window.
        retry_after: Duration,
    },

    /// The question failed input validation.
    #[error("invalid question: {0}")]
    InvalidQuestion(String),
}

/// Kind of work a request carries, used for token budgets, timeout floors
/// and cache keying.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Plain text question.
    #[default]
    Text,
    /// Question about an attached document.
    File,
    /// Question about an attached image.
    Image,
}

impl RequestKind {
    /// Stable string form used in cache keys and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Text => "text",
            RequestKind::File => "file",
            RequestKind::Image => "image",
        }
    }
}

/// Classified failure cause carried inside a failed [`BackendResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The backend's circuit breaker was open; no call was attempted.
    CircuitOpen,
    /// The per-backend or overall deadline fired.
    Timeout,
    /// Upstream returned HTTP 429 and retries were exhausted.
    RateLimited,
    /// Upstream returned a non-retryable 4xx.
    ClientError,
    /// Upstream returned 5xx and retries were exhausted.
    ServerError,
    /// Connection-level failure (DNS, reset, refused).
    Network,
    /// Authentication with the upstream failed.
    Auth,
    /// The upstream answered but the body could not be decoded.
    Parse,
}

impl ErrorKind {
    /// Stable label used in metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ClientError => "client_error",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Network => "network",
            ErrorKind::Auth => "auth",
            ErrorKind::Parse => "parse",
        }
    }
}

/// Outcome of one backend call. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendResult {
    /// Name of the backend that produced this result.
    pub backend: String,
    /// Whether the call produced usable text.
    pub success: bool,
    /// Generated text; empty on failure.
    pub text: String,
    /// Human-readable error description on failure.
    pub error: Option<String>,
    /// Classified failure cause on failure.
    pub error_kind: Option<ErrorKind>,
    /// Wall-clock time spent on this backend, zero for circuit-open
    /// synthetic failures.
    pub latency: Duration,
}

impl BackendResult {
    /// Successful result carrying generated text.
    pub fn ok(backend: impl Into<String>, text: impl Into<String>, latency: Duration) -> Self {
        Self {
            backend: backend.into(),
            success: true,
            text: text.into(),
            error: None,
            error_kind: None,
            latency,
        }
    }

    /// Failed result carrying a classified error.
    pub fn err(
        backend: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            backend: backend.into(),
            success: false,
            text: String::new(),
            error: Some(message.into()),
            error_kind: Some(kind),
            latency,
        }
    }
}

/// Aggregated outcome of one dispatch across all configured backends.
///
/// Always carries one entry per backend, in the configured backend order
/// regardless of completion order. Cached and returned as a unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultSet {
    /// Per-backend outcomes in configured order.
    pub results: Vec<BackendResult>,
    /// True when the overall dispatch deadline fired before every backend
    /// finished; unfinished backends are recorded as timeout failures.
    pub partial: bool,
}

impl ResultSet {
    /// Number of backends that returned usable text.
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    /// Total number of backend outcomes carried.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether the set carries no outcomes at all.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

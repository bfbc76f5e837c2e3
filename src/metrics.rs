//! Prometheus metrics for the dispatch core.
//!
//! Call [`init_metrics`] once at process startup. All helper functions are
//! no-ops if it was never called, so every component is safe to run without
//! observability — it simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `dispatch_requests_total` | Counter | `backend` |
//! | `dispatch_requests_success_total` | Counter | `backend` |
//! | `dispatch_requests_failed_total` | Counter | `backend`, `error_kind` |
//! | `dispatch_request_latency_seconds` | Histogram | `backend` |
//! | `dispatch_retries_total` | Counter | |
//! | `dispatch_queue_overflows_total` | Counter | |
//! | `dispatch_queue_size` | Gauge | |
//! | `dispatch_active_workers` | Gauge | |
//! | `dispatch_active_requests` | Gauge | |
//! | `dispatch_circuit_state` | Gauge (0=closed 1=half_open 2=open) | `backend` |

use crate::DispatchError;
use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

/// Latency histogram bucket boundaries in seconds.
pub const LATENCY_BUCKETS: [f64; 9] = [0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// All metrics, bundled so they can live in one [`OnceLock`].
pub struct Metrics {
    /// Registry owning every descriptor below.
    pub registry: Registry,
    /// Calls attempted per backend (including failures).
    pub requests_total: CounterVec,
    /// Successful calls per backend.
    pub requests_success: CounterVec,
    /// Failed calls per backend and error kind.
    pub requests_failed: CounterVec,
    /// Call latency per backend.
    pub request_latency: HistogramVec,
    /// Retries performed across all backends.
    pub retries_total: IntCounter,
    /// Admissions rejected by backpressure.
    pub queue_overflows: IntCounter,
    /// Current admission queue depth.
    pub queue_size: IntGauge,
    /// Live worker count.
    pub active_workers: IntGauge,
    /// Requests currently being dispatched.
    pub active_requests: IntGauge,
    /// Breaker state per backend (0=closed, 1=half_open, 2=open).
    pub circuit_state: IntGaugeVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C: Collector + Clone + 'static>(
    registry: &Registry,
    collector: C,
) -> Result<C, DispatchError> {
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| DispatchError::Metrics(format!("registration failed: {e}")))?;
    Ok(collector)
}

/// Initialise all metrics in a private registry.
///
/// Must be called once before dispatch starts. A second call is a no-op.
///
/// # Errors
///
/// Returns [`DispatchError::Metrics`] if descriptor construction or
/// registration fails.
pub fn init_metrics() -> Result<(), DispatchError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();
    let err = |e| DispatchError::Metrics(format!("metrics init failed: {e}"));

    let requests_total = register(
        &registry,
        CounterVec::new(
            Opts::new("dispatch_requests_total", "Backend calls attempted"),
            &["backend"],
        )
        .map_err(err)?,
    )?;

    let requests_success = register(
        &registry,
        CounterVec::new(
            Opts::new("dispatch_requests_success_total", "Successful backend calls"),
            &["backend"],
        )
        .map_err(err)?,
    )?;

    let requests_failed = register(
        &registry,
        CounterVec::new(
            Opts::new("dispatch_requests_failed_total", "Failed backend calls"),
            &["backend", "error_kind"],
        )
        .map_err(err)?,
    )?;

    let request_latency = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new("dispatch_request_latency_seconds", "Backend call latency")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["backend"],
        )
        .map_err(err)?,
    )?;

    let retries_total = register(
        &registry,
        IntCounter::new("dispatch_retries_total", "Retries across all backends").map_err(err)?,
    )?;

    let queue_overflows = register(
        &registry,
        IntCounter::new(
            "dispatch_queue_overflows_total",
            "Admissions rejected by backpressure",
        )
        .map_err(err)?,
    )?;

    let queue_size = register(
        &registry,
        IntGauge::new("dispatch_queue_size", "Current admission queue depth").map_err(err)?,
    )?;

    let active_workers = register(
        &registry,
        IntGauge::new("dispatch_active_workers", "Live worker count").map_err(err)?,
    )?;

    let active_requests = register(
        &registry,
        IntGauge::new("dispatch_active_requests", "Requests being dispatched").map_err(err)?,
    )?;

    let circuit_state = register(
        &registry,
        IntGaugeVec::new(
            Opts::new(
                "dispatch_circuit_state",
                "Circuit state (0=closed, 1=half_open, 2=open)",
            ),
            &["backend"],
        )
        .map_err(err)?,
    )?;

    // If another thread raced us the first one wins; both bundles carry
    // identical descriptors, so neither outcome is incorrect.
    let _ = METRICS.set(Metrics {
        registry,
        requests_total,
        requests_success,
        requests_failed,
        request_latency,
        retries_total,
        queue_overflows,
        queue_size,
        active_workers,
        active_requests,
        circuit_state,
    });

    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Record one backend call outcome with its latency.
///
/// No-op if metrics have not been initialised.
pub fn record_backend_call(backend: &str, success: bool, latency: Duration, error_kind: &str) {
    let Some(m) = metrics() else { return };
    if let Ok(c) = m.requests_total.get_metric_with_label_values(&[backend]) {
        c.inc();
    }
    if success {
        if let Ok(c) = m.requests_success.get_metric_with_label_values(&[backend]) {
            c.inc();
        }
    } else if let Ok(c) = m
        .requests_failed
        .get_metric_with_label_values(&[backend, error_kind])
    {
        c.inc();
    }
    if let Ok(h) = m.request_latency.get_metric_with_label_values(&[backend]) {
        h.observe(latency.as_secs_f64());
    }
}

/// Count one retry. No-op before [`init_metrics`].
pub fn inc_retry() {
    if let Some(m) = metrics() {
        m.retries_total.inc();
    }
}

/// Count one backpressure rejection. No-op before [`init_metrics`].
pub fn inc_queue_overflow() {
    if let Some(m) = metrics() {
        m.queue_overflows.inc();
    }
}

/// Set the queue-depth gauge. No-op before [`init_metrics`].
pub fn set_queue_size(depth: i64) {
    if let Some(m) = metrics() {
        m.queue_size.set(depth);
    }
}

/// Set the live-worker gauge. No-op before [`init_metrics`].
pub fn set_active_workers(count: i64) {
    if let Some(m) = metrics() {
        m.active_workers.set(count);
    }
}

/// Set the in-dispatch request gauge. No-op before [`init_metrics`].
pub fn set_active_requests(count: i64) {
    if let Some(m) = metrics() {
        m.active_requests.set(count);
    }
}

/// Set a backend's breaker-state gauge. No-op before [`init_metrics`].
pub fn set_circuit_state(backend: &str, state: i64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.circuit_state.get_metric_with_label_values(&[backend]) {
            g.set(state);
        }
    }
}

/// Gather and encode all metrics in the Prometheus text format.
///
/// Returns an empty string before [`init_metrics`] or on encoding failure.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Structured snapshot of the per-backend counters, for the status endpoint.
#[derive(Debug, Default)]
pub struct MetricsSummary {
    /// Calls attempted keyed by backend.
    pub requests_total: HashMap<String, u64>,
    /// Successful calls keyed by backend.
    pub requests_success: HashMap<String, u64>,
    /// Retries across all backends.
    pub retries_total: u64,
    /// Backpressure rejections.
    pub queue_overflows: u64,
}

/// Current counter values, zeroed before [`init_metrics`].
pub fn summary() -> MetricsSummary {
    let Some(m) = metrics() else {
        return MetricsSummary::default();
    };

    let mut out = MetricsSummary {
        retries_total: m.retries_total.get(),
        queue_overflows: m.queue_overflows.get(),
        ..MetricsSummary::default()
    };

    for family in m.requests_total.collect() {
        for metric in family.get_metric() {
            let backend = metric
                .get_label()
                .iter()
                .find(|l| l.get_name() == "backend")
                .map_or("unknown", |l| l.get_value());
            out.requests_total
                .insert(backend.to_string(), metric.get_counter().get_value() as u64);
        }
    }
    for family in m.requests_success.collect() {
        for metric in family.get_metric() {
            let backend = metric
                .get_label()
                .iter()
                .find(|l| l.get_name() == "backend")
                .map_or("unknown", |l| l.get_value());
            out.requests_success
                .insert(backend.to_string(), metric.get_counter().get_value() as u64);
        }
    }

    out
}

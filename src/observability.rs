//! Observability HTTP endpoints (feature `observability-server`).
//!
//! Exposes the pull-based monitoring surface:
//!
//! - `GET /metrics` — Prometheus text exposition
//! - `GET /health` — liveness (200 while the process runs)
//! - `GET /ready` — readiness (503 during startup and shutdown drain)
//! - `GET /status` — JSON summary of queue, breakers and counters
//!
//! ## Scraping with Prometheus
//!
//! ```yaml
//! scrape_configs:
//!   - job_name: 'dispatch'
//!     static_configs:
//!       - targets: ['localhost:8080']
//! ```

use crate::metrics;
use crate::queue::AdmissionQueue;
use crate::shutdown::ShutdownCoordinator;
use crate::DispatchError;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state behind the probe endpoints.
pub struct ObservabilityState {
    /// Readiness/liveness source.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Queue statistics source.
    pub queue: Arc<AdmissionQueue>,
}

/// Build the observability router.
pub fn router(state: Arc<ObservabilityState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve the observability endpoints until the process exits.
///
/// # Errors
///
/// Returns [`DispatchError::Other`] when the address cannot be bound or the
/// server fails.
pub async fn start_server(
    addr: &str,
    state: Arc<ObservabilityState>,
) -> Result<(), DispatchError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| DispatchError::Other(format!("cannot bind {addr}: {e}")))?;
    info!(addr, "observability server listening");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| DispatchError::Other(format!("observability server failed: {e}")))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

async fn health_handler(State(state): State<Arc<ObservabilityState>>) -> impl IntoResponse {
    if state.shutdown.is_alive() {
        (StatusCode::OK, "alive")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "dead")
    }
}

async fn ready_handler(State(state): State<Arc<ObservabilityState>>) -> impl IntoResponse {
    if state.shutdown.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn status_handler(State(state): State<Arc<ObservabilityState>>) -> impl IntoResponse {
    let queue = state.queue.stats().await;
    let counters = metrics::summary();

    Json(serde_json::json!({
        "ready": state.shutdown.is_ready(),
        "shutting_down": state.shutdown.is_shutting_down(),
        "active_requests": state.shutdown.active_requests(),
        "queue": {
            "size": queue.size,
            "capacity": queue.capacity,
            "utilization_percent": queue.utilization_percent,
            "active_workers": queue.active_workers,
        },
        "requests_total": counters.requests_total,
        "requests_success": counters.requests_success,
        "retries_total": counters.retries_total,
        "queue_overflows": counters.queue_overflows,
    }))
}

//! Fan-out dispatch across all configured backends.
//!
//! Two modes:
//! - **gather**: wait for every backend, return the full [`ResultSet`]
//! - **progressive**: as-completed with one overall deadline; a progress
//!   event fires per finished backend, stragglers are cancelled at the
//!   deadline and recorded as timeout failures
//!
//! Either way the final set preserves the configured backend order, one
//! backend's failure never fails the dispatch, and results flow through the
//! response cache keyed by question + conversation fingerprint.

use crate::cache::{context_fingerprint, CacheKey, ResponseCache};
use crate::caller::BackendCaller;
use crate::context::ContextMessage;
use crate::{BackendResult, ErrorKind, RequestKind, ResultSet};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// One fully-resolved request, ready for fan-out.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// The user's question.
    pub question: String,
    /// Work kind, for token budgets and timeout floors.
    pub kind: RequestKind,
    /// Correlation ID threaded through logs and results.
    pub request_id: String,
    /// Recent conversation, oldest first.
    pub context: Vec<ContextMessage>,
    /// Fingerprint of an attached document, if any.
    pub file_fingerprint: Option<String>,
    /// Fingerprint of an attached image, if any.
    pub image_fingerprint: Option<String>,
    /// Skip the cache read (still fills the cache afterwards).
    pub force_refresh: bool,
}

impl DispatchRequest {
    /// A plain text request with no context or attachments.
    pub fn new(question: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            kind: RequestKind::Text,
            request_id: request_id.into(),
            context: Vec::new(),
            file_fingerprint: None,
            image_fingerprint: None,
            force_refresh: false,
        }
    }

    /// Attach conversation context.
    pub fn with_context(mut self, context: Vec<ContextMessage>) -> Self {
        self.context = context;
        self
    }

    /// Set the request kind.
    pub fn with_kind(mut self, kind: RequestKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Event emitted when one backend finishes during a progressive dispatch.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Backend that just finished.
    pub backend: String,
    /// Whether it succeeded.
    pub success: bool,
    /// Backends finished so far, this one included.
    pub completed: usize,
    /// Backends in this dispatch.
    pub total: usize,
    /// Time since the dispatch started.
    pub elapsed: Duration,
}

/// Receives per-backend completion events during a progressive dispatch.
#[async_trait]
pub trait ProgressObserver: Send + Sync {
    /// Called once per finished backend, in completion order.
    async fn on_progress(&self, update: ProgressUpdate);
}

/// Delivery seam toward the chat front-end.
///
/// The worker pushes progress events and the final result set here; what
/// happens next (message edits, files, formatting) is the front-end's
/// business.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// A backend finished for one of this user's requests.
    async fn on_progress(&self, user_id: u64, update: ProgressUpdate);

    /// The dispatch finished; deliver the aggregate outcome.
    async fn deliver(&self, user_id: u64, request_id: &str, results: ResultSet);
}

/// Fans one request out to every backend concurrently.
pub struct Dispatcher {
    callers: Vec<Arc<BackendCaller>>,
    cache: Arc<dyn ResponseCache>,
    overall_timeout: Duration,
}

impl Dispatcher {
    /// Build a dispatcher over `callers` in their configured priority order.
    pub fn new(
        callers: Vec<Arc<BackendCaller>>,
        cache: Arc<dyn ResponseCache>,
        overall_timeout: Duration,
    ) -> Self {
        Self {
            callers,
            cache,
            overall_timeout,
        }
    }

    /// The callers, in configured order.
    pub fn callers(&self) -> &[Arc<BackendCaller>] {
        &self.callers
    }

    fn cache_key(&self, req: &DispatchRequest) -> CacheKey {
        let ctx_fp = context_fingerprint(&req.context);
        CacheKey::new(
            &req.question,
            req.kind,
            req.file_fingerprint.as_deref(),
            req.image_fingerprint.as_deref(),
            ctx_fp.as_deref(),
        )
    }

    /// Gather mode: wait for every backend.
    pub async fn query_all(&self, req: &DispatchRequest) -> ResultSet {
        self.dispatch(req, None, false).await
    }

    /// Progressive mode: as-completed with the overall deadline, emitting a
    /// progress event per finished backend.
    pub async fn query_all_with_progress(
        &self,
        req: &DispatchRequest,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> ResultSet {
        self.dispatch(req, observer, true).await
    }

    async fn dispatch(
        &self,
        req: &DispatchRequest,
        observer: Option<Arc<dyn ProgressObserver>>,
        progressive: bool,
    ) -> ResultSet {
        let key = self.cache_key(req);

        if !req.force_refresh {
            if let Some(hit) = self.cache.get(&key).await {
                info!(request_id = %req.request_id, "serving cached result set");
                return hit;
            }
        }

        let set = if progressive {
            self.run_progressive(req, observer).await
        } else {
            self.run_gather(req).await
        };

        // A partial set would pin timeout failures into the cache for the
        // whole TTL; only complete sets are worth remembering.
        if !set.partial {
            self.cache.set(&key, set.clone()).await;
        }
        set
    }

    fn spawn_calls(&self, req: &DispatchRequest) -> JoinSet<BackendResult> {
        let shared = Arc::new(req.clone());
        let mut set = JoinSet::new();
        for caller in &self.callers {
            let caller = Arc::clone(caller);
            let req = Arc::clone(&shared);
            set.spawn(async move {
                caller
                    .call(&req.question, &req.context, req.kind, &req.request_id)
                    .await
            });
        }
        set
    }

    /// Re-order completion-ordered results into configured backend order,
    /// synthesizing a timeout failure for any backend that never finished.
    fn finalize(&self, mut collected: Vec<BackendResult>, partial: bool) -> ResultSet {
        let order: HashMap<&str, usize> = self
            .callers
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name(), i))
            .collect();

        for caller in &self.callers {
            if !collected.iter().any(|r| r.backend == caller.name()) {
                collected.push(BackendResult::err(
                    caller.name(),
                    ErrorKind::Timeout,
                    "no response before the overall deadline",
                    self.overall_timeout,
                ));
            }
        }

        collected.sort_by_key(|r| order.get(r.backend.as_str()).copied().unwrap_or(usize::MAX));
        ResultSet {
            results: collected,
            partial,
        }
    }

    async fn run_gather(&self, req: &DispatchRequest) -> ResultSet {
        let mut set = self.spawn_calls(req);
        let mut collected = Vec::with_capacity(self.callers.len());

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => collected.push(result),
                Err(e) => warn!(request_id = %req.request_id, error = %e, "dispatch task failed"),
            }
        }

        let set = self.finalize(collected, false);
        info!(
            request_id = %req.request_id,
            success = set.success_count(),
            total = set.len(),
            "dispatch completed"
        );
        set
    }

    async fn run_progressive(
        &self,
        req: &DispatchRequest,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> ResultSet {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.overall_timeout;
        let total = self.callers.len();
        let mut set = self.spawn_calls(req);
        let mut collected: Vec<BackendResult> = Vec::with_capacity(total);
        let mut partial = false;

        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(result))) => {
                    if let Some(obs) = &observer {
                        obs.on_progress(ProgressUpdate {
                            backend: result.backend.clone(),
                            success: result.success,
                            completed: collected.len() + 1,
                            total,
                            elapsed: started.elapsed(),
                        })
                        .await;
                    }
                    info!(
                        request_id = %req.request_id,
                        backend = %result.backend,
                        completed = collected.len() + 1,
                        total,
                        "backend finished"
                    );
                    collected.push(result);
                }
                Ok(Some(Err(e))) => {
                    warn!(request_id = %req.request_id, error = %e, "dispatch task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    // Deadline fired: cancel stragglers, keep what we have.
                    set.abort_all();
                    partial = true;
                    warn!(
                        request_id = %req.request_id,
                        completed = collected.len(),
                        total,
                        elapsed_secs = started.elapsed().as_secs_f64(),
                        "overall deadline fired, returning partial results"
                    );
                    break;
                }
            }
        }

        let set = self.finalize(collected, partial);
        info!(
            request_id = %req.request_id,
            success = set.success_count(),
            total = set.len(),
            partial = set.partial,
            "dispatch completed"
        );
        set
    }
}

//! Dispatch composition root.
//!
//! Builds every component once from a [`DispatchConfig`], injects them into
//! each other explicitly (no global singletons) and owns their lifecycle:
//! start, admission, shutdown.

use crate::backend::BackendClient;
use crate::cache::{MemoryCache, ResponseCache};
use crate::caller::BackendCaller;
use crate::config::DispatchConfig;
use crate::context::ContextProvider;
use crate::dispatcher::{Dispatcher, ResponseSink};
use crate::metrics;
use crate::queue::{Admission, AdmissionQueue, DispatchJob, UserTier, WorkerDeps};
use crate::resilience::{BreakerSnapshot, UserRateLimiter};
use crate::shutdown::{DrainOutcome, ShutdownCoordinator};
use crate::validate;
use crate::{AdmissionError, DispatchError, RequestKind};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

/// The assembled dispatch core.
///
/// Construct once at startup with [`DispatchCore::builder`], call
/// [`DispatchCore::start`], submit work with [`DispatchCore::submit`], and
/// invoke [`DispatchCore::shutdown`] before process exit.
pub struct DispatchCore {
    config: DispatchConfig,
    queue: Arc<AdmissionQueue>,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<ShutdownCoordinator>,
    rate_limiter: Arc<UserRateLimiter>,
    cache: Arc<dyn ResponseCache>,
    context: Arc<dyn ContextProvider>,
    sink: Arc<dyn ResponseSink>,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
    memory_cache: Option<Arc<MemoryCache>>,
}

/// Step-wise construction of a [`DispatchCore`].
pub struct DispatchCoreBuilder {
    config: DispatchConfig,
    clients: Vec<Arc<dyn BackendClient>>,
    cache: Option<Arc<dyn ResponseCache>>,
    context: Option<Arc<dyn ContextProvider>>,
    sink: Option<Arc<dyn ResponseSink>>,
}

impl DispatchCoreBuilder {
    /// Add one backend; order here is the stable result order.
    pub fn backend(mut self, client: Arc<dyn BackendClient>) -> Self {
        self.clients.push(client);
        self
    }

    /// Use a custom cache implementation instead of the in-memory default.
    pub fn cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the conversation-context collaborator.
    pub fn context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context = Some(provider);
        self
    }

    /// Set the result delivery seam.
    pub fn sink(mut self, sink: Arc<dyn ResponseSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Assemble the core.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Config`] when no backend or no sink was
    /// provided, or when the configuration fails validation.
    pub fn build(self) -> Result<DispatchCore, DispatchError> {
        self.config.validate()?;
        if self.clients.is_empty() {
            return Err(DispatchError::Config("at least one backend required".into()));
        }
        let sink = self
            .sink
            .ok_or_else(|| DispatchError::Config("a response sink is required".into()))?;
        let context = self
            .context
            .unwrap_or_else(|| Arc::new(crate::context::NoContext));

        let config = self.config;

        let mut memory_cache = None;
        let cache: Arc<dyn ResponseCache> = match self.cache {
            Some(cache) => cache,
            None => {
                let mem = Arc::new(MemoryCache::new(config.cache.max_entries, config.cache.ttl()));
                memory_cache = Some(Arc::clone(&mem));
                mem
            }
        };

        // Split the global concurrency budget evenly across backends.
        let per_backend = (config.resilience.max_concurrent_calls / self.clients.len()).max(1);
        let callers: Vec<Arc<BackendCaller>> = self
            .clients
            .into_iter()
            .map(|client| {
                Arc::new(BackendCaller::new(
                    client,
                    &config.resilience,
                    config.timeouts.clone(),
                    per_backend,
                ))
            })
            .collect();

        let dispatcher = Arc::new(Dispatcher::new(
            callers,
            Arc::clone(&cache),
            config.timeouts.dispatch(),
        ));

        let shutdown = Arc::new(ShutdownCoordinator::new(config.timeouts.drain()));
        let queue = Arc::new(AdmissionQueue::new(&config.queue, Arc::clone(&shutdown)));
        let rate_limiter = Arc::new(UserRateLimiter::new(
            config.rate_limit.calls_limit,
            config.rate_limit.period(),
            config.rate_limit.user_ttl(),
        ));

        Ok(DispatchCore {
            config,
            queue,
            dispatcher,
            shutdown,
            rate_limiter,
            cache,
            context,
            sink,
            sweepers: Mutex::new(Vec::new()),
            memory_cache,
        })
    }
}

impl DispatchCore {
    /// Start building a core from a validated configuration.
    pub fn builder(config: DispatchConfig) -> DispatchCoreBuilder {
        DispatchCoreBuilder {
            config,
            clients: Vec::new(),
            cache: None,
            context: None,
            sink: None,
        }
    }

    /// Initialise metrics, spawn workers and sweep tasks, flip readiness.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Metrics`] if metric registration fails.
    pub async fn start(&self) -> Result<(), DispatchError> {
        metrics::init_metrics()?;

        self.queue
            .start(WorkerDeps {
                dispatcher: Arc::clone(&self.dispatcher),
                context: Arc::clone(&self.context),
                sink: Arc::clone(&self.sink),
                max_context_messages: self.config.input.max_context_messages,
            })
            .await;

        let mut sweepers = self.sweepers.lock().await;
        sweepers.push(
            self.rate_limiter
                .spawn_sweeper(self.config.rate_limit.sweep_interval()),
        );
        if let Some(mem) = &self.memory_cache {
            sweepers.push(mem.spawn_sweeper(self.config.cache.sweep_interval()));
        }

        self.shutdown.set_ready(true);
        info!("dispatch core started");
        Ok(())
    }

    /// Admit one user question.
    ///
    /// Applies, in order: the per-user rate limit, input validation, tier
    /// classification, then queue admission with backpressure.
    ///
    /// # Errors
    ///
    /// Any [`AdmissionError`]; no backend work has started when it returns.
    pub async fn submit(
        &self,
        user_id: u64,
        question: &str,
        kind: RequestKind,
    ) -> Result<Admission, AdmissionError> {
        self.submit_with_correlation(user_id, question, kind, uuid::Uuid::new_v4().to_string())
            .await
    }

    /// [`DispatchCore::submit`] with a caller-supplied correlation ID.
    ///
    /// # Errors
    ///
    /// Any [`AdmissionError`]; no backend work has started when it returns.
    pub async fn submit_with_correlation(
        &self,
        user_id: u64,
        question: &str,
        kind: RequestKind,
        correlation_id: impl Into<String>,
    ) -> Result<Admission, AdmissionError> {
        if !self.rate_limiter.allow(user_id) {
            return Err(AdmissionError::RateLimited {
                retry_after: self.rate_limiter.remaining_wait(user_id),
            });
        }

        let question = validate::sanitize_question(question);
        validate::validate_question(&question, &self.config.input)?;

        let tier = UserTier::classify(user_id, &self.config.tiers);
        let job = DispatchJob {
            user_id,
            question,
            kind,
            request_id: correlation_id.into(),
        };
        self.queue.enqueue(job, tier).await
    }

    /// Readiness for the probe endpoint.
    pub fn is_ready(&self) -> bool {
        self.shutdown.is_ready()
    }

    /// The shutdown coordinator (for probe endpoints and hosts).
    pub fn shutdown_coordinator(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.shutdown)
    }

    /// The admission queue (for the status endpoint).
    pub fn queue(&self) -> Arc<AdmissionQueue> {
        Arc::clone(&self.queue)
    }

    /// Cache statistics.
    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }

    /// Breaker snapshots for every backend, in configured order.
    pub async fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut out = Vec::new();
        for caller in self.dispatcher.callers() {
            out.push(caller.breaker_snapshot().await);
        }
        out
    }

    /// Graceful shutdown: reject new admissions, drain the queue, stop
    /// workers, wait for in-flight dispatches, stop sweepers.
    ///
    /// Must be invoked by the host process before exit. A drain timeout is
    /// reported, not fatal.
    pub async fn shutdown(&self) -> DrainOutcome {
        self.shutdown.begin_shutdown();
        self.queue.stop_workers(self.config.timeouts.drain()).await;
        let outcome = self.shutdown.drain().await;

        let mut sweepers = self.sweepers.lock().await;
        for handle in sweepers.drain(..) {
            handle.abort();
        }

        info!(outcome = ?outcome, "dispatch core stopped");
        outcome
    }
}

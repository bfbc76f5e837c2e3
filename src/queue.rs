//! Priority admission queue with backpressure and an adaptive worker pool.
//!
//! Requests enter through [`AdmissionQueue::enqueue`], which applies
//! backpressure at 95% fill and orders work by `(tier, arrival)` — admin
//! before premium before free, FIFO within a tier. Long-lived workers pop
//! the queue with a short poll timeout so they can observe the stop flag;
//! an autoscaler grows the pool under load. Workers are never killed
//! mid-run: when load drops the autoscaler only logs a scale-down
//! recommendation (retiring idle workers is an orchestrator concern).
//!
//! Backpressure here is the single shedding mechanism — there is no
//! secondary queue behind this one.

use crate::config::{QueueConfig, TierConfig};
use crate::context::ContextProvider;
use crate::dispatcher::{DispatchRequest, Dispatcher, ProgressObserver, ProgressUpdate, ResponseSink};
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;
use crate::validate;
use crate::{AdmissionError, RequestKind};
use async_trait::async_trait;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long a worker waits on an empty queue before re-checking the stop flag.
const WORKER_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Autoscaler evaluation interval.
const AUTOSCALE_INTERVAL: Duration = Duration::from_secs(10);

/// Minimum time between scaling actions.
const SCALE_COOLDOWN: Duration = Duration::from_secs(30);

/// Assumed per-request processing time for the coarse ETA estimate.
const AVG_PROCESSING_SECS: f64 = 6.0;

/// Priority class of a request. Lower value dequeues first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UserTier {
    /// Operators; dispatched ahead of everyone.
    Admin = 0,
    /// Paying users.
    Premium = 1,
    /// Everyone else.
    Free = 2,
}

impl UserTier {
    /// Ordering key: lower dequeues first.
    pub fn priority(self) -> u8 {
        self as u8
    }

    /// Classify a user against the configured tier lists.
    pub fn classify(user_id: u64, tiers: &TierConfig) -> Self {
        if tiers.admin_users.contains(&user_id) {
            UserTier::Admin
        } else if tiers.premium_users.contains(&user_id) {
            UserTier::Premium
        } else {
            UserTier::Free
        }
    }

    /// Tier name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            UserTier::Admin => "admin",
            UserTier::Premium => "premium",
            UserTier::Free => "free",
        }
    }
}

/// Work accepted into the queue; immutable once enqueued and consumed by
/// exactly one worker.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    /// Requesting user.
    pub user_id: u64,
    /// Sanitized question text.
    pub question: String,
    /// Work kind.
    pub kind: RequestKind,
    /// Correlation ID threaded through logs and results.
    pub request_id: String,
}

/// Positive admission outcome returned to the caller.
#[derive(Debug, Clone)]
pub struct Admission {
    /// Coarse queue position estimate (tier-biased, not a simulation).
    pub position: usize,
    /// Coarse wait estimate derived from the position.
    pub eta: Duration,
    /// Human-readable acknowledgment for the caller.
    pub message: String,
}

struct QueuedRequest {
    priority: u8,
    seq: u64,
    submitted_at: Instant,
    job: DispatchJob,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap: make the lowest (priority, seq) the
        // greatest element so it pops first.
        match other.priority.cmp(&self.priority) {
            CmpOrdering::Equal => other.seq.cmp(&self.seq),
            ordering => ordering,
        }
    }
}

/// Everything a worker needs to run one dispatch.
#[derive(Clone)]
pub struct WorkerDeps {
    /// Fan-out dispatcher shared by all workers.
    pub dispatcher: Arc<Dispatcher>,
    /// Conversation-context collaborator.
    pub context: Arc<dyn ContextProvider>,
    /// Delivery seam toward the front-end.
    pub sink: Arc<dyn ResponseSink>,
    /// Cap applied to the context before dispatch.
    pub max_context_messages: usize,
}

/// Bridges per-backend progress events to the response sink for one user.
struct SinkObserver {
    sink: Arc<dyn ResponseSink>,
    user_id: u64,
}

#[async_trait]
impl ProgressObserver for SinkObserver {
    async fn on_progress(&self, update: ProgressUpdate) {
        self.sink.on_progress(self.user_id, update).await;
    }
}

/// Queue statistics for the status endpoint.
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Requests currently queued.
    pub size: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Fill as a percentage of capacity.
    pub utilization_percent: f64,
    /// Workers still running.
    pub active_workers: usize,
}

/// Priority queue plus its worker pool and autoscaler.
pub struct AdmissionQueue {
    capacity: usize,
    min_workers: usize,
    max_workers: usize,
    heap: Mutex<BinaryHeap<QueuedRequest>>,
    seq: AtomicU64,
    notify: Notify,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    autoscaler: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl AdmissionQueue {
    /// Build a queue; call [`AdmissionQueue::start`] to spawn workers.
    pub fn new(config: &QueueConfig, shutdown: Arc<ShutdownCoordinator>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            capacity: config.capacity,
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            stop_tx,
            workers: Mutex::new(Vec::new()),
            autoscaler: Mutex::new(None),
            shutdown,
        }
    }

    /// Requests currently queued.
    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.heap.lock().await.is_empty()
    }

    fn over_fill(&self, size: usize, percent: usize) -> bool {
        size * 100 >= self.capacity * percent
    }

    /// Admit a request, or reject with the reason.
    ///
    /// Rejections are deterministic: shutdown always rejects, and so does a
    /// fill at or above 95% of capacity (counted toward the overflow metric).
    ///
    /// # Errors
    ///
    /// [`AdmissionError::ShuttingDown`] or [`AdmissionError::Overloaded`].
    pub async fn enqueue(
        &self,
        job: DispatchJob,
        tier: UserTier,
    ) -> Result<Admission, AdmissionError> {
        if self.shutdown.is_shutting_down() {
            info!(request_id = %job.request_id, "rejected, shutting down");
            return Err(AdmissionError::ShuttingDown);
        }

        let depth = {
            let mut heap = self.heap.lock().await;
            let size = heap.len();

            if self.over_fill(size, 95) {
                drop(heap);
                metrics::inc_queue_overflow();
                warn!(
                    request_id = %job.request_id,
                    size,
                    capacity = self.capacity,
                    "queue full, rejecting request"
                );
                return Err(AdmissionError::Overloaded);
            }
            if self.over_fill(size, 70) {
                warn!(size, capacity = self.capacity, "queue filling up");
            }

            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            heap.push(QueuedRequest {
                priority: tier.priority(),
                seq,
                submitted_at: Instant::now(),
                job: job.clone(),
            });
            heap.len()
        };

        metrics::set_queue_size(depth as i64);
        self.notify.notify_one();

        let position = Self::estimate_position(tier, depth - 1);
        let eta = self.estimate_eta(position).await;
        let eta_secs = eta.as_secs();
        let message = if position > 10 {
            format!(
                "Request queued. Position: ~{position}. ETA: ~{} min.",
                eta_secs.div_ceil(60)
            )
        } else {
            format!("Request accepted. Position: ~{position}. ETA: ~{eta_secs}s.")
        };

        info!(
            request_id = %job.request_id,
            user_id = job.user_id,
            tier = tier.as_str(),
            position,
            "request queued"
        );

        Ok(Admission {
            position,
            eta,
            message,
        })
    }

    /// Coarse position estimate: admins go first, premium lands in the
    /// first third, free at the back. A heuristic, not a scheduler
    /// simulation.
    fn estimate_position(tier: UserTier, queue_size: usize) -> usize {
        if queue_size == 0 {
            return 1;
        }
        match tier {
            UserTier::Admin => 1,
            UserTier::Premium => (queue_size / 3).max(1),
            UserTier::Free => queue_size.max(1),
        }
    }

    async fn estimate_eta(&self, position: usize) -> Duration {
        let active = {
            let workers = self.workers.lock().await;
            workers.iter().filter(|h| !h.is_finished()).count()
        };
        let active = if active == 0 { self.min_workers } else { active };
        let secs = (position as f64 / active as f64 * AVG_PROCESSING_SECS).ceil() as u64;
        Duration::from_secs(secs.max(1))
    }

    async fn try_pop(&self) -> Option<QueuedRequest> {
        self.heap.lock().await.pop()
    }

    async fn pop_timeout(&self, timeout: Duration) -> Option<QueuedRequest> {
        if let Some(item) = self.try_pop().await {
            return Some(item);
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        self.try_pop().await
    }

    /// Spawn the initial workers and the autoscaler.
    pub async fn start(self: &Arc<Self>, deps: WorkerDeps) {
        self.spawn_workers(self.min_workers, &deps).await;

        let queue = Arc::clone(self);
        let stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            queue.autoscale_loop(deps, stop_rx).await;
        });
        *self.autoscaler.lock().await = Some(handle);

        info!(workers = self.min_workers, "admission queue started");
    }

    async fn spawn_workers(self: &Arc<Self>, count: usize, deps: &WorkerDeps) {
        let mut workers = self.workers.lock().await;
        for _ in 0..count {
            let id = workers.len();
            let queue = Arc::clone(self);
            let deps = deps.clone();
            let stop_rx = self.stop_tx.subscribe();
            workers.push(tokio::spawn(async move {
                queue.worker_loop(id, deps, stop_rx).await;
            }));
        }
        metrics::set_active_workers(workers.len() as i64);
    }

    async fn worker_loop(self: Arc<Self>, id: usize, deps: WorkerDeps, stop_rx: watch::Receiver<bool>) {
        info!(worker = id, "worker started");

        loop {
            if *stop_rx.borrow() {
                break;
            }
            let Some(item) = self.pop_timeout(WORKER_POLL_TIMEOUT).await else {
                continue;
            };

            let job = item.job;
            let waited = item.submitted_at.elapsed();
            info!(
                worker = id,
                request_id = %job.request_id,
                priority = item.priority,
                waited_ms = waited.as_millis() as u64,
                "processing request"
            );

            let _guard = self.shutdown.begin_request();
            metrics::set_queue_size(self.len().await as i64);

            let context = deps.context.context_for(job.user_id).await;
            let context = validate::truncate_context(context, deps.max_context_messages);

            let request = DispatchRequest {
                question: job.question.clone(),
                kind: job.kind,
                request_id: job.request_id.clone(),
                context,
                file_fingerprint: None,
                image_fingerprint: None,
                force_refresh: false,
            };

            let observer: Arc<dyn ProgressObserver> = Arc::new(SinkObserver {
                sink: Arc::clone(&deps.sink),
                user_id: job.user_id,
            });
            let results = deps
                .dispatcher
                .query_all_with_progress(&request, Some(observer))
                .await;

            deps.sink
                .deliver(job.user_id, &job.request_id, results)
                .await;

            info!(worker = id, request_id = %job.request_id, "request completed");
        }

        info!(worker = id, "worker stopped");
    }

    fn target_workers(&self, size: usize, current: usize) -> usize {
        let utilization = size as f64 / self.capacity as f64;
        let target = if utilization > 0.5 {
            self.max_workers
        } else if utilization > 0.3 {
            (current + 2).max(self.min_workers)
        } else if utilization > 0.1 {
            (size / 3 + 2).max(self.min_workers)
        } else if size > 0 {
            (size + 1).max(self.min_workers)
        } else {
            self.min_workers
        };
        target.min(self.max_workers)
    }

    async fn reap_and_count(&self) -> usize {
        let mut workers = self.workers.lock().await;
        workers.retain(|h| !h.is_finished());
        workers.len()
    }

    async fn autoscale_loop(self: Arc<Self>, deps: WorkerDeps, mut stop_rx: watch::Receiver<bool>) {
        let mut last_scale: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(AUTOSCALE_INTERVAL) => {}
                _ = stop_rx.changed() => {}
            }
            if *stop_rx.borrow() {
                break;
            }

            let size = self.len().await;
            let current = self.reap_and_count().await;
            metrics::set_queue_size(size as i64);
            metrics::set_active_workers(current as i64);

            if let Some(t) = last_scale {
                if t.elapsed() < SCALE_COOLDOWN {
                    continue;
                }
            }

            let target = self.target_workers(size, current);
            if current < target {
                self.spawn_workers(target - current, &deps).await;
                info!(
                    from = current,
                    to = target,
                    queue_size = size,
                    "scaled up workers"
                );
                last_scale = Some(Instant::now());
            } else if current > target && size == 0 {
                // Workers are long-lived; actual retirement is left to the
                // process orchestrator.
                info!(current, target, "scale-down recommended");
            }
        }

        info!("autoscaler stopped");
    }

    /// Drain the queue, then stop workers and the autoscaler.
    ///
    /// Waits up to `drain_timeout` for queued requests to be picked up;
    /// whatever is still queued after that is dropped with a warning.
    pub async fn stop_workers(&self, drain_timeout: Duration) {
        let queue_size = self.len().await;
        info!(queue_size, "queue drain starting");
        let started = Instant::now();

        while !self.is_empty().await {
            if started.elapsed() >= drain_timeout {
                let mut heap = self.heap.lock().await;
                let dropped = heap.len();
                heap.clear();
                warn!(dropped, "drain timeout, dropped queued requests");
                break;
            }
            let remaining = self.len().await;
            let elapsed_secs = started.elapsed().as_secs();
            info!(
                remaining,
                elapsed_secs,
                "waiting for queue to drain"
            );
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let _ = self.stop_tx.send(true);
        self.notify.notify_waiters();

        if let Some(handle) = self.autoscaler.lock().await.take() {
            let _ = handle.await;
        }
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
        metrics::set_active_workers(0);
        info!("all workers stopped");
    }

    /// Current statistics.
    pub async fn stats(&self) -> QueueStats {
        let size = self.len().await;
        let active_workers = {
            let workers = self.workers.lock().await;
            workers.iter().filter(|h| !h.is_finished()).count()
        };
        QueueStats {
            size,
            capacity: self.capacity,
            utilization_percent: (size as f64 / self.capacity as f64) * 100.0,
            active_workers,
        }
    }
}

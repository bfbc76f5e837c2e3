//! End-to-end scenarios over the public API: mixed-outcome fan-out,
//! priority ordering, graceful shutdown and backpressure.

use async_trait::async_trait;
use fanout_dispatch::backend::{BackendClient, BackendError, EchoBackend};
use fanout_dispatch::cache::MemoryCache;
use fanout_dispatch::caller::BackendCaller;
use fanout_dispatch::config::{DispatchConfig, ResilienceConfig, TimeoutConfig};
use fanout_dispatch::context::ContextMessage;
use fanout_dispatch::dispatcher::{DispatchRequest, Dispatcher, ProgressUpdate, ResponseSink};
use fanout_dispatch::{AdmissionError, DispatchCore, ErrorKind, RequestKind, ResultSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

// ── Scripted backends ─────────────────────────────────────────────────────

/// Succeeds after a fixed delay.
struct FastBackend {
    name: String,
    delay: Duration,
}

#[async_trait]
impl BackendClient for FastBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        question: &str,
        _context: &[ContextMessage],
        _max_tokens: u32,
    ) -> Result<String, BackendError> {
        tokio::time::sleep(self.delay).await;
        Ok(format!("fast answer: {question}"))
    }
}

/// Never answers within any reasonable deadline.
struct HangingBackend {
    name: String,
}

#[async_trait]
impl BackendClient for HangingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        _question: &str,
        _context: &[ContextMessage],
        _max_tokens: u32,
    ) -> Result<String, BackendError> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok("never".into())
    }
}

/// Returns HTTP 500 a fixed number of times, then succeeds.
struct FlakyBackend {
    name: String,
    failures_before_success: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl BackendClient for FlakyBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        question: &str,
        _context: &[ContextMessage],
        _max_tokens: u32,
    ) -> Result<String, BackendError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures_before_success {
            Err(BackendError::Http {
                status: 500,
                body: "internal error".into(),
            })
        } else {
            Ok(format!("flaky answer: {question}"))
        }
    }
}

// ── Collecting sink ───────────────────────────────────────────────────────

#[derive(Default)]
struct CollectingSink {
    deliveries: Mutex<Vec<(u64, String, ResultSet)>>,
    progress: Mutex<Vec<(u64, ProgressUpdate)>>,
    notify: Notify,
}

impl CollectingSink {
    async fn wait_for_deliveries(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.deliveries.lock().await.len() >= count {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }
}

#[async_trait]
impl ResponseSink for CollectingSink {
    async fn on_progress(&self, user_id: u64, update: ProgressUpdate) {
        self.progress.lock().await.push((user_id, update));
    }

    async fn deliver(&self, user_id: u64, request_id: &str, results: ResultSet) {
        self.deliveries
            .lock()
            .await
            .push((user_id, request_id.to_string(), results));
        self.notify.notify_waiters();
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────

fn resilience() -> ResilienceConfig {
    ResilienceConfig {
        max_retries: 2,
        retry_base_ms: 1,
        retry_max_ms: 10,
        ..ResilienceConfig::default()
    }
}

fn caller(client: Arc<dyn BackendClient>) -> Arc<BackendCaller> {
    Arc::new(BackendCaller::new(
        client,
        &resilience(),
        TimeoutConfig::default(),
        5,
    ))
}

// ── Scenarios ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn mixed_outcome_fanout_yields_independent_results() {
    let callers = vec![
        caller(Arc::new(FastBackend {
            name: "fast".into(),
            delay: Duration::from_millis(50),
        })),
        caller(Arc::new(HangingBackend {
            name: "hanging".into(),
        })),
        caller(Arc::new(FlakyBackend {
            name: "flaky".into(),
            failures_before_success: 2,
            calls: AtomicUsize::new(0),
        })),
    ];
    let dispatcher = Dispatcher::new(
        callers,
        Arc::new(MemoryCache::new(10, Duration::from_secs(3600))),
        Duration::from_secs(2),
    );

    let started = Instant::now();
    let set = dispatcher
        .query_all_with_progress(&DispatchRequest::new("what is love", "r1"), None)
        .await;
    let elapsed = started.elapsed();

    assert_eq!(set.len(), 3);
    assert!(set.partial, "the hanging backend must trigger a partial set");

    // Stable configured ordering regardless of completion order.
    assert_eq!(set.results[0].backend, "fast");
    assert_eq!(set.results[1].backend, "hanging");
    assert_eq!(set.results[2].backend, "flaky");

    assert!(set.results[0].success);
    assert_eq!(set.results[1].error_kind, Some(ErrorKind::Timeout));
    assert!(
        set.results[2].success,
        "two 500s then success must fit inside max_retries=2"
    );
    assert_eq!(set.success_count(), 2);

    // Bounded by the overall deadline, not by the hanging backend.
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
}

#[tokio::test]
async fn admin_request_is_dispatched_before_earlier_free_request() {
    let mut config = DispatchConfig::default();
    config.queue.min_workers = 1;
    config.queue.max_workers = 1;
    config.tiers.admin_users = vec![2];

    let sink = Arc::new(CollectingSink::default());
    let core = DispatchCore::builder(config)
        .backend(Arc::new(EchoBackend::new("echo")))
        .sink(Arc::clone(&sink) as Arc<dyn ResponseSink>)
        .build()
        .unwrap();

    // Enqueue while no worker is running: free first, then admin.
    core.submit(1, "free tier question", RequestKind::Text)
        .await
        .unwrap();
    core.submit(2, "admin question", RequestKind::Text)
        .await
        .unwrap();

    core.start().await.unwrap();
    assert!(
        sink.wait_for_deliveries(2, Duration::from_secs(10)).await,
        "both requests must be delivered"
    );
    core.shutdown().await;

    let deliveries = sink.deliveries.lock().await;
    assert_eq!(deliveries[0].0, 2, "admin must be dequeued first");
    assert_eq!(deliveries[1].0, 1);
}

#[tokio::test]
async fn shutdown_completes_inflight_and_rejects_new_admissions() {
    let mut config = DispatchConfig::default();
    config.queue.min_workers = 1;
    config.queue.max_workers = 1;
    config.timeouts.drain_secs = 10;

    let sink = Arc::new(CollectingSink::default());
    let core = Arc::new(
        DispatchCore::builder(config)
            .backend(Arc::new(
                EchoBackend::new("slow-echo").with_delay(Duration::from_millis(300)),
            ))
            .sink(Arc::clone(&sink) as Arc<dyn ResponseSink>)
            .build()
            .unwrap(),
    );
    core.start().await.unwrap();

    core.submit(1, "in-flight question", RequestKind::Text)
        .await
        .unwrap();
    // Let the worker pick it up.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let shutdown_task = {
        let core = Arc::clone(&core);
        tokio::spawn(async move { core.shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let rejected = core.submit(2, "too late", RequestKind::Text).await;
    assert_eq!(rejected.unwrap_err(), AdmissionError::ShuttingDown);

    shutdown_task.await.unwrap();

    let deliveries = sink.deliveries.lock().await;
    assert_eq!(
        deliveries.len(),
        1,
        "the in-flight request must complete during drain"
    );
    assert!(deliveries[0].2.results[0].success);
}

#[tokio::test]
async fn backpressure_rejects_when_queue_nears_capacity() {
    let mut config = DispatchConfig::default();
    config.queue.capacity = 20;
    config.queue.min_workers = 1;
    config.queue.max_workers = 1;

    let core = DispatchCore::builder(config)
        .backend(Arc::new(EchoBackend::new("echo")))
        .sink(Arc::new(CollectingSink::default()) as Arc<dyn ResponseSink>)
        .build()
        .unwrap();
    // Workers are deliberately not started: everything stays queued.

    for i in 0..19u64 {
        core.submit(100 + i, "fill the queue", RequestKind::Text)
            .await
            .unwrap_or_else(|e| panic!("admission {i} must succeed, got {e}"));
    }

    let overflowed = core.submit(999, "one too many", RequestKind::Text).await;
    assert_eq!(overflowed.unwrap_err(), AdmissionError::Overloaded);
}

#[tokio::test]
async fn progress_events_reach_the_sink_per_backend() {
    let mut config = DispatchConfig::default();
    config.queue.min_workers = 1;
    config.queue.max_workers = 1;

    let sink = Arc::new(CollectingSink::default());
    let core = DispatchCore::builder(config)
        .backend(Arc::new(EchoBackend::new("one")))
        .backend(Arc::new(EchoBackend::new("two")))
        .sink(Arc::clone(&sink) as Arc<dyn ResponseSink>)
        .build()
        .unwrap();
    core.start().await.unwrap();

    core.submit(7, "progress please", RequestKind::Text)
        .await
        .unwrap();
    assert!(sink.wait_for_deliveries(1, Duration::from_secs(10)).await);
    core.shutdown().await;

    let progress = sink.progress.lock().await;
    assert_eq!(progress.len(), 2, "one event per backend");
    assert!(progress.iter().all(|(user, _)| *user == 7));
    assert_eq!(progress[1].1.completed, 2);
    assert_eq!(progress[1].1.total, 2);
}

#[tokio::test]
async fn repeated_question_is_served_from_cache() {
    let mut config = DispatchConfig::default();
    config.queue.min_workers = 1;
    config.queue.max_workers = 1;
    // Rate limit must allow both submissions.
    config.rate_limit.calls_limit = 10;

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BackendClient for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn call(
            &self,
            question: &str,
            _context: &[ContextMessage],
            _max_tokens: u32,
        ) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(question.to_string())
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let sink = Arc::new(CollectingSink::default());
    let core = DispatchCore::builder(config)
        .backend(Arc::new(Counting {
            calls: Arc::clone(&calls),
        }))
        .sink(Arc::clone(&sink) as Arc<dyn ResponseSink>)
        .build()
        .unwrap();
    core.start().await.unwrap();

    core.submit(1, "identical question", RequestKind::Text)
        .await
        .unwrap();
    assert!(sink.wait_for_deliveries(1, Duration::from_secs(10)).await);

    core.submit(1, "identical question", RequestKind::Text)
        .await
        .unwrap();
    assert!(sink.wait_for_deliveries(2, Duration::from_secs(10)).await);
    core.shutdown().await;

    assert_eq!(
        calls.load(Ordering::SeqCst),
        1,
        "second dispatch must come from the cache"
    );
    let deliveries = sink.deliveries.lock().await;
    assert!(deliveries[1].2.results[0].success);
}

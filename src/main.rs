//! Standalone dispatcher daemon.
//!
//! Loads configuration (first CLI argument, default `dispatch.toml` if
//! present), wires real vendor backends from environment keys — falling back
//! to echo backends for any missing key so the daemon is runnable locally —
//! and serves until SIGINT, then drains gracefully.

use async_trait::async_trait;
use fanout_dispatch::backend::{BackendClient, EchoBackend, GigaChatClient, GroqClient, MistralClient};
use fanout_dispatch::context::MemoryContextStore;
use fanout_dispatch::dispatcher::{ProgressUpdate, ResponseSink};
use fanout_dispatch::{init_tracing, DispatchConfig, DispatchCore, DispatchError, ResultSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Sink that reports outcomes to the log; a chat front-end would replace
/// this with message delivery.
struct LogSink;

#[async_trait]
impl ResponseSink for LogSink {
    async fn on_progress(&self, user_id: u64, update: ProgressUpdate) {
        info!(
            user_id,
            backend = %update.backend,
            success = update.success,
            completed = update.completed,
            total = update.total,
            "backend finished"
        );
    }

    async fn deliver(&self, user_id: u64, request_id: &str, results: ResultSet) {
        info!(
            user_id,
            request_id,
            success = results.success_count(),
            total = results.len(),
            partial = results.partial,
            "dispatch delivered"
        );
    }
}

fn backend_or_echo(
    name: &str,
    built: Result<Arc<dyn BackendClient>, DispatchError>,
) -> Arc<dyn BackendClient> {
    match built {
        Ok(client) => client,
        Err(e) => {
            warn!(backend = name, error = %e, "falling back to echo backend");
            Arc::new(EchoBackend::new(name.to_string()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), DispatchError> {
    init_tracing()?;

    let config_path = std::env::args().nth(1);
    let config = match config_path {
        Some(path) => DispatchConfig::load(&path)?,
        None if std::path::Path::new("dispatch.toml").exists() => {
            DispatchConfig::load("dispatch.toml")?
        }
        None => DispatchConfig::default(),
    };

    let gigachat = backend_or_echo(
        "gigachat",
        GigaChatClient::from_env().map(|c| Arc::new(c) as Arc<dyn BackendClient>),
    );
    let groq = backend_or_echo(
        "groq",
        GroqClient::from_env().map(|c| Arc::new(c) as Arc<dyn BackendClient>),
    );
    let mistral = backend_or_echo(
        "mistral",
        MistralClient::from_env().map(|c| Arc::new(c) as Arc<dyn BackendClient>),
    );

    let context = Arc::new(MemoryContextStore::new(config.input.max_context_messages));

    let core = Arc::new(
        DispatchCore::builder(config.clone())
            .backend(gigachat)
            .backend(groq)
            .backend(mistral)
            .context_provider(context)
            .sink(Arc::new(LogSink))
            .build()?,
    );
    core.start().await?;

    #[cfg(feature = "observability-server")]
    {
        let state = Arc::new(fanout_dispatch::observability::ObservabilityState {
            shutdown: core.shutdown_coordinator(),
            queue: core.queue(),
        });
        let addr = config.observability.listen_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = fanout_dispatch::observability::start_server(&addr, state).await {
                warn!(error = %e, "observability server exited");
            }
        });
    }

    info!("dispatcher running, press ctrl-c to drain and exit");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| DispatchError::Other(format!("signal handler failed: {e}")))?;

    core.shutdown().await;
    Ok(())
}

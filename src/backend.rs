//! Backend abstraction and vendor implementations.
//!
//! Provides the [`BackendClient`] trait and production implementations:
//! - [`GigaChatClient`]: Sber GigaChat (OAuth token fetch + chat completions)
//! - [`GroqClient`]: Groq OpenAI-compatible chat completions
//! - [`MistralClient`]: Mistral chat completions
//! - [`EchoBackend`]: testing/demo backend
//!
//! Implementations map vendor HTTP statuses into [`BackendError`] before
//! returning, so the retry and circuit-breaker layers never see vendor
//! detail — only the retryable/non-retryable taxonomy.

use crate::context::ContextMessage;
use crate::RequestKind;
use crate::{DispatchError, ErrorKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Statuses that are never retried: client errors other than 429.
pub const NON_RETRYABLE_STATUSES: [u16; 6] = [400, 401, 403, 404, 405, 422];

/// Statuses that are safe to retry.
pub const SAFE_RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// A failed backend call, classified for the retry policy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Upstream answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// Connection-level failure (DNS, refused, reset).
    #[error("network error: {0}")]
    Network(String),

    /// The request deadline fired.
    #[error("request timed out")]
    Timeout,

    /// Authentication with the upstream failed before the main call.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The upstream answered 2xx but the body could not be decoded.
    #[error("malformed response: {0}")]
    Parse(String),
}

impl BackendError {
    /// Whether the retry policy may attempt this call again.
    ///
    /// HTTP 429 and 5xx plus network errors and timeouts are retryable;
    /// other 4xx client errors propagate immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Http { status, .. } => {
                if NON_RETRYABLE_STATUSES.contains(status) {
                    return false;
                }
                SAFE_RETRY_STATUSES.contains(status) || *status >= 500
            }
            BackendError::Network(_) | BackendError::Timeout => true,
            BackendError::Auth(_) | BackendError::Parse(_) => false,
        }
    }

    /// Classified kind for [`crate::BackendResult`] and metrics labels.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Http { status: 429, .. } => ErrorKind::RateLimited,
            BackendError::Http { status, .. } if *status >= 500 => ErrorKind::ServerError,
            BackendError::Http { .. } => ErrorKind::ClientError,
            BackendError::Network(_) => ErrorKind::Network,
            BackendError::Timeout => ErrorKind::Timeout,
            BackendError::Auth(_) => ErrorKind::Auth,
            BackendError::Parse(_) => ErrorKind::Parse,
        }
    }
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() <= max {
        body.to_string()
    } else {
        let mut end = max;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body[..end].to_string()
    }
}

fn status_error(status: u16, body: &str) -> BackendError {
    BackendError::Http {
        status,
        body: truncate(body, 200),
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Network(e.to_string())
    }
}

/// Response-size budget for a request, derived deterministically from the
/// question length and request kind.
pub fn max_tokens(question: &str, kind: RequestKind) -> u32 {
    match kind {
        RequestKind::Image => 1000,
        RequestKind::File => 1500,
        RequestKind::Text => {
            let len = question.chars().count();
            if len < 100 {
                500
            } else if len < 500 {
                1000
            } else {
                1500
            }
        }
    }
}

/// One upstream text-generation service.
///
/// Implementations must be thread-safe; the trait is object-safe so the
/// dispatcher holds `Arc<dyn BackendClient>`.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Stable backend name used in results, metrics and logs.
    fn name(&self) -> &str;

    /// Ask the backend the question with the given conversation context and
    /// token budget. Returns the generated text.
    async fn call(
        &self,
        question: &str,
        context: &[ContextMessage],
        max_tokens: u32,
    ) -> Result<String, BackendError>;
}

// ── Shared wire shapes ─────────────────────────────────────────────────────

/// Chat-completion request payload shared by all three vendors.
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ContextMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageBody,
}

#[derive(Debug, Deserialize)]
struct ChatMessageBody {
    content: String,
}

fn build_messages(question: &str, context: &[ContextMessage]) -> Vec<ContextMessage> {
    let mut messages = context.to_vec();
    messages.push(ContextMessage::user(question));
    messages
}

fn first_choice(response: ChatResponse) -> Result<String, BackendError> {
    response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| BackendError::Parse("no choices in response".into()))
}

// ── Echo backend (testing) ─────────────────────────────────────────────────

/// Backend double that echoes the question after a configurable delay.
pub struct EchoBackend {
    name: String,
    delay: Duration,
}

impl EchoBackend {
    /// Echo backend with a 10ms simulated latency.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: Duration::from_millis(10),
        }
    }

    /// Override the simulated latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl BackendClient for EchoBackend {
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
        Ok(question.to_string())
    }
}

// ── GigaChat ───────────────────────────────────────────────────────────────

/// Access tokens live 30 minutes; refresh a little early.
const GIGACHAT_TOKEN_LIFETIME: Duration = Duration::from_secs(29 * 60);

#[derive(Debug, Deserialize)]
struct GigaChatTokenResponse {
    access_token: String,
}

struct CachedToken {
    token: String,
    fetched_at: Instant,
}

/// Sber GigaChat backend.
///
/// Authenticates via an OAuth client-credentials exchange; the access token
/// is cached and refreshed before expiry. A 401 from the chat endpoint
/// invalidates the cached token so the next attempt re-authenticates.
pub struct GigaChatClient {
    client: reqwest::Client,
    auth_key: String,
    auth_url: String,
    base_url: String,
    model: String,
    temperature: f32,
    oauth_timeout: Duration,
    token: Mutex<Option<CachedToken>>,
}

impl GigaChatClient {
    /// Create a client from the base64 authorization key.
    pub fn new(auth_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            auth_key: auth_key.into(),
            auth_url: "https://ngw.devices.sberbank.ru:9443/api/v2/oauth".into(),
            base_url: "https://gigachat.devices.sberbank.ru/api/v1".into(),
            model: "GigaChat".into(),
            temperature: 0.7,
            oauth_timeout: Duration::from_secs(10),
            token: Mutex::new(None),
        }
    }

    /// Create a client from the `GIGACHAT_AUTH_KEY` environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Config`] when the variable is unset, so the
    /// misconfiguration surfaces at construction rather than at first call.
    pub fn from_env() -> Result<Self, DispatchError> {
        let key = std::env::var("GIGACHAT_AUTH_KEY")
            .map_err(|_| DispatchError::Config("GIGACHAT_AUTH_KEY not set".into()))?;
        Ok(Self::new(key))
    }

    /// Override the OAuth endpoint (for proxies and tests).
    pub fn with_auth_url(mut self, url: impl Into<String>) -> Self {
        self.auth_url = url.into();
        self
    }

    /// Override the API base URL (for proxies and tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Override the model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Override the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Override the OAuth request deadline.
    pub fn with_oauth_timeout(mut self, timeout: Duration) -> Self {
        self.oauth_timeout = timeout;
        self
    }

    async fn ensure_token(&self) -> Result<String, BackendError> {
        let mut cached = self.token.lock().await;
        if let Some(t) = cached.as_ref() {
            if t.fetched_at.elapsed() < GIGACHAT_TOKEN_LIFETIME {
                return Ok(t.token.clone());
            }
        }

        debug!("fetching gigachat access token");
        let response = self
            .client
            .post(&self.auth_url)
            .header("Authorization", format!("Basic {}", self.auth_key))
            .header("RqUID", uuid::Uuid::new_v4().to_string())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .timeout(self.oauth_timeout)
            .body("scope=GIGACHAT_API_PERS")
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(BackendError::Auth(format!("token endpoint returned {status}")));
        }

        let token: GigaChatTokenResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;

        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            fetched_at: Instant::now(),
        });
        Ok(token.access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }
}

#[async_trait]
impl BackendClient for GigaChatClient {
    fn name(&self) -> &str {
        "gigachat"
    }

    async fn call(
        &self,
        question: &str,
        context: &[ContextMessage],
        max_tokens: u32,
    ) -> Result<String, BackendError> {
        let token = self.ensure_token().await?;

        let payload = ChatRequest {
            model: self.model.clone(),
            messages: build_messages(question, context),
            temperature: self.temperature,
            max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        if status == 401 {
            // Token expired server-side; next attempt re-authenticates.
            self.invalidate_token().await;
            warn!(backend = self.name(), "access token invalidated after 401");
        }
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;
        first_choice(parsed)
    }
}

// ── Groq ───────────────────────────────────────────────────────────────────

/// Groq OpenAI-compatible backend.
pub struct GroqClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
}

impl GroqClient {
    /// Create a client with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.groq.com/openai/v1".into(),
            model: "llama-3.3-70b-versatile".into(),
            temperature: 0.7,
        }
    }

    /// Create a client from the `GROQ_API_KEY` environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Config`] when the variable is unset.
    pub fn from_env() -> Result<Self, DispatchError> {
        let key = std::env::var("GROQ_API_KEY")
            .map_err(|_| DispatchError::Config("GROQ_API_KEY not set".into()))?;
        Ok(Self::new(key))
    }

    /// Override the API base URL (for proxies and tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Override the model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Override the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl BackendClient for GroqClient {
    fn name(&self) -> &str {
        "groq"
    }

    async fn call(
        &self,
        question: &str,
        context: &[ContextMessage],
        max_tokens: u32,
    ) -> Result<String, BackendError> {
        let payload = ChatRequest {
            model: self.model.clone(),
            messages: build_messages(question, context),
            temperature: self.temperature,
            max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;
        first_choice(parsed)
    }
}

// ── Mistral ────────────────────────────────────────────────────────────────

/// Mistral chat-completions backend.
pub struct MistralClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
}

impl MistralClient {
    /// Create a client with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.mistral.ai/v1".into(),
            model: "mistral-small-latest".into(),
            temperature: 0.7,
        }
    }

    /// Create a client from the `MISTRAL_API_KEY` environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Config`] when the variable is unset.
    pub fn from_env() -> Result<Self, DispatchError> {
        let key = std::env::var("MISTRAL_API_KEY")
            .map_err(|_| DispatchError::Config("MISTRAL_API_KEY not set".into()))?;
        Ok(Self::new(key))
    }

    /// Override the API base URL (for proxies and tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Override the model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Override the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl BackendClient for MistralClient {
    fn name(&self) -> &str {
        "mistral"
    }

    async fn call(
        &self,
        question: &str,
        context: &[ContextMessage],
        max_tokens: u32,
    ) -> Result<String, BackendError> {
        let payload = ChatRequest {
            model: self.model.clone(),
            messages: build_messages(question, context),
            temperature: self.temperature,
            max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;
        first_choice(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_429_and_5xx_are_retryable() {
        for status in [429, 500, 502, 503, 504, 599] {
            let e = BackendError::Http {
                status,
                body: String::new(),
            };
            assert!(e.is_retryable(), "HTTP {status} must be retryable");
        }
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        for status in NON_RETRYABLE_STATUSES {
            let e = BackendError::Http {
                status,
                body: String::new(),
            };
            assert!(!e.is_retryable(), "HTTP {status} must not be retryable");
        }
    }

    #[test]
    fn test_network_and_timeout_are_retryable() {
        assert!(BackendError::Network("reset".into()).is_retryable());
        assert!(BackendError::Timeout.is_retryable());
    }

    #[test]
    fn test_auth_and_parse_are_not_retryable() {
        assert!(!BackendError::Auth("denied".into()).is_retryable());
        assert!(!BackendError::Parse("bad json".into()).is_retryable());
    }

    #[test]
    fn test_error_kind_classification() {
        let http = |status| BackendError::Http {
            status,
            body: String::new(),
        };
        assert_eq!(http(429).kind(), ErrorKind::RateLimited);
        assert_eq!(http(404).kind(), ErrorKind::ClientError);
        assert_eq!(http(503).kind(), ErrorKind::ServerError);
        assert_eq!(BackendError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(BackendError::Network(String::new()).kind(), ErrorKind::Network);
    }

    #[test]
    fn test_max_tokens_by_kind() {
        assert_eq!(max_tokens("short", RequestKind::Image), 1000);
        assert_eq!(max_tokens("short", RequestKind::File), 1500);
    }

    #[test]
    fn test_max_tokens_by_question_length() {
        assert_eq!(max_tokens("short", RequestKind::Text), 500);
        assert_eq!(max_tokens(&"x".repeat(100), RequestKind::Text), 1000);
        assert_eq!(max_tokens(&"x".repeat(500), RequestKind::Text), 1500);
    }

    #[test]
    fn test_status_error_truncates_body() {
        let long = "y".repeat(500);
        if let BackendError::Http { body, .. } = status_error(500, &long) {
            assert_eq!(body.len(), 200);
        } else {
            unreachable!("status_error must produce Http");
        }
    }

    #[test]
    fn test_build_messages_appends_question_last() {
        let context = vec![ContextMessage::user("earlier"), ContextMessage::assistant("reply")];
        let messages = build_messages("now", &context);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].role, "user");
        assert_eq!(messages[2].content, "now");
    }

    #[test]
    fn test_first_choice_empty_is_parse_error() {
        let err = first_choice(ChatResponse { choices: vec![] }).unwrap_err();
        assert!(matches!(err, BackendError::Parse(_)));
    }

    #[tokio::test]
    async fn test_echo_backend_returns_question() {
        let backend = EchoBackend::new("echo").with_delay(Duration::from_millis(1));
        let answer = backend.call("hello world", &[], 500).await.unwrap();
        assert_eq!(answer, "hello world");
        assert_eq!(backend.name(), "echo");
    }
}

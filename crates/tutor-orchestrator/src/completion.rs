//! Text-completion service interface and adapters.
//!
//! Stages talk to the LLM proxy only through [`CompletionService`]. The
//! HTTP adapter owns timeouts and retry-with-backoff so nothing above it
//! retries on its own.
//!
//! - [`HttpCompletionService`] - OpenAI-compatible proxy client
//! - [`ScriptedCompletionService`] - canned responses for tests and demos

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{header::HeaderValue, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CompletionConfig;

/// Timeout for the proxy health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Request / Response
// ============================================================================

/// The kind of work a completion is for. Drives model routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionTask {
    /// Lesson planning.
    Planning,
    /// Hint generation.
    Coaching,
    /// Submission grading.
    Grading,
}

impl CompletionTask {
    /// Sampling temperature used when a request does not set one.
    #[must_use]
    pub const fn default_temperature(&self) -> f32 {
        match self {
            Self::Planning => 0.8,
            Self::Coaching => 0.6,
            Self::Grading => 0.3,
        }
    }
}

impl std::fmt::Display for CompletionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planning => write!(f, "planning"),
            Self::Coaching => write!(f, "coaching"),
            Self::Grading => write!(f, "grading"),
        }
    }
}

/// One chat message in OpenAI format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// A system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// A user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A completion request issued by a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Task, used for routing and default temperature.
    pub task: CompletionTask,
    /// Prompt messages.
    pub messages: Vec<ChatMessage>,
    /// Temperature override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Free-form metadata forwarded to the proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl CompletionRequest {
    /// Builds a request from a system prompt and a user prompt.
    #[must_use]
    pub fn new(task: CompletionTask, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            task,
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            temperature: None,
            metadata: None,
        }
    }

    /// Attaches metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Total characters across all messages.
    #[must_use]
    pub fn prompt_len(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

/// A successful completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated text.
    pub content: String,
    /// Model that produced it.
    pub model: String,
    /// Tokens consumed, when reported.
    pub tokens_used: u64,
}

impl CompletionResponse {
    /// A response with only content.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: String::new(),
            tokens_used: 0,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Categories of completion failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionErrorKind {
    /// Invalid or missing credentials.
    Authentication,
    /// Rate limit exceeded.
    RateLimit,
    /// Proxy or upstream 5xx.
    Server,
    /// Connection failure.
    Network,
    /// The attempt exceeded its timeout.
    Timeout,
    /// The response body was not a usable completion.
    InvalidResponse,
    /// Anything else.
    Other,
}

impl std::fmt::Display for CompletionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::Server => "server",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::InvalidResponse => "invalid_response",
            Self::Other => "other",
        };
        write!(f, "{s}")
    }
}

impl CompletionErrorKind {
    /// Returns a suggestion message for this error kind.
    #[must_use]
    pub const fn suggestion(&self) -> &'static str {
        match self {
            Self::Authentication => "Check the API key environment variable named in tutor.json",
            Self::RateLimit => "Wait and retry, or reduce request frequency",
            Self::Server => "Retry later; the LLM proxy may be experiencing issues",
            Self::Network => "Check that the LLM proxy is running and reachable",
            Self::Timeout => "Retry, or raise completion.timeoutSeconds",
            Self::InvalidResponse => "Check the proxy logs; the model returned an unexpected body",
            Self::Other => "Check the LLM proxy configuration",
        }
    }
}

/// The single error type surfaced by completion adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Completion service error ({kind}): {message}\n\nSuggestion: {}", .kind.suggestion())]
pub struct CompletionError {
    /// Failure category.
    pub kind: CompletionErrorKind,
    /// Details.
    pub message: String,
    /// Server-requested delay before retrying.
    pub retry_after: Option<Duration>,
}

impl CompletionError {
    /// Creates a new error without a retry hint.
    #[must_use]
    pub fn new(kind: CompletionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Returns `true` if another attempt may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            CompletionErrorKind::RateLimit
                | CompletionErrorKind::Server
                | CompletionErrorKind::Network
                | CompletionErrorKind::Timeout
        )
    }
}

// ============================================================================
// Service trait
// ============================================================================

/// Prompt in, text out.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Runs one completion.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, CompletionError>;

    /// Returns `true` if the service is reachable.
    async fn healthy(&self) -> bool;

    /// Usage counters, when the adapter keeps them.
    fn metrics(&self) -> CompletionMetrics {
        CompletionMetrics::default()
    }
}

/// Usage counters of a completion adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMetrics {
    /// Completions requested (retries not counted).
    pub request_count: u64,
    /// Completions that ended in an error.
    pub error_count: u64,
    /// Tokens reported by the proxy.
    pub total_tokens: u64,
}

#[derive(Debug, Default)]
struct MetricCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    tokens: AtomicU64,
}

impl MetricCounters {
    fn snapshot(&self) -> CompletionMetrics {
        CompletionMetrics {
            request_count: self.requests.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            total_tokens: self.tokens.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// HTTP adapter
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionReply {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ProxyErrorBody {
    error: ProxyErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ProxyErrorDetail {
    message: String,
}

/// Client for an OpenAI-compatible completion proxy.
#[derive(Debug)]
pub struct HttpCompletionService {
    client: Client,
    config: CompletionConfig,
    api_key: Option<String>,
    counters: MetricCounters,
}

impl HttpCompletionService {
    /// Creates a client from configuration, reading the API key from the
    /// environment variable named by `config.api_key_env`.
    pub fn new(config: CompletionConfig) -> Result<Self, CompletionError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| CompletionError::new(CompletionErrorKind::Other, e.to_string()))?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        Ok(Self {
            client,
            config,
            api_key,
            counters: MetricCounters::default(),
        })
    }

    /// Overrides the API key.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    async fn send_once(&self, body: &ChatCompletionBody<'_>) -> Result<CompletionResponse, CompletionError> {
        let mut request = self
            .client
            .post(self.endpoint("chat/completions"))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(map_transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = parse_retry_after(response.headers().get("retry-after"));
            let body_text = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read proxy error body".to_string());
            return Err(map_http_error(status, &body_text, retry_after));
        }

        let reply: ChatCompletionReply = response.json().await.map_err(|e| {
            CompletionError::new(
                CompletionErrorKind::InvalidResponse,
                format!("failed to parse completion reply: {e}"),
            )
        })?;

        let content = reply
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| {
                CompletionError::new(CompletionErrorKind::InvalidResponse, "reply had no choices")
            })?;

        Ok(CompletionResponse {
            content,
            model: reply.model.unwrap_or_else(|| body.model.to_string()),
            tokens_used: reply.usage.map_or(0, |u| u.total_tokens),
        })
    }

    async fn send_with_retries(
        &self,
        request: &CompletionRequest,
        body: &ChatCompletionBody<'_>,
    ) -> Result<CompletionResponse, CompletionError> {
        let mut retries = 0;
        loop {
            match self.send_once(body).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() && retries < self.config.max_retries => {
                    retries += 1;
                    let delay = self.config.retry_delay(retries, err.retry_after);
                    warn!(
                        task = %request.task,
                        kind = %err.kind,
                        retry = retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Transient completion failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(task = %request.task, kind = %err.kind, "Completion failed");
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl CompletionService for HttpCompletionService {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, CompletionError> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let model = self.config.model_for(request.task);
        let body = ChatCompletionBody {
            model,
            messages: &request.messages,
            max_tokens: self.config.max_tokens,
            temperature: request
                .temperature
                .unwrap_or_else(|| request.task.default_temperature()),
            metadata: request.metadata.as_ref(),
        };

        let started = Instant::now();
        let deadline = self.config.total_deadline();
        let Ok(result) = tokio::time::timeout(deadline, self.send_with_retries(&request, &body)).await
        else {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                task = %request.task,
                deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                "Completion exceeded its overall deadline"
            );
            return Err(CompletionError::new(
                CompletionErrorKind::Timeout,
                format!("completion did not finish within {}s", deadline.as_secs()),
            ));
        };

        if let Ok(response) = &result {
            self.counters
                .tokens
                .fetch_add(response.tokens_used, Ordering::Relaxed);
            debug!(
                task = %request.task,
                model = %response.model,
                tokens = response.tokens_used,
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Completion succeeded"
            );
        }
        result
    }

    async fn healthy(&self) -> bool {
        match self
            .client
            .get(self.endpoint("health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "Completion proxy health check failed");
                false
            }
        }
    }

    fn metrics(&self) -> CompletionMetrics {
        self.counters.snapshot()
    }
}

fn map_transport_error(err: reqwest::Error) -> CompletionError {
    let kind = if err.is_timeout() {
        CompletionErrorKind::Timeout
    } else if err.is_connect() || err.is_request() {
        CompletionErrorKind::Network
    } else if err.is_decode() {
        CompletionErrorKind::InvalidResponse
    } else {
        CompletionErrorKind::Other
    };
    CompletionError::new(kind, format!("completion request failed: {err}"))
}

fn map_http_error(status: StatusCode, body: &str, retry_after: Option<Duration>) -> CompletionError {
    let message = serde_json::from_str::<ProxyErrorBody>(body)
        .map_or_else(|_| body.to_string(), |wrapper| wrapper.error.message);

    let kind = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CompletionErrorKind::Authentication,
        StatusCode::TOO_MANY_REQUESTS => CompletionErrorKind::RateLimit,
        StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => CompletionErrorKind::Server,
        _ => CompletionErrorKind::Other,
    };

    CompletionError {
        kind,
        message: format!("HTTP {}: {message}", status.as_u16()),
        retry_after,
    }
}

fn parse_retry_after(header: Option<&HeaderValue>) -> Option<Duration> {
    let value = header?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

// ============================================================================
// Scripted adapter
// ============================================================================

/// A completion service that replays queued responses per task.
///
/// When a task's queue is empty the sticky response set with
/// [`ScriptedCompletionService::always`] is used; without one the call
/// fails with `CompletionErrorKind::Other`.
#[derive(Debug, Default)]
pub struct ScriptedCompletionService {
    queues: Mutex<HashMap<CompletionTask, VecDeque<Result<String, CompletionError>>>>,
    sticky: Mutex<HashMap<CompletionTask, String>>,
    log: Mutex<Vec<CompletionRequest>>,
    unhealthy: std::sync::atomic::AtomicBool,
    delay: Option<Duration>,
    counters: MetricCounters,
}

impl ScriptedCompletionService {
    /// An empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `delay` inside every call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues a successful response for `task`.
    pub fn push(&self, task: CompletionTask, content: impl Into<String>) -> &Self {
        self.queue_entry(task, Ok(content.into()));
        self
    }

    /// Queues a failure for `task`.
    pub fn push_error(&self, task: CompletionTask, error: CompletionError) -> &Self {
        self.queue_entry(task, Err(error));
        self
    }

    /// Answers every otherwise unscripted `task` call with `content`.
    pub fn always(&self, task: CompletionTask, content: impl Into<String>) -> &Self {
        self.sticky
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task, content.into());
        self
    }

    /// Sets the value reported by `healthy`.
    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::Relaxed);
    }

    /// Number of calls made for `task`.
    #[must_use]
    pub fn calls(&self, task: CompletionTask) -> usize {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.task == task)
            .count()
    }

    /// Every request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn queue_entry(&self, task: CompletionTask, entry: Result<String, CompletionError>) {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(task)
            .or_default()
            .push_back(entry);
    }

    fn next_entry(&self, task: CompletionTask) -> Result<String, CompletionError> {
        let queued = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&task)
            .and_then(VecDeque::pop_front);
        if let Some(entry) = queued {
            return entry;
        }
        self.sticky
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task)
            .cloned()
            .ok_or_else(|| {
                CompletionError::new(
                    CompletionErrorKind::Other,
                    format!("no scripted response for {task}"),
                )
            })
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletionService {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, CompletionError> {
        let task = request.task;
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_entry(task) {
            Ok(content) => Ok(CompletionResponse {
                content,
                model: "scripted".to_string(),
                tokens_used: 0,
            }),
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    async fn healthy(&self) -> bool {
        !self.unhealthy.load(Ordering::Relaxed)
    }

    fn metrics(&self) -> CompletionMetrics {
        self.counters.snapshot()
    }
}

// ============================================================================
// Tests
// ============================================================================

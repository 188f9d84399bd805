//! Resilient client for an Ollama-protocol inference backend
//!
//! [`InferenceClient`] wraps the backend's `/api/generate` call with a
//! retry/backoff loop: timeouts, connection failures, and transient gateway
//! statuses (502/503/504) are retried with linear backoff; any other HTTP
//! status fails immediately carrying the status and body. The backend has no
//! admission control of its own, so the caller (the job orchestrator) bounds
//! concurrency; this client keeps no shared mutable state beyond the pooled
//! connections inside `reqwest`.
//!
//! The HTTP layer is behind the [`InferenceTransport`] trait so tests can
//! script replies and drive the retry loop on tokio's paused clock, without
//! real network I/O or real sleeps.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default backend URL
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
/// Default request timeout (5 minutes; generations can be long)
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
/// Default extra attempts after the first failure
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default base delay for linear backoff
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);
/// Gateway statuses worth retrying
const RETRYABLE_STATUS: [u16; 3] = [502, 503, 504];

/// Error from the inference backend.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// Request timed out (retryable)
    #[error("inference request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Could not reach the backend (retryable)
    #[error("failed to reach inference backend: {0}")]
    Connection(String),

    /// Transient gateway error (retryable)
    #[error("inference backend returned {status}")]
    Transient { status: u16 },

    /// Non-retryable API error, with the backend's response body
    #[error("inference backend returned {status}: {body}")]
    Api { status: u16, body: String },

    /// The backend replied 2xx but the body did not parse
    #[error("malformed response from inference backend: {0}")]
    InvalidResponse(String),
}

impl InferenceError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InferenceError::Timeout { .. }
                | InferenceError::Connection(_)
                | InferenceError::Transient { .. }
        )
    }
}

/// One generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest<'a> {
    /// Model name (e.g. "qwen2.5:72b")
    pub model: &'a str,
    /// The prompt text
    pub prompt: &'a str,
    /// Optional system prompt
    pub system: Option<&'a str>,
    /// Context window size (num_ctx)
    pub context_size: u32,
}

/// Wire payload for POST /api/generate.
#[derive(Debug, Serialize)]
pub struct GeneratePayload {
    model: String,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_ctx: u32,
}

impl From<&GenerateRequest<'_>> for GeneratePayload {
    fn from(req: &GenerateRequest<'_>) -> Self {
        Self {
            model: req.model.to_string(),
            prompt: req.prompt.to_string(),
            stream: false,
            system: req.system.map(str::to_string),
            options: GenerateOptions {
                num_ctx: req.context_size,
            },
        }
    }
}

/// Response from the generate API.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    /// The generated text
    pub text: String,
    /// Model that served the request
    pub model: String,
    /// Wall time in nanoseconds, if reported
    pub total_duration: Option<u64>,
    /// Prompt tokens evaluated, if reported
    pub prompt_eval_count: Option<u32>,
    /// Tokens generated, if reported
    pub eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawGenerateResponse {
    response: String,
    model: Option<String>,
    total_duration: Option<u64>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

/// An available model on the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

// ============================================
// Transport
// ============================================

/// A raw HTTP reply, before status classification.
#[derive(Debug, Clone)]
pub struct RawReply {
    pub status: u16,
    pub body: String,
}

/// Transport-level failure (no HTTP status was obtained).
#[derive(Debug, Clone)]
pub enum TransportError {
    Timeout,
    Connection(String),
}

/// HTTP layer under [`InferenceClient`].
///
/// The production impl is [`HttpTransport`]; tests provide scripted replies.
#[async_trait]
pub trait InferenceTransport: Send + Sync {
    /// POST /api/generate
    async fn post_generate(&self, payload: &GeneratePayload) -> Result<RawReply, TransportError>;

    /// GET /api/tags
    async fn get_tags(&self) -> Result<RawReply, TransportError>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport for the given base URL with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InferenceError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Connection(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn read_reply(
        result: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<RawReply, TransportError> {
        let response = result.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Connection(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Connection(e.to_string())
            }
        })?;

        Ok(RawReply { status, body })
    }
}

#[async_trait]
impl InferenceTransport for HttpTransport {
    async fn post_generate(&self, payload: &GeneratePayload) -> Result<RawReply, TransportError> {
        let url = format!("{}/api/generate", self.base_url);
        Self::read_reply(self.http_client.post(&url).json(payload).send().await).await
    }

    async fn get_tags(&self) -> Result<RawReply, TransportError> {
        let url = format!("{}/api/tags", self.base_url);
        Self::read_reply(self.http_client.get(&url).send().await).await
    }
}

// ============================================
// Client
// ============================================

/// Retrying client for the inference backend.
pub struct InferenceClient<T: InferenceTransport = HttpTransport> {
    transport: T,
    max_retries: u32,
    base_delay: Duration,
    timeout_secs: u64,
}

impl InferenceClient<HttpTransport> {
    /// Create a client against the given backend URL.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InferenceError> {
        let transport = HttpTransport::new(base_url, timeout)?;
        Ok(Self {
            transport,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            timeout_secs: timeout.as_secs(),
        })
    }
}

impl<T: InferenceTransport> InferenceClient<T> {
    /// Create a client over a custom transport (used in tests).
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    /// Generate text, retrying transient failures.
    ///
    /// Up to `max_retries` additional attempts. Backoff is linear:
    /// `base_delay * attempt_number` after the 1st, 2nd, ... failed attempt,
    /// with no delay after the final one. The last error is surfaced when
    /// retries are exhausted.
    pub async fn generate(
        &self,
        request: &GenerateRequest<'_>,
    ) -> Result<GenerateResponse, InferenceError> {
        let payload = GeneratePayload::from(request);
        let mut last_error: Option<InferenceError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * attempt;
                tracing::debug!(
                    attempt = attempt + 1,
                    total = self.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying inference request"
                );
                tokio::time::sleep(delay).await;
            }

            let error = match self.transport.post_generate(&payload).await {
                Ok(reply) if (200..300).contains(&reply.status) => {
                    return parse_generate_response(&reply.body, request.model);
                }
                Ok(reply) if RETRYABLE_STATUS.contains(&reply.status) => {
                    InferenceError::Transient {
                        status: reply.status,
                    }
                }
                Ok(reply) => {
                    // Non-retryable status: fail immediately with the body
                    return Err(InferenceError::Api {
                        status: reply.status,
                        body: reply.body,
                    });
                }
                Err(TransportError::Timeout) => InferenceError::Timeout {
                    timeout_secs: self.timeout_secs,
                },
                Err(TransportError::Connection(msg)) => InferenceError::Connection(msg),
            };

            tracing::warn!(
                attempt = attempt + 1,
                total = self.max_retries + 1,
                error = %error,
                "Inference attempt failed"
            );
            last_error = Some(error);
        }

        Err(last_error
            .unwrap_or_else(|| InferenceError::Connection("unknown error".to_string())))
    }

    /// List models available on the backend.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        let reply = self.tags_reply().await?;
        if !(200..300).contains(&reply.status) {
            return Err(InferenceError::Api {
                status: reply.status,
                body: reply.body,
            });
        }
        let tags: TagsResponse = serde_json::from_str(&reply.body)
            .map_err(|e| InferenceError::InvalidResponse(e.to_string()))?;
        Ok(tags.models)
    }

    /// Probe the backend; any failure reads as unavailable.
    pub async fn is_available(&self) -> bool {
        matches!(self.tags_reply().await, Ok(reply) if reply.status == 200)
    }

    async fn tags_reply(&self) -> Result<RawReply, InferenceError> {
        self.transport.get_tags().await.map_err(|e| match e {
            TransportError::Timeout => InferenceError::Timeout {
                timeout_secs: self.timeout_secs,
            },
            TransportError::Connection(msg) => InferenceError::Connection(msg),
        })
    }
}

fn parse_generate_response(
    body: &str,
    requested_model: &str,
) -> Result<GenerateResponse, InferenceError> {
    let raw: RawGenerateResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::InvalidResponse(e.to_string()))?;

    Ok(GenerateResponse {
        text: raw.response,
        model: raw.model.unwrap_or_else(|| requested_model.to_string()),
        total_duration: raw.total_duration,
        prompt_eval_count: raw.prompt_eval_count,
        eval_count: raw.eval_count,
    })
}

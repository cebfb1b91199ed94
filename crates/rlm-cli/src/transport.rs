//! OpenAI-compatible `/chat/completions` transport.

use std::time::Duration;

use async_trait::async_trait;
use rlm_core::{ChatMessage, Completion, LlmTransport, TransportError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ratelimit::{RateLimitConfig, RateLimiter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTransportConfig {
    /// API root, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    pub temperature: Option<f32>,
    pub rate_limit: RateLimitConfig,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            request_timeout_ms: 120_000,
            temperature: Some(0.0),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Failure of one attempt, before retry classification.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("{0}")]
    Network(String),
    #[error("status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("{0}")]
    Decode(String),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Network(_) => true,
            AttemptError::Status { status, .. } => *status == 429 || *status >= 500,
            AttemptError::Decode(_) => false,
        }
    }
}

fn into_transport_error(err: AttemptError, attempts: u32) -> TransportError {
    match err {
        e if attempts > 1 && e.is_retryable() => TransportError::RetriesExhausted {
            attempts,
            reason: e.to_string(),
        },
        AttemptError::Network(reason) => TransportError::Unreachable(reason),
        AttemptError::Status { status, message } => TransportError::Rejected { status, message },
        AttemptError::Decode(reason) => TransportError::Malformed(reason),
    }
}

fn parse_completion(body: &str) -> Result<Completion, AttemptError> {
    let response: ChatResponse =
        serde_json::from_str(body).map_err(|e| AttemptError::Decode(e.to_string()))?;
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| AttemptError::Decode("response has no message content".into()))?;
    let usage = response.usage.unwrap_or_default();
    Ok(Completion {
        content,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
    })
}

pub struct HttpTransport {
    config: HttpTransportConfig,
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rlm-cli/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| TransportError::Unreachable(format!("http client: {e}")))?;
        let limiter = RateLimiter::new(config.rate_limit.clone());
        Ok(Self {
            config,
            client,
            limiter,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    async fn attempt(&self, messages: &[ChatMessage]) -> Result<Completion, AttemptError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
        };
        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AttemptError::Network(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AttemptError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(AttemptError::Status {
                status: status.as_u16(),
                message: text.chars().take(500).collect(),
            });
        }
        parse_completion(&text)
    }
}

#[async_trait]
impl LlmTransport for HttpTransport {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, TransportError> {
        debug!(messages = messages.len(), model = %self.config.model, "chat completion request");
        self.limiter
            .run(|| self.attempt(messages), AttemptError::is_retryable)
            .await
            .map_err(|(e, attempts)| into_transport_error(e, attempts))
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmConfig;

pub const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_ANTHROPIC_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const SYSTEM_PROMPT: &str = "You are a helpful assistant that analyzes news articles.";

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub system: Option<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 2000,
            temperature: 0.7,
            system: Some(SYSTEM_PROMPT.to_string()),
        }
    }
}

/// Failure classes the analysis retry policy depends on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    /// Timeouts, rate limiting, 5xx and connection failures.
    #[error("transient LLM failure: {0}")]
    Transient(String),

    #[error("LLM authentication failed: {0}")]
    Auth(String),

    #[error("LLM request rejected: {0}")]
    Permanent(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Transient(_))
    }

    fn from_status(status: StatusCode, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status.as_u16(), body.chars().take(300).collect::<String>());
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::Auth(message),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => LlmError::Transient(message),
            s if s.is_server_error() => LlmError::Transient(message),
            _ => LlmError::Permanent(message),
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            LlmError::Transient(e.to_string())
        } else {
            LlmError::Permanent(e.to_string())
        }
    }
}

/// Provider-agnostic text completion.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, LlmError>;
}

/// Picks the provider from the model prefix. A missing key still yields an
/// adapter; it fails with `LlmError::Auth` on first use.
pub fn build_llm(config: &LlmConfig) -> Arc<dyn LlmAdapter> {
    let client = Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .unwrap_or_default();

    if config.model.starts_with("claude") {
        match &config.anthropic_api_key {
            Some(key) => Arc::new(AnthropicAdapter::new(client, key.clone(), &config.model, &config.anthropic_base_url)),
            None => Arc::new(UnconfiguredLlm::new(&config.model, "ANTHROPIC_API_KEY")),
        }
    } else {
        match &config.openai_api_key {
            Some(key) => Arc::new(OpenAiAdapter::new(client, key.clone(), &config.model, &config.openai_base_url)),
            None => Arc::new(UnconfiguredLlm::new(&config.model, "OPENAI_API_KEY")),
        }
    }
}

async fn send_json<T: for<'de> Deserialize<'de>>(request: RequestBuilder) -> Result<T, LlmError> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(LlmError::from_status(status, &body));
    }
    serde_json::from_str(&body).map_err(|e| LlmError::Permanent(format!("unexpected response body: {e}")))
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

pub struct OpenAiAdapter {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(client: Client, api_key: String, model: &str, base_url: &str) -> Self {
        Self {
            client,
            api_key,
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LlmAdapter for OpenAiAdapter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = options.system.as_deref() {
            messages.push(ChatMessage { role: "system", content: system });
        }
        messages.push(ChatMessage { role: "user", content: prompt });
        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        debug!("OpenAI completion with {} ({} prompt chars)", self.model, prompt.len());
        let response: ChatResponse = send_json(
            self.client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body),
        )
        .await?;

        response
            .choices
            .into_iter()
            .find_map(|c| c.message.content)
            .ok_or_else(|| LlmError::Permanent("response has no message content".to_string()))
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

pub struct AnthropicAdapter {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(client: Client, api_key: String, model: &str, base_url: &str) -> Self {
        Self {
            client,
            api_key,
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LlmAdapter for AnthropicAdapter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, LlmError> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            system: options.system.as_deref(),
            messages: vec![ChatMessage { role: "user", content: prompt }],
        };

        debug!("Anthropic completion with {} ({} prompt chars)", self.model, prompt.len());
        let response: MessagesResponse = send_json(
            self.client
                .post(format!("{}/v1/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body),
        )
        .await?;

        response
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .find_map(|block| block.text)
            .ok_or_else(|| LlmError::Permanent("response has no text block".to_string()))
    }
}

/// Stands in when no provider key is configured.
pub struct UnconfiguredLlm {
    model: String,
    missing_key: &'static str,
}

impl UnconfiguredLlm {
    pub fn new(model: &str, missing_key: &'static str) -> Self {
        Self {
            model: model.to_string(),
            missing_key,
        }
    }
}

#[async_trait]
impl LlmAdapter for UnconfiguredLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, _prompt: &str, _options: &CompletionOptions) -> Result<String, LlmError> {
        Err(LlmError::Auth(format!("{} is not set for model {}", self.missing_key, self.model)))
    }
}

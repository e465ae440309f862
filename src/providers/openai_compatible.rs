//! Cloud provider for OpenAI-compatible chat completion APIs.
//!
//! Covers OpenRouter, OpenAI and any endpoint that speaks the OpenAI
//! `/chat/completions` format. Requests always ask for a JSON object
//! (`response_format = {"type": "json_object"}`).
//!
//! # Configuration Example
//!
//! ```toml
//! [[providers]]
//! id = "openrouter"
//! api_key = "${OPENROUTER_API_KEY}"
//! base_url = "https://openrouter.ai/api/v1"
//! auto_discover_models = true
//!
//! [[providers.models]]
//! id = "google/gemini-2.5-flash"
//! cost_per_1k_tokens = 0.001
//! ```
//!
//! # HTTP status mapping
//!
//! | Status | Error |
//! |--------|-------|
//! | 401, 402, 403 | `AuthError` |
//! | 429 | `RateLimited` |
//! | 404 | `ConfigError` (model not served) |
//! | 408, 5xx | `ProviderUnavailable` |
//! | 400, 422, other 4xx | `ValidationError` |

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::{LlmError, Result};
use crate::model_config::{
    merge_discovered, ModelSpec, ProviderConfig, DISCOVERED_CLOUD_COST_PER_1K,
};
use crate::traits::{CompletionRequest, ProviderAdapter, RawCompletion, TokenUsage};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Request/Response Types (OpenAI-compatible format)
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<MessageRequest<'a>>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

impl<'a> ChatRequest<'a> {
    fn from_completion(request: &'a CompletionRequest) -> Self {
        let mut messages = Vec::with_capacity(2);
        if !request.schema_prompt.is_empty() {
            messages.push(MessageRequest {
                role: "system",
                content: &request.schema_prompt,
            });
        }
        messages.push(MessageRequest {
            role: "user",
            content: &request.input_text,
        });

        Self {
            model: &request.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Error response from API.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// `GET /models` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsResponse {
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

// ============================================================================
// Shared wire helpers
// ============================================================================

/// Map a non-success HTTP status and body to a typed error.
pub(crate) fn handle_error(status: StatusCode, body: &str) -> LlmError {
    let message = match serde_json::from_str::<ErrorResponse>(body) {
        Ok(response) => response.error.message,
        Err(_) if body.trim().is_empty() => status.to_string(),
        Err(_) => truncate(body, 200),
    };
    let message = format!("HTTP {}: {}", status.as_u16(), message);

    match status.as_u16() {
        401 | 402 | 403 => LlmError::AuthError(message),
        429 => LlmError::RateLimited(message),
        404 => LlmError::ConfigError(format!("Model or endpoint not found ({})", message)),
        408 => LlmError::ProviderUnavailable(message),
        _ if status.is_server_error() => LlmError::ProviderUnavailable(message),
        _ if status.is_client_error() => LlmError::ValidationError(message),
        _ => LlmError::ProviderUnavailable(message),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

pub(crate) fn build_client(config: &ProviderConfig) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    Client::builder()
        .default_headers(headers)
        .timeout(config.timeout())
        .build()
        .map_err(|e| LlmError::ConfigError(format!("Failed to build HTTP client: {}", e)))
}

/// POST `{base}/chat/completions` once and extract content and usage.
pub(crate) async fn chat_round_trip(
    client: &Client,
    base_url: &str,
    api_key: Option<&str>,
    request: &CompletionRequest,
) -> Result<RawCompletion> {
    let url = format!("{}/chat/completions", base_url);
    let body = ChatRequest::from_completion(request);

    let mut builder = client.post(&url).json(&body);
    if let Some(key) = api_key {
        builder = builder.bearer_auth(key);
    }

    let response = builder.send().await.map_err(|e| {
        warn!(url = %url, error = %e, "Chat completion request failed");
        LlmError::from(e)
    })?;

    let status = response.status();
    let text = response.text().await.map_err(LlmError::from)?;
    debug!(status = status.as_u16(), bytes = text.len(), "Chat completion response");

    if !status.is_success() {
        return Err(handle_error(status, &text));
    }

    let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
        LlmError::ValidationError(format!("Malformed response envelope: {}", e))
    })?;

    let usage = parsed
        .usage
        .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .unwrap_or_default();

    Ok(RawCompletion::new(content, usage))
}

/// GET `{base}/models`.
pub(crate) async fn fetch_models(
    client: &Client,
    base_url: &str,
    api_key: Option<&str>,
    timeout: Option<Duration>,
) -> Result<ModelsResponse> {
    let url = format!("{}/models", base_url);
    debug!(url = %url, "Fetching models list");

    let mut builder = client.get(&url);
    if let Some(key) = api_key {
        builder = builder.bearer_auth(key);
    }
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    let response = builder.send().await.map_err(|e| {
        LlmError::ProviderUnavailable(format!("Cannot reach {}: {}", url, e))
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(handle_error(status, &body));
    }

    response
        .json::<ModelsResponse>()
        .await
        .map_err(|e| LlmError::ValidationError(format!("Failed to parse models response: {}", e)))
}

pub(crate) fn discovered_specs(response: ModelsResponse, cost: Option<f64>) -> Vec<ModelSpec> {
    response
        .data
        .into_iter()
        .map(|entry| {
            let spec = ModelSpec::discovered(entry.id, cost);
            match entry.name {
                Some(name) => spec.with_name(name),
                None => spec,
            }
        })
        .collect()
}

// ============================================================================
// OpenAI-Compatible Provider Implementation
// ============================================================================

/// Cloud adapter for any OpenAI-compatible API. Requires a credential.
#[derive(Debug)]
pub struct OpenAICompatibleProvider {
    client: Client,
    config: ProviderConfig,
    api_key: String,
}

impl OpenAICompatibleProvider {
    /// Create provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the credential cannot be resolved or the
    /// HTTP client cannot be built.
    pub fn from_config(config: ProviderConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?.ok_or_else(|| {
            LlmError::ConfigError(format!(
                "Provider '{}' requires an API key (set 'api_key' or 'api_key_env')",
                config.id
            ))
        })?;
        let client = build_client(&config)?;

        debug!(
            provider = %config.id,
            base_url = %config.api_base(),
            models = config.models.len(),
            "Created OpenAI-compatible provider"
        );

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }
}

#[async_trait]
impl ProviderAdapter for OpenAICompatibleProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn configured_models(&self) -> &[ModelSpec] {
        &self.config.models
    }

    #[instrument(skip(self), fields(provider = %self.config.id))]
    async fn list_models(&self) -> Result<Vec<ModelSpec>> {
        if !self.config.auto_discover_models {
            return Ok(self.config.models.clone());
        }
        let response = fetch_models(
            &self.client,
            self.config.api_base(),
            Some(&self.api_key),
            None,
        )
        .await?;
        let discovered = discovered_specs(response, Some(DISCOVERED_CLOUD_COST_PER_1K));
        debug!(count = discovered.len(), "Discovered models");
        Ok(merge_discovered(&self.config.models, discovered))
    }

    async fn health_check(&self) -> Result<()> {
        fetch_models(
            &self.client,
            self.config.api_base(),
            Some(&self.api_key),
            Some(HEALTH_CHECK_TIMEOUT),
        )
        .await
        .map(|_| ())
    }

    #[instrument(skip(self, request), fields(provider = %self.config.id, model = %request.model))]
    async fn send(&self, request: &CompletionRequest) -> Result<RawCompletion> {
        chat_round_trip(
            &self.client,
            self.config.api_base(),
            Some(&self.api_key),
            request,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn test_handle_error_status_mapping() {
        let cases = [
            (401, FailureKind::Auth),
            (402, FailureKind::Auth),
            (403, FailureKind::Auth),
            (429, FailureKind::RateLimit),
            (404, FailureKind::Config),
            (408, FailureKind::ProviderUnavailable),
            (500, FailureKind::ProviderUnavailable),
            (503, FailureKind::ProviderUnavailable),
            (400, FailureKind::Validation),
            (422, FailureKind::Validation),
        ];
        for (code, kind) in cases {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(handle_error(status, "").kind(), kind, "status {}", code);
        }
    }

    #[test]
    fn test_handle_error_extracts_message() {
        let body = r#"{"error": {"message": "Rate limit reached for model", "code": "429"}}"#;
        let err = handle_error(StatusCode::TOO_MANY_REQUESTS, body);
        assert!(err.to_string().contains("Rate limit reached for model"));

        let err = handle_error(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>");
        assert!(err.to_string().contains("bad gateway"));
    }

    #[test]
    fn test_chat_request_serialization() {
        let request = CompletionRequest::new("document text", "Return JSON")
            .with_model("google/gemini-2.5-flash")
            .with_max_tokens(512);
        let body = serde_json::to_value(ChatRequest::from_completion(&request)).unwrap();

        assert_eq!(body["model"], "google/gemini-2.5-flash");
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "document text");
    }

    #[test]
    fn test_chat_request_without_schema_prompt() {
        let request = CompletionRequest::new("only text", "").with_model("m");
        let body = serde_json::to_value(ChatRequest::from_completion(&request)).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = ProviderConfig::new("openrouter", "https://openrouter.ai/api/v1")
            .with_model(ModelSpec::new("m"));
        let err = OpenAICompatibleProvider::from_config(config).unwrap_err();
        assert!(matches!(err, LlmError::ConfigError(_)));
    }

    #[test]
    fn test_from_config_with_literal_key() {
        let config = ProviderConfig::new("openai", "https://api.openai.com/v1/")
            .with_api_key("sk-test")
            .with_model(ModelSpec::new("gpt-4o-mini"));
        let provider = OpenAICompatibleProvider::from_config(config).unwrap();
        assert_eq!(provider.id(), "openai");
        assert!(!provider.is_local());
        assert_eq!(provider.configured_models().len(), 1);
        assert_eq!(provider.config().api_base(), "https://api.openai.com/v1");
    }

    #[test]
    fn test_discovered_specs_cost() {
        let response: ModelsResponse = serde_json::from_str(
            r#"{"data": [{"id": "a/b", "name": "A B"}, {"id": "c/d"}]}"#,
        )
        .unwrap();
        let specs = discovered_specs(response, Some(0.001));
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].display_name(), "A B");
        assert_eq!(specs[1].cost_per_1k_tokens, Some(0.001));
        assert_eq!(specs[1].max_tokens, 4096);
    }
}

//! Provider adapter trait and the request/result types that flow through it.
//!
//! An adapter performs exactly one network round trip per [`ProviderAdapter::send`]
//! call and never retries on its own; retry and fallback decisions belong to
//! [`crate::retry`] and [`crate::fallback`].
//!
//! ```text
//! CompletionRequest ──▶ send() ──▶ RawCompletion ──▶ parse_payload() ──▶ CompletionResult
//!                          │                                                  ▲
//!                          └──────────── LlmError (no tokens consumed) ───────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::error::{FailureKind, LlmError, Result};
use crate::model_config::ModelSpec;

// ============================================================================
// Token Usage
// ============================================================================

/// Token counts reported for one attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

// ============================================================================
// Completion Request
// ============================================================================

/// A normalization request for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Extracted document text (or file listing).
    pub input_text: String,
    /// Description of the target schema, sent as the system prompt.
    pub schema_prompt: String,
    /// Requested model; re-targeted per chain link.
    pub model: String,
    pub temperature: f32,
    /// Output token ceiling.
    pub max_tokens: u32,
    /// Top-level keys the parsed payload must contain.
    #[serde(default)]
    pub required_keys: Vec<String>,
}

impl CompletionRequest {
    pub fn new(input_text: impl Into<String>, schema_prompt: impl Into<String>) -> Self {
        Self {
            input_text: input_text.into(),
            schema_prompt: schema_prompt.into(),
            model: String::new(),
            temperature: 0.0,
            max_tokens: 4096,
            required_keys: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_required_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Copy of this request aimed at `model`, with the token ceiling clamped
    /// to the model's maximum output when known.
    pub fn for_model(&self, model: &str, model_max_tokens: Option<u32>) -> Self {
        let mut request = self.clone();
        request.model = model.to_string();
        if let Some(limit) = model_max_tokens {
            request.max_tokens = request.max_tokens.min(limit);
        }
        request
    }
}

// ============================================================================
// Completion Result
// ============================================================================

/// Raw content of a successful round trip, before payload parsing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCompletion {
    pub content: String,
    pub usage: TokenUsage,
}

impl RawCompletion {
    pub fn new(content: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            content: content.into(),
            usage,
        }
    }
}

/// Outcome of one attempt: a parsed JSON object or a typed failure, plus the
/// tokens and wall-clock latency of that attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    pub provider: String,
    pub model: String,
    pub outcome: std::result::Result<Value, LlmError>,
    pub usage: TokenUsage,
    pub latency: Duration,
}

impl CompletionResult {
    pub fn success(
        provider: impl Into<String>,
        model: impl Into<String>,
        payload: Value,
        usage: TokenUsage,
        latency: Duration,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            outcome: Ok(payload),
            usage,
            latency,
        }
    }

    /// Failure that consumed no tokens.
    pub fn failure(
        provider: impl Into<String>,
        model: impl Into<String>,
        error: LlmError,
        latency: Duration,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            outcome: Err(error),
            usage: TokenUsage::default(),
            latency,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn payload(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&LlmError> {
        self.outcome.as_ref().err()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error().map(LlmError::kind)
    }
}

/// Parse model output into a JSON object.
///
/// Markdown code fences are stripped first. Empty content, non-JSON content,
/// JSON that is not an object and objects missing a required key are all
/// `ValidationError`s.
pub fn parse_payload(content: &str, required_keys: &[String]) -> Result<Value> {
    let text = strip_code_fence(content.trim());
    if text.is_empty() {
        return Err(LlmError::ValidationError(
            "Empty response content".to_string(),
        ));
    }

    let value: Value = serde_json::from_str(text)?;
    let Some(object) = value.as_object() else {
        return Err(LlmError::ValidationError(format!(
            "Expected a JSON object, got {}",
            json_type_name(&value)
        )));
    };

    if let Some(missing) = required_keys.iter().find(|k| !object.contains_key(k.as_str())) {
        return Err(LlmError::ValidationError(format!(
            "Missing required key '{}'",
            missing
        )));
    }

    Ok(value)
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.trim_end();
    let rest = rest.strip_suffix("```").unwrap_or(rest);

    // Language tag (```json), on its own line or followed by a space.
    let tag_len = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        .unwrap_or(rest.len());
    let after_tag = &rest[tag_len..];
    if after_tag.starts_with(char::is_whitespace) {
        after_tag.trim()
    } else {
        rest.trim()
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ============================================================================
// Provider Adapter
// ============================================================================

/// Capability interface implemented once per backend family.
///
/// Adapters hold only immutable configuration and an HTTP client, so one
/// instance is shared by every worker of a batch run.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider identifier this adapter was built for.
    fn id(&self) -> &str;

    /// Whether the backend runs locally (no per-token cost).
    fn is_local(&self) -> bool {
        false
    }

    /// Models declared in configuration.
    fn configured_models(&self) -> &[ModelSpec];

    /// Available models. Static providers return the configured set;
    /// discovering providers query the backend and merge the result.
    async fn list_models(&self) -> Result<Vec<ModelSpec>> {
        Ok(self.configured_models().to_vec())
    }

    /// Lightweight reachability probe.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    /// One network round trip. Transport and HTTP failures come back as
    /// errors; content validation happens in [`ProviderAdapter::complete`].
    async fn send(&self, request: &CompletionRequest) -> Result<RawCompletion>;

    /// Run one attempt and classify it.
    async fn complete(&self, request: &CompletionRequest) -> CompletionResult {
        let started = Instant::now();
        let sent = self.send(request).await;
        let latency = started.elapsed();

        match sent {
            Ok(raw) => CompletionResult {
                provider: self.id().to_string(),
                model: request.model.clone(),
                outcome: parse_payload(&raw.content, &request.required_keys),
                usage: raw.usage,
                latency,
            },
            Err(error) => CompletionResult::failure(self.id(), &request.model, error, latency),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_payload_object() {
        let value = parse_payload(r#"{"title": "Report"}"#, &[]).unwrap();
        assert_eq!(value, json!({"title": "Report"}));
    }

    #[test]
    fn test_parse_payload_strips_code_fence() {
        let content = "```json\n{\"title\": \"Report\"}\n```";
        let value = parse_payload(content, &[]).unwrap();
        assert_eq!(value["title"], "Report");

        let content = "```\n{\"a\": 1}\n```\n";
        assert_eq!(parse_payload(content, &[]).unwrap()["a"], 1);
    }

    #[test]
    fn test_parse_payload_strips_single_line_fence() {
        let value = parse_payload("```json {\"title\": \"x\"}```", &[]).unwrap();
        assert_eq!(value["title"], "x");

        let value = parse_payload("```{\"title\": \"x\"}```", &[]).unwrap();
        assert_eq!(value["title"], "x");

        let err = parse_payload("``````", &[]).unwrap_err();
        assert!(err.to_string().contains("Empty response content"));
    }

    #[test]
    fn test_parse_payload_rejects_empty() {
        let err = parse_payload("   ", &[]).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Validation);
        assert!(err.to_string().contains("Empty"));
    }

    #[test]
    fn test_parse_payload_rejects_non_json() {
        let err = parse_payload("Sure! Here is the metadata:", &[]).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Validation);
    }

    #[test]
    fn test_parse_payload_rejects_non_object() {
        let err = parse_payload("[1, 2, 3]", &[]).unwrap_err();
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn test_parse_payload_required_keys() {
        let keys = vec!["title".to_string(), "year".to_string()];
        let err = parse_payload(r#"{"title": "x"}"#, &keys).unwrap_err();
        assert!(err.to_string().contains("'year'"));
        assert!(parse_payload(r#"{"title": "x", "year": 1999}"#, &keys).is_ok());
    }

    #[test]
    fn test_for_model_clamps_ceiling() {
        let request = CompletionRequest::new("text", "schema").with_max_tokens(8000);
        let retargeted = request.for_model("m2", Some(2048));
        assert_eq!(retargeted.model, "m2");
        assert_eq!(retargeted.max_tokens, 2048);

        let untouched = request.for_model("m3", None);
        assert_eq!(untouched.max_tokens, 8000);
        assert_eq!(request.model, "");
    }

    #[test]
    fn test_completion_result_accessors() {
        let ok = CompletionResult::success(
            "p",
            "m",
            json!({"k": 1}),
            TokenUsage::new(10, 5),
            Duration::from_millis(3),
        );
        assert!(ok.is_success());
        assert_eq!(ok.usage.total(), 15);
        assert_eq!(ok.failure_kind(), None);

        let failed = CompletionResult::failure(
            "p",
            "m",
            LlmError::RateLimited("429".into()),
            Duration::ZERO,
        );
        assert!(!failed.is_success());
        assert!(failed.usage.is_empty());
        assert_eq!(failed.failure_kind(), Some(FailureKind::RateLimit));
    }
}

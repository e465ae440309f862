//! Mock provider for testing.
//!
//! `MockProvider` replays a script of replies, one per attempt, then keeps
//! returning a default reply. It counts calls and tracks how many attempts
//! are in flight at once, which lets tests check retry counts and the
//! dispatcher's concurrency bound without any network.
//!
//! ```text
//! push_reply(Fail(RateLimited)) ─┐
//! push_reply(Fail(RateLimited)) ─┼─▶ attempt 1, 2, 3 ─▶ then default reply
//! push_reply(Json({...}))       ─┘
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{LlmError, Result};
use crate::model_config::{ModelSpec, ProviderConfig};
use crate::traits::{CompletionRequest, ProviderAdapter, RawCompletion, TokenUsage};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Successful round trip whose content is this JSON value.
    Json(Value),
    /// Successful round trip with raw content (e.g. prose, to provoke validation).
    Content(String),
    /// Failed round trip.
    Fail(LlmError),
    /// The attempt panics.
    Panic(String),
}

/// Mock provider adapter.
#[derive(Debug, Clone)]
pub struct MockProvider {
    id: String,
    local: bool,
    models: Vec<ModelSpec>,
    discovered: Option<Vec<ModelSpec>>,
    script: Arc<Mutex<VecDeque<MockReply>>>,
    default_reply: MockReply,
    usage: TokenUsage,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
    discovery_calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockProvider {
    /// Mock that succeeds with `{"ok": true}` and serves model `mock-model`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            local: false,
            models: vec![ModelSpec::new("mock-model")],
            discovered: None,
            script: Arc::new(Mutex::new(VecDeque::new())),
            default_reply: MockReply::Json(json!({"ok": true})),
            usage: TokenUsage::new(100, 50),
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
            discovery_calls: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Mock built from configuration: configured models, default reply.
    pub fn from_config(config: &ProviderConfig) -> Self {
        let mut mock = Self::new(config.id.clone());
        if !config.models.is_empty() {
            mock.models = config.models.clone();
        }
        mock
    }

    /// Replace the served models.
    pub fn with_models(mut self, models: Vec<ModelSpec>) -> Self {
        self.models = models;
        self
    }

    /// Models returned by `list_models` on top of the configured ones.
    pub fn with_discovered_models(mut self, models: Vec<ModelSpec>) -> Self {
        self.discovered = Some(models);
        self
    }

    /// Replies consumed in order, one per attempt.
    pub fn with_script(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        let script = VecDeque::from_iter(replies);
        Self {
            script: Arc::new(Mutex::new(script)),
            ..self
        }
    }

    /// Reply used once the script is exhausted.
    pub fn with_default_reply(mut self, reply: MockReply) -> Self {
        self.default_reply = reply;
        self
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = TokenUsage::new(prompt_tokens, completion_tokens);
        self
    }

    /// Sleep this long inside every attempt.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Append a reply to the script.
    pub async fn push_reply(&self, reply: MockReply) {
        self.script.lock().await.push_back(reply);
    }

    /// Attempts made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls to `list_models` with discovered models configured.
    pub fn discovery_calls(&self) -> usize {
        self.discovery_calls.load(Ordering::SeqCst)
    }

    /// Attempts currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of attempts observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Counts one attempt as in flight until dropped, including on panic.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(in_flight: &Arc<AtomicUsize>, max_in_flight: &AtomicUsize) -> Self {
        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(in_flight))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn configured_models(&self) -> &[ModelSpec] {
        &self.models
    }

    async fn list_models(&self) -> Result<Vec<ModelSpec>> {
        match &self.discovered {
            Some(discovered) => {
                self.discovery_calls.fetch_add(1, Ordering::SeqCst);
                Ok(crate::model_config::merge_discovered(
                    &self.models,
                    discovered.clone(),
                ))
            }
            None => Ok(self.models.clone()),
        }
    }

    async fn send(&self, _request: &CompletionRequest) -> Result<RawCompletion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlightGuard::enter(&self.in_flight, &self.max_in_flight);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone());

        match reply {
            MockReply::Json(value) => Ok(RawCompletion::new(value.to_string(), self.usage)),
            MockReply::Content(content) => Ok(RawCompletion::new(content, self.usage)),
            MockReply::Fail(error) => Err(error),
            MockReply::Panic(message) => panic!("{}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_default_reply() {
        let mock = MockProvider::new("mock");
        let result = mock.complete(&CompletionRequest::new("t", "s")).await;
        assert!(result.is_success());
        assert_eq!(result.payload().unwrap()["ok"], true);
        assert_eq!(result.usage.total(), 150);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_script_order() {
        let mock = MockProvider::new("mock").with_script([
            MockReply::Fail(LlmError::RateLimited("429".into())),
            MockReply::Content("not json".into()),
        ]);
        let request = CompletionRequest::new("t", "s").with_model("mock-model");

        let first = mock.complete(&request).await;
        assert_eq!(first.error(), Some(&LlmError::RateLimited("429".into())));
        assert!(first.usage.is_empty());

        let second = mock.complete(&request).await;
        assert!(matches!(second.error(), Some(LlmError::ValidationError(_))));
        // Tokens were consumed even though the content was unusable.
        assert_eq!(second.usage.total(), 150);

        let third = mock.complete(&request).await;
        assert!(third.is_success());
        assert_eq!(third.model, "mock-model");
    }

    #[tokio::test]
    async fn test_mock_push_reply_and_discovery() {
        let mock = MockProvider::new("mock")
            .with_discovered_models(vec![ModelSpec::discovered("extra", None)]);
        mock.push_reply(MockReply::Json(json!({"n": 1}))).await;

        let result = mock.complete(&CompletionRequest::new("t", "s")).await;
        assert_eq!(result.payload().unwrap()["n"], 1);

        let models = mock.list_models().await.unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(mock.discovery_calls(), 1);
    }

    #[tokio::test]
    async fn test_panicking_attempt_leaves_nothing_in_flight() {
        let mock = MockProvider::new("mock").with_script([MockReply::Panic("boom".into())]);

        let panicking = mock.clone();
        let joined = tokio::spawn(async move {
            panicking.complete(&CompletionRequest::new("t", "s")).await
        })
        .await;
        assert!(joined.unwrap_err().is_panic());
        assert_eq!(mock.in_flight(), 0);

        assert!(mock.complete(&CompletionRequest::new("t", "s")).await.is_success());
        assert_eq!(mock.in_flight(), 0);
        assert_eq!(mock.max_in_flight(), 1);
        assert_eq!(mock.calls(), 2);
    }
}

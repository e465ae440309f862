//! Fallback chain execution.
//!
//! A [`FallbackChain`] is a fixed, ordered list of (provider, model) links.
//! The [`FallbackOrchestrator`] runs the [`RetryPolicy`] against each link in
//! turn and stops at the first success:
//!
//! ```text
//! link 1 (primary) ──retry──▶ exhausted ──▶ link 2 ──retry──▶ success ─▶ ViaFallback
//!        │
//!        └──────────────────▶ success ─────────────────────────────────▶ Primary
//! ```
//!
//! Every attempt is appended to the [`MetricsAggregator`] before the next
//! attempt or link starts.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cost_tracker::{MetricsAggregator, UsageRecord};
use crate::dispatcher::StopSignal;
use crate::error::{FailureKind, LlmError};
use crate::registry::ProviderRegistry;
use crate::retry::RetryPolicy;
use crate::traits::{CompletionRequest, CompletionResult};

/// One (provider, model) pair of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    pub provider: String,
    pub model: String,
}

impl ChainLink {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Primary link followed by fallback links. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackChain {
    links: Vec<ChainLink>,
}

impl FallbackChain {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            links: vec![ChainLink::new(provider, model)],
        }
    }

    /// Append a fallback link.
    pub fn then(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.links.push(ChainLink::new(provider, model));
        self
    }

    pub fn primary(&self) -> &ChainLink {
        &self.links[0]
    }

    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl From<ChainLink> for FallbackChain {
    fn from(link: ChainLink) -> Self {
        Self { links: vec![link] }
    }
}

/// How a chain run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    /// The primary link succeeded.
    Primary,
    /// A later link succeeded after every earlier one was exhausted.
    ViaFallback,
    /// Every link failed; carries the terminal failure kind of the last link tried.
    Exhausted(FailureKind),
}

/// Result of running a request through a chain.
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    /// Result of the final attempt.
    pub result: CompletionResult,
    /// 1-based position of the link that produced `result`.
    pub link: usize,
    /// Attempts across all links.
    pub attempts: u32,
    pub status: ChainStatus,
}

impl ChainOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }
}

/// Runs requests through fallback chains with per-link retries.
pub struct FallbackOrchestrator {
    registry: Arc<ProviderRegistry>,
    metrics: Arc<MetricsAggregator>,
    retry: RetryPolicy,
}

impl FallbackOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        metrics: Arc<MetricsAggregator>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            metrics,
            retry,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    /// Complete `request` on the first link of `chain` that succeeds.
    ///
    /// Once `stop` is raised no further attempt or link is started.
    pub async fn complete(
        &self,
        chain: &FallbackChain,
        request: &CompletionRequest,
        stop: Option<&StopSignal>,
    ) -> ChainOutcome {
        let mut attempts = 0;
        let mut last: Option<(usize, CompletionResult)> = None;

        for (index, link) in chain.links().iter().enumerate() {
            let position = index + 1;
            if position > 1 && stop.is_some_and(StopSignal::is_stopped) {
                info!(
                    provider = %link.provider,
                    "Stop requested, not advancing to fallback link {}", position
                );
                break;
            }

            let adapter = match self.registry.resolve(&link.provider).await {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(provider = %link.provider, error = %e, "Cannot resolve chain link");
                    let failure =
                        CompletionResult::failure(&link.provider, &link.model, e, Duration::ZERO);
                    last = Some((position, failure));
                    continue;
                }
            };

            let Some(spec) = self.registry.model_spec(&link.provider, &link.model).await else {
                warn!(
                    provider = %link.provider,
                    model = %link.model,
                    "Chain link names a model the provider does not serve"
                );
                let failure = CompletionResult::failure(
                    &link.provider,
                    &link.model,
                    LlmError::ConfigError(format!(
                        "Model '{}' is not served by provider '{}'",
                        link.model, link.provider
                    )),
                    Duration::ZERO,
                );
                last = Some((position, failure));
                continue;
            };
            let cost_per_1k = spec.cost_per_1k_tokens;
            let link_request = request.for_model(&link.model, Some(spec.max_tokens));

            let metrics = &self.metrics;
            let link_request = &link_request;
            let outcome = self
                .retry
                .run(stop, |attempt| {
                    let adapter = Arc::clone(&adapter);
                    async move {
                        let result = adapter.complete(link_request).await;
                        debug!(
                            provider = %result.provider,
                            model = %result.model,
                            attempt,
                            success = result.is_success(),
                            "Attempt finished"
                        );
                        metrics
                            .record(UsageRecord::from_result(&result, cost_per_1k))
                            .await;
                        result
                    }
                })
                .await;
            attempts += outcome.attempts;

            if outcome.value.is_success() {
                let status = if position == 1 {
                    ChainStatus::Primary
                } else {
                    info!(
                        provider = %link.provider,
                        model = %link.model,
                        "Succeeded via fallback link {}", position
                    );
                    ChainStatus::ViaFallback
                };
                return ChainOutcome {
                    result: outcome.value,
                    link: position,
                    attempts,
                    status,
                };
            }

            if let Some(e) = outcome.value.error() {
                warn!(
                    provider = %link.provider,
                    model = %link.model,
                    attempts = outcome.attempts,
                    kind = e.code(),
                    "Chain link exhausted: {}", e
                );
            }
            last = Some((position, outcome.value));
        }

        let (link, result) = last.unwrap_or_else(|| {
            let primary = chain.primary();
            (
                1,
                CompletionResult::failure(
                    &primary.provider,
                    &primary.model,
                    LlmError::Unknown("Chain produced no attempt".to_string()),
                    Duration::ZERO,
                ),
            )
        });
        let kind = result.failure_kind().unwrap_or(FailureKind::Unknown);
        ChainOutcome {
            result,
            link,
            attempts,
            status: ChainStatus::Exhausted(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_builder() {
        let chain = FallbackChain::new("cloud-a", "m1").then("local-b", "m2");
        assert_eq!(chain.len(), 2);
        assert!(!chain.is_empty());
        assert_eq!(chain.primary(), &ChainLink::new("cloud-a", "m1"));
        assert_eq!(chain.links()[1].model, "m2");
    }

    #[test]
    fn test_chain_from_link() {
        let chain = FallbackChain::from(ChainLink::new("p", "m"));
        assert_eq!(chain.len(), 1);
    }
}

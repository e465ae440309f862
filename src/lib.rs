//! docmeta-llm - Multi-Provider LLM Request Orchestration
//!
//! Turns many independent per-document normalization requests into a
//! bounded, fault-tolerant batch run against one or more LLM providers.
//!
//! This crate provides:
//! - A provider adapter trait with cloud (OpenAI-compatible), local
//!   (LM Studio) and mock implementations
//! - A provider registry with lazy, cached model auto-discovery
//! - A retry policy with exponential backoff for transient failures
//! - Fallback chains over ordered (provider, model) pairs
//! - A bounded concurrent dispatcher that delivers results as they complete
//! - Usage and cost metrics per provider and model
//!
//! # Providers
//!
//! | Type | Adapter | Credential | Discovery |
//! |------|---------|------------|-----------|
//! | `openrouter` | [`OpenAICompatibleProvider`] | `OPENROUTER_API_KEY` | `GET /models` |
//! | `openai` | [`OpenAICompatibleProvider`] | `OPENAI_API_KEY` | `GET /models` |
//! | `openai_compatible` | [`OpenAICompatibleProvider`] | configured | `GET /models` |
//! | `lm_studio` | [`LMStudioProvider`] | optional | `GET /v1/models` |
//! | `mock` | [`MockProvider`] | none | scripted |
//!
//! # Data Flow
//!
//! ```text
//! Dispatcher ──job──▶ FallbackOrchestrator ──link──▶ RetryPolicy ──attempt──▶ ProviderAdapter
//!     ▲                       │                                                    │
//!     │                       └──────── UsageRecord per attempt ──▶ MetricsAggregator
//!     └──── (input_id, CompletionResult) ──▶ OutputSink / ErrorSink
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use docmeta_llm::*;
//!
//! let config = OrchestratorConfig::from_file("docmeta.toml")?;
//! let registry = Arc::new(ProviderRegistry::from_config(&config)?);
//! let chain = registry.chain_from_defaults(&config.defaults).await?;
//! let metrics = Arc::new(MetricsAggregator::new());
//!
//! let orchestrator = Arc::new(FallbackOrchestrator::new(
//!     registry,
//!     metrics.clone(),
//!     RetryPolicy::from_config(&config.retry),
//! ));
//! let dispatcher = Dispatcher::new(orchestrator).with_workers(config.worker_count());
//!
//! let errors = JsonlErrorSink::new("errors.jsonl");
//! let results = JsonlResultSink::new("results.jsonl");
//! let summary = dispatcher.run(jobs, &chain, &results, &errors).await;
//! metrics.snapshot().await.write_json("metrics.json").await?;
//! ```

pub mod cost_tracker;
pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod fallback;
pub mod model_config;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod sink;
pub mod traits;

pub use cost_tracker::{
    format_cost, format_tokens, MetricsAggregator, MetricsSnapshot, ModelTotals, UsageRecord,
};
pub use dispatcher::{Dispatcher, ExtractionJob, RunSummary, StopSignal, DEFAULT_WORKERS};
pub use error::{FailureKind, LlmError, Result};
pub use factory::{AdapterConstructor, ProviderFactory, ProviderType};
pub use fallback::{ChainLink, ChainOutcome, ChainStatus, FallbackChain, FallbackOrchestrator};
pub use model_config::{
    ChainLinkConfig, DefaultsConfig, ModelConfigError, ModelSpec, OrchestratorConfig,
    ProviderConfig, RetryConfig,
};
pub use providers::lmstudio::LMStudioProvider;
pub use providers::mock::{MockProvider, MockReply};
pub use providers::openai_compatible::OpenAICompatibleProvider;
pub use registry::{ModelCriteria, ProviderRegistry, ProviderRegistryBuilder, ProviderStatus};
pub use retry::{AttemptOutcome, RetryOutcome, RetryPolicy};
pub use sink::{
    ErrorRecord, ErrorSink, JsonlErrorSink, JsonlResultSink, MemorySink, OutputSink, ResultLine,
};
pub use traits::{
    parse_payload, CompletionRequest, CompletionResult, ProviderAdapter, RawCompletion,
    TokenUsage,
};

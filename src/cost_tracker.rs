//! Usage and Cost Metrics
//!
//! Every attempt made during a batch run, successful or not, is appended to
//! the [`MetricsAggregator`] as a [`UsageRecord`]. A [`MetricsSnapshot`]
//! groups the records by provider and model.
//!
//! # Usage
//!
//! ```rust
//! use docmeta_llm::cost_tracker::{MetricsAggregator, UsageRecord};
//!
//! # tokio_test_block(async {
//! let metrics = MetricsAggregator::new();
//! metrics
//!     .record(
//!         UsageRecord::new("openrouter", "google/gemini-2.5-flash")
//!             .with_tokens(1200, 300)
//!             .with_cost(0.0015),
//!     )
//!     .await;
//!
//! let snapshot = metrics.snapshot().await;
//! assert_eq!(snapshot.total_attempts(), 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```
//!
//! # Snapshot JSON
//!
//! ```json
//! {
//!   "openrouter": {
//!     "google/gemini-2.5-flash": {
//!       "attempts": 3, "successes": 1,
//!       "prompt_tokens": 1200, "completion_tokens": 300,
//!       "cost_estimate": 0.0015, "mean_latency_ms": 840.0
//!     }
//!   }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::FailureKind;
use crate::traits::CompletionResult;

// ============================================================================
// Usage Record
// ============================================================================

/// One attempt against one (provider, model) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Estimated cost (USD).
    pub cost_estimate: f64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    /// Successful record with no tokens, cost or latency.
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_estimate: 0.0,
            success: true,
            failure_kind: None,
            latency_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_tokens(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.prompt_tokens = prompt_tokens;
        self.completion_tokens = completion_tokens;
        self
    }

    pub fn with_cost(mut self, cost_estimate: f64) -> Self {
        self.cost_estimate = cost_estimate;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = latency.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn failed(mut self, kind: FailureKind) -> Self {
        self.success = false;
        self.failure_kind = Some(kind);
        self
    }

    /// Record for an attempt result. Cost is charged whenever tokens were
    /// consumed, including failed attempts.
    pub fn from_result(result: &CompletionResult, cost_per_1k_tokens: Option<f64>) -> Self {
        let cost = cost_per_1k_tokens
            .map_or(0.0, |c| result.usage.total() as f64 / 1000.0 * c);
        let record = Self::new(&result.provider, &result.model)
            .with_tokens(result.usage.prompt_tokens, result.usage.completion_tokens)
            .with_cost(cost)
            .with_latency(result.latency);
        match result.failure_kind() {
            Some(kind) => record.failed(kind),
            None => record,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Aggregated totals for one (provider, model) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelTotals {
    pub attempts: u64,
    pub successes: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_estimate: f64,
    pub mean_latency_ms: f64,
    #[serde(skip)]
    latency_sum_ms: u64,
}

impl ModelTotals {
    fn add(&mut self, record: &UsageRecord) {
        self.attempts += 1;
        if record.success {
            self.successes += 1;
        }
        self.prompt_tokens += record.prompt_tokens;
        self.completion_tokens += record.completion_tokens;
        self.cost_estimate += record.cost_estimate;
        self.latency_sum_ms += record.latency_ms;
        self.mean_latency_ms = self.latency_sum_ms as f64 / self.attempts as f64;
    }

    pub fn failures(&self) -> u64 {
        self.attempts - self.successes
    }
}

/// Point-in-time totals keyed by provider, then model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsSnapshot {
    pub providers: BTreeMap<String, BTreeMap<String, ModelTotals>>,
}

impl MetricsSnapshot {
    pub fn totals(&self, provider: &str, model: &str) -> Option<&ModelTotals> {
        self.providers.get(provider)?.get(model)
    }

    fn all(&self) -> impl Iterator<Item = &ModelTotals> {
        self.providers.values().flat_map(|models| models.values())
    }

    pub fn total_attempts(&self) -> u64 {
        self.all().map(|t| t.attempts).sum()
    }

    pub fn total_successes(&self) -> u64 {
        self.all().map(|t| t.successes).sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.all()
            .map(|t| t.prompt_tokens + t.completion_tokens)
            .sum()
    }

    pub fn total_cost(&self) -> f64 {
        self.all().map(|t| t.cost_estimate).sum()
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write the snapshot as pretty JSON.
    pub async fn write_json(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = self.to_json_pretty().map_err(std::io::Error::other)?;
        tokio::fs::write(path.as_ref(), json).await
    }
}

// ============================================================================
// Aggregator
// ============================================================================

#[derive(Debug, Default)]
struct AggregatorState {
    records: Vec<UsageRecord>,
    snapshot: MetricsSnapshot,
}

/// Append-only usage log shared by all workers of a run.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    state: Mutex<AggregatorState>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one attempt.
    pub async fn record(&self, record: UsageRecord) {
        let mut state = self.state.lock().await;
        state
            .snapshot
            .providers
            .entry(record.provider.clone())
            .or_default()
            .entry(record.model.clone())
            .or_default()
            .add(&record);
        state.records.push(record);
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.state.lock().await.snapshot.clone()
    }

    /// Every record appended so far, in append order.
    pub async fn records(&self) -> Vec<UsageRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn total_attempts(&self) -> usize {
        self.state.lock().await.records.len()
    }
}

/// Format cost for display.
pub fn format_cost(cost: f64) -> String {
    if cost < 0.01 {
        format!("${:.4}", cost)
    } else if cost < 1.0 {
        format!("${:.3}", cost)
    } else {
        format!("${:.2}", cost)
    }
}

/// Format token count.
pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        format!("{}", tokens)
    }
}

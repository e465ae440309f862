//! Orchestrator Configuration Module
//!
//! TOML-based configuration for providers, their models, the default fallback
//! chain, retry tuning and the worker bound of a batch run.
//!
//! # Overview
//!
//! The configuration defines:
//! - Providers (cloud or local) and the models each one serves
//! - Cost information (per 1K tokens, absent for local models)
//! - The default provider/model and the fallback provider/model
//! - Retry policy and concurrency settings
//!
//! Locating the configuration file is the caller's concern; this module only
//! parses and validates it.
//!
//! # Example Configuration
//!
//! ```toml
//! max_workers = 5
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 1000
//! multiplier = 2.0
//!
//! [defaults]
//! provider = "openrouter"
//! model = "google/gemini-2.5-flash"
//! fallback_provider = "lm_studio"
//!
//! [[providers]]
//! id = "openrouter"
//! api_key = "${OPENROUTER_API_KEY}"
//! base_url = "https://openrouter.ai/api/v1"
//!
//! [[providers.models]]
//! id = "google/gemini-2.5-flash"
//! name = "Gemini 2.5 Flash"
//! max_tokens = 4096
//! cost_per_1k_tokens = 0.001
//!
//! [[providers]]
//! id = "lm_studio"
//! api_key = "lm-studio"
//! base_url = "http://localhost:1234/v1"
//! auto_discover_models = true
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::error::LlmError;

/// Lower bound of the worker pool.
pub const MIN_WORKERS: usize = 1;
/// Upper bound of the worker pool.
pub const MAX_WORKERS: usize = 10;
/// Output ceiling assigned to models found through auto-discovery.
pub const DISCOVERED_MAX_TOKENS: u32 = 4096;
/// Cost per 1K tokens assumed for cloud models found through auto-discovery.
pub const DISCOVERED_CLOUD_COST_PER_1K: f64 = 0.001;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ModelConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML configuration.
    #[error("Failed to parse TOML config: {0}")]
    ParseError(String),

    /// Invalid configuration (bad values, dangling references, duplicates).
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl From<ModelConfigError> for LlmError {
    fn from(err: ModelConfigError) -> Self {
        LlmError::ConfigError(err.to_string())
    }
}

// ============================================================================
// Model Spec
// ============================================================================

/// A model served by one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model identifier sent on the wire (e.g., "google/gemini-2.5-flash").
    pub id: String,

    /// Human-readable display name. Falls back to `id` when empty.
    #[serde(default)]
    pub name: String,

    /// Maximum output tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Cost per 1000 tokens (USD). `None` for local models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_1k_tokens: Option<f64>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn default_max_tokens() -> u32 {
    DISCOVERED_MAX_TOKENS
}

impl ModelSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            max_tokens: default_max_tokens(),
            cost_per_1k_tokens: None,
            description: String::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_cost(mut self, cost_per_1k_tokens: f64) -> Self {
        self.cost_per_1k_tokens = Some(cost_per_1k_tokens);
        self
    }

    /// Spec for a model reported by a provider's discovery endpoint.
    pub fn discovered(id: impl Into<String>, cost_per_1k_tokens: Option<f64>) -> Self {
        let mut spec = Self::new(id);
        spec.cost_per_1k_tokens = cost_per_1k_tokens;
        spec.description = "Auto-discovered".to_string();
        spec
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Local models carry no cost.
    pub fn is_local(&self) -> bool {
        self.cost_per_1k_tokens.map_or(true, |c| c == 0.0)
    }

    /// Estimated cost of `total_tokens` tokens on this model.
    pub fn estimate_cost(&self, total_tokens: u64) -> f64 {
        self.cost_per_1k_tokens
            .map_or(0.0, |c| total_tokens as f64 / 1000.0 * c)
    }
}

/// Configured models first, then discovered models not already configured.
pub fn merge_discovered(configured: &[ModelSpec], discovered: Vec<ModelSpec>) -> Vec<ModelSpec> {
    let mut merged = configured.to_vec();
    let mut seen: HashSet<String> = configured.iter().map(|m| m.id.clone()).collect();
    for model in discovered {
        if seen.insert(model.id.clone()) {
            merged.push(model);
        }
    }
    merged
}

// ============================================================================
// Provider Configuration
// ============================================================================

/// Configuration for one provider (OpenRouter, LM Studio, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider identifier (e.g., "openrouter", "lm_studio").
    pub id: String,

    /// Adapter type used to construct this provider. Defaults to `id`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Whether this provider is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Literal API key, or an environment reference like `${OPENROUTER_API_KEY}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable name holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Base URL for the provider API (e.g., "https://openrouter.ai/api/v1").
    pub base_url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Query the provider for its models on first use.
    #[serde(default)]
    pub auto_discover_models: bool,

    /// Declared models.
    #[serde(default)]
    pub models: Vec<ModelSpec>,
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: None,
            enabled: true,
            api_key: None,
            api_key_env: None,
            base_url: base_url.into(),
            timeout_seconds: default_timeout(),
            auto_discover_models: false,
            models: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = Some(var.into());
        self
    }

    pub fn with_model(mut self, model: ModelSpec) -> Self {
        self.models.push(model);
        self
    }

    pub fn with_auto_discovery(mut self) -> Self {
        self.auto_discover_models = true;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Adapter type id used to look up the constructor.
    pub fn adapter_kind(&self) -> &str {
        self.kind.as_deref().unwrap_or(&self.id)
    }

    /// Base URL without trailing slash.
    pub fn api_base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn model(&self, id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Resolve the credential for this provider.
    ///
    /// `api_key_env` takes precedence over `api_key`. An `api_key` of the form
    /// `${NAME}` or `$NAME` is read from the environment; any other value is
    /// used literally. Returns `Ok(None)` when no credential is configured and
    /// a `ConfigError` when a referenced variable is unset or empty.
    pub fn resolve_api_key(&self) -> Result<Option<String>, LlmError> {
        let var = match (&self.api_key_env, &self.api_key) {
            (Some(var), _) => var.as_str(),
            (None, Some(key)) => match env_reference(key) {
                Some(var) => var,
                None => return Ok(Some(key.clone())),
            },
            (None, None) => return Ok(None),
        };

        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => Ok(Some(value)),
            _ => Err(LlmError::ConfigError(format!(
                "API key environment variable '{}' not set for provider '{}'. \
                 Please set it with: export {}=your-api-key",
                var, self.id, var
            ))),
        }
    }
}

/// Variable name of a `${NAME}` or `$NAME` reference.
fn env_reference(value: &str) -> Option<&str> {
    let name = if let Some(inner) = value.strip_prefix("${") {
        inner.strip_suffix('}')?
    } else {
        value.strip_prefix('$')?
    };
    let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some(name)
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retry tuning applied to every link of a fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

// ============================================================================
// Default Configuration
// ============================================================================

/// One extra (provider, model) pair appended to the default chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainLinkConfig {
    pub provider: String,
    /// First model of the provider when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Default provider/model selection and fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_provider")]
    pub provider: String,

    /// First model of `provider` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_provider: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,

    /// Further links tried after the fallback provider, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<ChainLinkConfig>,
}

fn default_provider() -> String {
    "openrouter".to_string()
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: Some("google/gemini-2.5-flash".to_string()),
            fallback_provider: None,
            fallback_model: None,
            fallbacks: Vec::new(),
        }
    }
}

impl DefaultsConfig {
    /// Ordered (provider, optional model) pairs: default, fallback, extra fallbacks.
    pub fn links(&self) -> Vec<ChainLinkConfig> {
        let mut links = vec![ChainLinkConfig {
            provider: self.provider.clone(),
            model: self.model.clone(),
        }];
        if let Some(provider) = &self.fallback_provider {
            links.push(ChainLinkConfig {
                provider: provider.clone(),
                model: self.fallback_model.clone(),
            });
        }
        links.extend(self.fallbacks.iter().cloned());
        links
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Concurrent jobs, clamped to `[MIN_WORKERS, MAX_WORKERS]` at use.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Providers in preference order.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

fn default_max_workers() -> usize {
    5
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::builtin_defaults()
    }
}

impl OrchestratorConfig {
    /// Load configuration from a specific file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ModelConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ModelConfigError> {
        toml::from_str(toml_str).map_err(|e| ModelConfigError::ParseError(e.to_string()))
    }

    /// Serialize configuration to TOML string.
    pub fn to_toml(&self) -> Result<String, ModelConfigError> {
        toml::to_string_pretty(self).map_err(|e| ModelConfigError::ParseError(e.to_string()))
    }

    /// OpenRouter enabled with Gemini Flash, LM Studio disabled with discovery.
    pub fn builtin_defaults() -> Self {
        Self {
            max_workers: default_max_workers(),
            retry: RetryConfig::default(),
            defaults: DefaultsConfig::default(),
            providers: vec![
                ProviderConfig::new("openrouter", "https://openrouter.ai/api/v1")
                    .with_api_key("${OPENROUTER_API_KEY}")
                    .with_model(
                        ModelSpec::new("google/gemini-2.5-flash")
                            .with_name("Gemini 2.5 Flash")
                            .with_cost(0.001),
                    ),
                ProviderConfig::new("lm_studio", "http://localhost:1234/v1")
                    .with_api_key("lm-studio")
                    .with_auto_discovery()
                    .disabled(),
            ],
        }
    }

    pub fn get_provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }

    /// Worker bound clamped to `[MIN_WORKERS, MAX_WORKERS]`.
    pub fn worker_count(&self) -> usize {
        self.max_workers.clamp(MIN_WORKERS, MAX_WORKERS)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ModelConfigError> {
        let invalid = |msg: String| Err(ModelConfigError::ValidationError(msg));

        if !(1..=10).contains(&self.retry.max_attempts) {
            return invalid(format!(
                "retry.max_attempts must be between 1 and 10, got {}",
                self.retry.max_attempts
            ));
        }
        if self.retry.multiplier < 1.0 {
            return invalid(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            ));
        }

        let mut seen_providers = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return invalid("Provider id must not be empty".to_string());
            }
            if !seen_providers.insert(provider.id.as_str()) {
                return invalid(format!("Duplicate provider id: '{}'", provider.id));
            }
            if !(provider.base_url.starts_with("http://")
                || provider.base_url.starts_with("https://"))
            {
                return invalid(format!(
                    "Provider '{}' base_url must start with http:// or https://",
                    provider.id
                ));
            }
            if !(1..=300).contains(&provider.timeout_seconds) {
                return invalid(format!(
                    "Provider '{}' timeout_seconds must be between 1 and 300",
                    provider.id
                ));
            }
            if provider.enabled && provider.models.is_empty() && !provider.auto_discover_models {
                return invalid(format!(
                    "Provider '{}' declares no models and has auto-discovery disabled",
                    provider.id
                ));
            }

            let mut seen_models = HashSet::new();
            for model in &provider.models {
                if !seen_models.insert(model.id.as_str()) {
                    return invalid(format!(
                        "Duplicate model id '{}' in provider '{}'",
                        model.id, provider.id
                    ));
                }
            }
        }

        for link in self.defaults.links() {
            let Some(provider) = self.get_provider(&link.provider) else {
                return invalid(format!(
                    "Default provider '{}' not found in providers list",
                    link.provider
                ));
            };
            if let Some(model) = &link.model {
                if !provider.auto_discover_models && provider.model(model).is_none() {
                    return invalid(format!(
                        "Default model '{}' not found in provider '{}'",
                        model, provider.id
                    ));
                }
            }
        }

        Ok(())
    }
}

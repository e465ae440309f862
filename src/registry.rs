//! Provider Registry - Pluggable Provider Management
//!
//! # Purpose
//!
//! Maps provider identifiers to adapters built from configuration, caches the
//! model list of each provider and answers "which providers and models can a
//! batch run use".
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              ProviderRegistryBuilder                        │
//! │  constructors: type id ─▶ Fn(&ProviderConfig) -> adapter    │
//! │  ┌─ openrouter / openai / openai_compatible                │
//! │  ├─ lm_studio / lmstudio / lm-studio / local               │
//! │  ├─ mock                                                    │
//! │  └─ custom ids registered by the application               │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │ build(&OrchestratorConfig)
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              ProviderRegistry (read-only)                   │
//! │  enabled providers, configuration order:                    │
//! │  ┌─ id ─▶ Arc<dyn ProviderAdapter>                          │
//! │  │        OnceCell<model catalog>  (lazy discovery)         │
//! │  └─ ...                                                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Discovery
//!
//! Providers with `auto_discover_models` query their backend the first time
//! they are resolved. The merged list is cached for the registry's lifetime.
//! A discovery failure is logged and remembered; the provider keeps its
//! configured models and other providers are unaffected.
//!
//! # Example
//!
//! ```ignore
//! use docmeta_llm::{OrchestratorConfig, ProviderRegistry};
//!
//! let config = OrchestratorConfig::from_file("docmeta.toml")?;
//! let registry = ProviderRegistry::builder()
//!     .register("my_backend", |cfg| Ok(Arc::new(MyAdapter::new(cfg)?) as _))?
//!     .build(&config)?;
//!
//! let chain = registry.chain_from_defaults(&config.defaults).await?;
//! println!("Enabled: {:?}", registry.list_enabled());
//! ```

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::{FailureKind, LlmError, Result};
use crate::factory::{AdapterConstructor, ProviderFactory};
use crate::fallback::FallbackChain;
use crate::model_config::{DefaultsConfig, ModelSpec, OrchestratorConfig, ProviderConfig};
use crate::traits::ProviderAdapter;

/// Number of model ids shown in a provider status.
const STATUS_SAMPLE_MODELS: usize = 5;

// ============================================================================
// Builder
// ============================================================================

/// Collects adapter constructors before the registry is built.
pub struct ProviderRegistryBuilder {
    constructors: HashMap<String, AdapterConstructor>,
    builtin: Vec<&'static str>,
}

impl Default for ProviderRegistryBuilder {
    fn default() -> Self {
        let mut constructors = HashMap::new();
        let mut builtin = Vec::new();
        for (id, constructor) in ProviderFactory::builtin_constructors() {
            constructors.insert(id.to_string(), constructor);
            builtin.push(id);
        }
        Self {
            constructors,
            builtin,
        }
    }
}

impl ProviderRegistryBuilder {
    /// Builder pre-loaded with the built-in constructors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a type id with an adapter constructor.
    ///
    /// Type ids are case-insensitive. Overriding a built-in type is allowed.
    /// Registering the same custom id twice is a `ConfigError`.
    pub fn register<F>(mut self, id: impl Into<String>, constructor: F) -> Result<Self>
    where
        F: Fn(&ProviderConfig) -> Result<Arc<dyn ProviderAdapter>> + Send + Sync + 'static,
    {
        let id = id.into().to_lowercase();
        if self.builtin.contains(&id.as_str()) {
            warn!(provider_type = %id, "Overriding built-in provider constructor");
            self.builtin.retain(|b| *b != id);
        } else if self.constructors.contains_key(&id) {
            return Err(LlmError::ConfigError(format!(
                "Provider type '{}' is already registered",
                id
            )));
        }
        self.constructors.insert(id, Arc::new(constructor));
        Ok(self)
    }

    /// Registered type ids, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.constructors.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Validate `config` and construct every enabled provider, in order.
    ///
    /// # Errors
    ///
    /// `ConfigError` when the configuration is invalid, a provider's type has
    /// no constructor, an adapter cannot be built (e.g. missing credential) or
    /// no provider is enabled.
    pub fn build(self, config: &OrchestratorConfig) -> Result<ProviderRegistry> {
        config.validate()?;

        let mut entries = Vec::new();
        for provider in config.enabled_providers() {
            let kind = provider.adapter_kind().to_lowercase();
            let constructor = self.constructors.get(&kind).ok_or_else(|| {
                LlmError::ConfigError(format!(
                    "No adapter registered for type '{}' (provider '{}')",
                    provider.adapter_kind(),
                    provider.id
                ))
            })?;
            let adapter = constructor(provider)?;
            debug!(
                provider = %provider.id,
                provider_type = %provider.adapter_kind(),
                "Registered provider"
            );
            entries.push(ProviderEntry {
                config: provider.clone(),
                adapter,
                catalog: OnceCell::new(),
            });
        }

        if entries.is_empty() {
            return Err(LlmError::ConfigError(
                "No enabled providers in configuration".to_string(),
            ));
        }

        info!(
            providers = entries.len(),
            "Provider registry ready: {}",
            entries
                .iter()
                .map(|e| e.config.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(ProviderRegistry { entries })
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Clone)]
struct ModelCatalog {
    models: Vec<ModelSpec>,
    discovery_error: Option<LlmError>,
}

struct ProviderEntry {
    config: ProviderConfig,
    adapter: Arc<dyn ProviderAdapter>,
    catalog: OnceCell<ModelCatalog>,
}

impl ProviderEntry {
    async fn catalog(&self) -> &ModelCatalog {
        self.catalog
            .get_or_init(|| async {
                if !self.config.auto_discover_models {
                    return ModelCatalog {
                        models: self.config.models.clone(),
                        discovery_error: None,
                    };
                }
                match self.adapter.list_models().await {
                    Ok(models) => {
                        info!(
                            provider = %self.config.id,
                            models = models.len(),
                            "Model discovery complete"
                        );
                        ModelCatalog {
                            models,
                            discovery_error: None,
                        }
                    }
                    Err(e) => {
                        warn!(
                            provider = %self.config.id,
                            error = %e,
                            "Model discovery failed, keeping configured models"
                        );
                        ModelCatalog {
                            models: self.config.models.clone(),
                            discovery_error: Some(e),
                        }
                    }
                }
            })
            .await
    }
}

/// Reachability and model summary for one enabled provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub id: String,
    pub provider_type: String,
    pub available: bool,
    pub local: bool,
    pub models_count: usize,
    /// First few model ids.
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Filters and preferences for [`ProviderRegistry::select_best_model`].
#[derive(Debug, Clone, Default)]
pub struct ModelCriteria {
    /// Only consider local (cost-free) models.
    pub prefer_local: bool,
    /// Upper bound on cost per 1K tokens.
    pub max_cost_per_1k: Option<f64>,
    /// Lower bound on maximum output tokens.
    pub min_max_tokens: Option<u32>,
}

/// Enabled providers built from configuration. Read-only after construction
/// apart from the write-once discovery cache.
pub struct ProviderRegistry {
    entries: Vec<ProviderEntry>,
}

impl ProviderRegistry {
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::new()
    }

    /// Build with built-in constructors only.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        Self::builder().build(config)
    }

    fn entry(&self, id: &str) -> Result<&ProviderEntry> {
        self.entries
            .iter()
            .find(|e| e.config.id == id)
            .ok_or_else(|| {
                LlmError::ConfigError(format!("No enabled provider with id '{}'", id))
            })
    }

    /// Adapter for `id`, running lazy model discovery on first use.
    pub async fn resolve(&self, id: &str) -> Result<Arc<dyn ProviderAdapter>> {
        let entry = self.entry(id)?;
        entry.catalog().await;
        Ok(Arc::clone(&entry.adapter))
    }

    /// Enabled provider ids in configuration order.
    pub fn list_enabled(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.config.id.clone()).collect()
    }

    pub fn provider_config(&self, id: &str) -> Option<&ProviderConfig> {
        self.entry(id).ok().map(|e| &e.config)
    }

    /// Configured plus discovered models of `id`.
    pub async fn list_models(&self, id: &str) -> Result<Vec<ModelSpec>> {
        Ok(self.entry(id)?.catalog().await.models.clone())
    }

    pub async fn model_spec(&self, provider: &str, model: &str) -> Option<ModelSpec> {
        let entry = self.entry(provider).ok()?;
        entry
            .catalog()
            .await
            .models
            .iter()
            .find(|m| m.id == model)
            .cloned()
    }

    /// Probe every enabled provider.
    pub async fn provider_status(&self) -> Vec<ProviderStatus> {
        let mut statuses = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let catalog = entry.catalog().await;
            let health = entry.adapter.health_check().await;
            let problem = health.err().or_else(|| catalog.discovery_error.clone());

            statuses.push(ProviderStatus {
                id: entry.config.id.clone(),
                provider_type: entry.config.adapter_kind().to_string(),
                available: problem.is_none(),
                local: entry.adapter.is_local(),
                models_count: catalog.models.len(),
                models: catalog
                    .models
                    .iter()
                    .take(STATUS_SAMPLE_MODELS)
                    .map(|m| m.id.clone())
                    .collect(),
                failure_kind: problem.as_ref().map(LlmError::kind),
                error: problem.map(|e| e.to_string()),
            });
        }
        statuses
    }

    /// Cheapest model meeting `criteria` across enabled providers.
    ///
    /// Ordering: local models first, then by cost ascending, then by maximum
    /// output tokens descending. Ties keep configuration order.
    pub async fn select_best_model(&self, criteria: &ModelCriteria) -> Option<(String, ModelSpec)> {
        let mut candidates = Vec::new();
        for entry in &self.entries {
            for model in &entry.catalog().await.models {
                let local = entry.adapter.is_local() || model.is_local();
                if criteria.prefer_local && !local {
                    continue;
                }
                let cost = model.cost_per_1k_tokens.unwrap_or(0.0);
                if criteria.max_cost_per_1k.is_some_and(|max| cost > max) {
                    continue;
                }
                if criteria.min_max_tokens.is_some_and(|min| model.max_tokens < min) {
                    continue;
                }
                candidates.push((local, cost, entry.config.id.clone(), model.clone()));
            }
        }

        candidates.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(a.1.total_cmp(&b.1))
                .then(b.3.max_tokens.cmp(&a.3.max_tokens))
        });
        candidates
            .into_iter()
            .next()
            .map(|(_, _, provider, model)| (provider, model))
    }

    /// Fallback chain described by `defaults`.
    ///
    /// A link without a model uses the provider's first available model.
    ///
    /// # Errors
    ///
    /// `ConfigError` when a link names a provider that is not enabled, a model
    /// the provider does not serve, or a provider with no models at all.
    pub async fn chain_from_defaults(&self, defaults: &DefaultsConfig) -> Result<FallbackChain> {
        let mut chain: Option<FallbackChain> = None;
        for link in defaults.links() {
            let models = self.list_models(&link.provider).await?;
            let model = match link.model {
                Some(model) => {
                    if !models.iter().any(|m| m.id == model) {
                        return Err(LlmError::ConfigError(format!(
                            "Model '{}' is not available from provider '{}'",
                            model, link.provider
                        )));
                    }
                    model
                }
                None => models
                    .first()
                    .map(|m| m.id.clone())
                    .ok_or_else(|| {
                        LlmError::ConfigError(format!(
                            "Provider '{}' has no models to fall back to",
                            link.provider
                        ))
                    })?,
            };

            chain = Some(match chain {
                None => FallbackChain::new(link.provider, model),
                Some(chain) => chain.then(link.provider, model),
            });
        }

        chain.ok_or_else(|| LlmError::ConfigError("Empty fallback chain".to_string()))
    }
}

//! Built-in provider adapter constructors.
//!
//! # Provider Types
//!
//! | Type id | Adapter | Default key variable |
//! |---------|---------|----------------------|
//! | `openrouter`, `open-router` | [`OpenAICompatibleProvider`] | `OPENROUTER_API_KEY` |
//! | `openai` | [`OpenAICompatibleProvider`] | `OPENAI_API_KEY` |
//! | `openai_compatible` | [`OpenAICompatibleProvider`] | none |
//! | `lm_studio`, `lmstudio`, `lm-studio`, `local` | [`LMStudioProvider`] | none |
//! | `mock` | [`MockProvider`] | none |
//!
//! A provider's type is its `type` field, or its `id` when `type` is absent.
//! When a cloud provider configures neither `api_key` nor `api_key_env`, the
//! default key variable of its type is used.
//!
//! # Example
//!
//! ```rust,ignore
//! use docmeta_llm::{ProviderConfig, ProviderFactory};
//!
//! std::env::set_var("OPENROUTER_API_KEY", "sk-or-...");
//! let config = ProviderConfig::new("openrouter", "https://openrouter.ai/api/v1");
//! let adapter = ProviderFactory::from_config(&config)?;
//! ```

use std::sync::Arc;

use crate::error::{LlmError, Result};
use crate::model_config::ProviderConfig;
use crate::providers::lmstudio::LMStudioProvider;
use crate::providers::mock::MockProvider;
use crate::providers::openai_compatible::OpenAICompatibleProvider;
use crate::traits::ProviderAdapter;

/// Constructor turning a provider configuration into an adapter.
pub type AdapterConstructor =
    Arc<dyn Fn(&ProviderConfig) -> Result<Arc<dyn ProviderAdapter>> + Send + Sync>;

/// Built-in provider types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    /// OpenRouter (cloud, many upstream models)
    OpenRouter,
    /// OpenAI (cloud)
    OpenAI,
    /// Any other OpenAI-compatible cloud endpoint
    OpenAICompatible,
    /// LM Studio (local OpenAI-compatible server)
    LMStudio,
    /// Mock provider (testing only)
    Mock,
}

impl ProviderType {
    /// Every type id recognised by [`ProviderType::from_str`].
    pub const BUILTIN_IDS: &'static [&'static str] = &[
        "openrouter",
        "open-router",
        "openai",
        "openai_compatible",
        "lm_studio",
        "lmstudio",
        "lm-studio",
        "local",
        "mock",
    ];

    /// Parse provider type from string (case-insensitive)
    ///
    /// # Examples
    ///
    /// ```
    /// use docmeta_llm::ProviderType;
    ///
    /// assert_eq!(ProviderType::from_str("openrouter"), Some(ProviderType::OpenRouter));
    /// assert_eq!(ProviderType::from_str("LM_STUDIO"), Some(ProviderType::LMStudio));
    /// assert_eq!(ProviderType::from_str("anthropic"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openrouter" | "open-router" => Some(Self::OpenRouter),
            "openai" => Some(Self::OpenAI),
            "openai_compatible" => Some(Self::OpenAICompatible),
            "lm_studio" | "lmstudio" | "lm-studio" | "local" => Some(Self::LMStudio),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }

    /// Environment variable consulted when no credential is configured.
    pub fn default_key_env(&self) -> Option<&'static str> {
        match self {
            Self::OpenRouter => Some("OPENROUTER_API_KEY"),
            Self::OpenAI => Some("OPENAI_API_KEY"),
            Self::OpenAICompatible | Self::LMStudio | Self::Mock => None,
        }
    }
}

/// Provider factory for creating adapters from configuration.
pub struct ProviderFactory;

impl ProviderFactory {
    /// Create the adapter named by the configuration's type.
    ///
    /// # Errors
    ///
    /// `ConfigError` for an unknown type or a missing cloud credential.
    pub fn from_config(config: &ProviderConfig) -> Result<Arc<dyn ProviderAdapter>> {
        let provider_type = ProviderType::from_str(config.adapter_kind()).ok_or_else(|| {
            LlmError::ConfigError(format!(
                "Unknown provider type '{}' for provider '{}'",
                config.adapter_kind(),
                config.id
            ))
        })?;
        Self::create(provider_type, config)
    }

    /// Create an adapter of a specific type.
    pub fn create(
        provider_type: ProviderType,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn ProviderAdapter>> {
        let mut config = config.clone();
        if config.api_key.is_none() && config.api_key_env.is_none() {
            config.api_key_env = provider_type.default_key_env().map(str::to_string);
        }

        match provider_type {
            ProviderType::OpenRouter | ProviderType::OpenAI | ProviderType::OpenAICompatible => {
                Ok(Arc::new(OpenAICompatibleProvider::from_config(config)?))
            }
            ProviderType::LMStudio => Ok(Arc::new(LMStudioProvider::from_config(config)?)),
            ProviderType::Mock => Ok(Arc::new(MockProvider::from_config(&config))),
        }
    }

    /// `(type id, constructor)` for every built-in type.
    pub fn builtin_constructors() -> Vec<(&'static str, AdapterConstructor)> {
        ProviderType::BUILTIN_IDS
            .iter()
            .filter_map(|id| ProviderType::from_str(id).map(|t| (*id, t)))
            .map(|(id, provider_type)| {
                let constructor: AdapterConstructor =
                    Arc::new(move |config: &ProviderConfig| Self::create(provider_type, config));
                (id, constructor)
            })
            .collect()
    }
}

//! LM Studio provider (local OpenAI-compatible server).
//!
//! LM Studio serves an OpenAI-compatible API on `http://localhost:1234/v1` by
//! default. No credential is needed, though a placeholder key such as
//! `lm-studio` is sent when configured. Models loaded in LM Studio are found
//! through `GET /v1/models` when auto-discovery is enabled; discovered models
//! carry no cost.
//!
//! # Environment Variables
//!
//! - `LMSTUDIO_HOST`: server URL used by [`LMStudioProvider::from_env`]
//!   (default: `http://localhost:1234`)

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::{LlmError, Result};
use crate::model_config::{merge_discovered, ModelSpec, ProviderConfig};
use crate::providers::openai_compatible::{
    build_client, chat_round_trip, discovered_specs, fetch_models,
};
use crate::traits::{CompletionRequest, ProviderAdapter, RawCompletion};

/// Default LM Studio host.
pub const DEFAULT_LMSTUDIO_HOST: &str = "http://localhost:1234";

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Local adapter for LM Studio.
#[derive(Debug)]
pub struct LMStudioProvider {
    client: Client,
    config: ProviderConfig,
    api_key: Option<String>,
}

impl LMStudioProvider {
    /// Create provider from configuration.
    ///
    /// An unresolvable key reference is tolerated: the local server does not
    /// check credentials.
    pub fn from_config(config: ProviderConfig) -> Result<Self> {
        let api_key = match config.resolve_api_key() {
            Ok(key) => key,
            Err(e) => {
                debug!(provider = %config.id, error = %e, "No API key for local provider");
                None
            }
        };
        let client = build_client(&config)?;

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    /// Provider `lm_studio` with auto-discovery against `LMSTUDIO_HOST`.
    pub fn from_env() -> Result<Self> {
        let host =
            std::env::var("LMSTUDIO_HOST").unwrap_or_else(|_| DEFAULT_LMSTUDIO_HOST.to_string());
        let base_url = format!("{}/v1", host.trim_end_matches('/'));
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(LlmError::ConfigError(format!(
                "LMSTUDIO_HOST must be an http(s) URL, got '{}'",
                host
            )));
        }
        Self::from_config(
            ProviderConfig::new("lm_studio", base_url)
                .with_api_key("lm-studio")
                .with_auto_discovery(),
        )
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }
}

#[async_trait]
impl ProviderAdapter for LMStudioProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn is_local(&self) -> bool {
        true
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
            self.api_key.as_deref(),
            None,
        )
        .await
        .map_err(|e| match e {
            LlmError::ProviderUnavailable(msg) => LlmError::ProviderUnavailable(format!(
                "{}. Is LM Studio running with a model loaded?",
                msg
            )),
            other => other,
        })?;

        let discovered = discovered_specs(response, None);
        debug!(count = discovered.len(), "Discovered LM Studio models");
        Ok(merge_discovered(&self.config.models, discovered))
    }

    async fn health_check(&self) -> Result<()> {
        let response = fetch_models(
            &self.client,
            self.config.api_base(),
            self.api_key.as_deref(),
            Some(HEALTH_CHECK_TIMEOUT),
        )
        .await?;

        if response.data.is_empty() {
            return Err(LlmError::ProviderUnavailable(format!(
                "LM Studio at {} has no models loaded",
                self.config.api_base()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, request), fields(provider = %self.config.id, model = %request.model))]
    async fn send(&self, request: &CompletionRequest) -> Result<RawCompletion> {
        chat_round_trip(
            &self.client,
            self.config.api_base(),
            self.api_key.as_deref(),
            request,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_from_config_without_key() {
        let config = ProviderConfig::new("lm_studio", "http://localhost:1234/v1")
            .with_api_key("${DOCMETA_UNSET_LOCAL_KEY}")
            .with_auto_discovery();
        let provider = LMStudioProvider::from_config(config).unwrap();
        assert!(provider.is_local());
        assert!(provider.configured_models().is_empty());
    }

    #[tokio::test]
    async fn test_static_models_without_discovery() {
        let config = ProviderConfig::new("local", "http://localhost:1234/v1")
            .with_model(ModelSpec::new("qwen2.5-7b-instruct"));
        let provider = LMStudioProvider::from_config(config).unwrap();
        let models = provider.list_models().await.unwrap();
        assert_eq!(models.len(), 1);
        assert!(models[0].is_local());
    }

    #[test]
    #[serial]
    fn test_from_env_host() {
        std::env::set_var("LMSTUDIO_HOST", "http://gpu-box:1234/");
        let provider = LMStudioProvider::from_env().unwrap();
        assert_eq!(provider.config().api_base(), "http://gpu-box:1234/v1");
        assert!(provider.config().auto_discover_models);
        std::env::remove_var("LMSTUDIO_HOST");
    }
}

//! Error types for provider calls and orchestration.
//!
//! # Failure Taxonomy
//!
//! Every failed attempt is classified into exactly one [`FailureKind`]. The
//! kind drives the retry and fallback decisions:
//!
//! | Error | Typical cause | Retried? |
//! |-------|---------------|----------|
//! | `ConfigError` | Unknown provider, model not served, bad config | No |
//! | `AuthError` | Missing/invalid credential (HTTP 401/402/403) | No |
//! | `RateLimited` | HTTP 429 | Yes, with backoff |
//! | `ProviderUnavailable` | Connect error, timeout, HTTP 408/5xx | Yes, with backoff |
//! | `ValidationError` | Empty or non-JSON content, HTTP 400/422 | No |
//! | `Unknown` | A job task panicked | No |
//!
//! Non-retryable failures still let the fallback orchestrator advance to the
//! next link of the chain; they only stop retries against the current link.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for provider and orchestration operations.
pub type Result<T> = std::result::Result<T, LlmError>;

// ============================================================================
// Failure Kind
// ============================================================================

/// Stable classification tag for a failed attempt.
///
/// Serialized in snake case (`rate_limit`, `provider_unavailable`, ...) for
/// error records and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Config,
    Auth,
    RateLimit,
    ProviderUnavailable,
    Validation,
    Unknown,
}

impl FailureKind {
    /// Stable snake-case code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }

    /// Only transient kinds are worth another attempt against the same link.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit | Self::ProviderUnavailable)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// LLM Error Types
// ============================================================================

/// Errors that can occur while talking to a provider or setting up a run.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    /// Configuration error (unknown provider, unresolvable chain, missing model).
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Provider unreachable, timed out, or returned a server error.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Response could not be turned into the expected structured payload.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Unknown error.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::ProviderUnavailable(format!("Request timed out: {}", err))
        } else if err.is_connect() {
            LlmError::ProviderUnavailable(format!("Connection failed: {}", err))
        } else if err.is_decode() {
            LlmError::ValidationError(format!("Failed to decode response: {}", err))
        } else if err.is_builder() {
            LlmError::ConfigError(format!("Invalid request: {}", err))
        } else {
            LlmError::ProviderUnavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::ValidationError(format!("Invalid JSON: {}", err))
    }
}

impl LlmError {
    /// Classification tag of this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::ConfigError(_) => FailureKind::Config,
            Self::AuthError(_) => FailureKind::Auth,
            Self::RateLimited(_) => FailureKind::RateLimit,
            Self::ProviderUnavailable(_) => FailureKind::ProviderUnavailable,
            Self::ValidationError(_) => FailureKind::Validation,
            Self::Unknown(_) => FailureKind::Unknown,
        }
    }

    /// Stable string code, e.g. `"rate_limit"`.
    pub fn code(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Message without the display prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::ConfigError(m)
            | Self::AuthError(m)
            | Self::RateLimited(m)
            | Self::ProviderUnavailable(m)
            | Self::ValidationError(m)
            | Self::Unknown(m) => m,
        }
    }

    /// True for rate limiting and provider unavailability.
    ///
    /// # Example
    ///
    /// ```
    /// use docmeta_llm::LlmError;
    ///
    /// assert!(LlmError::RateLimited("slow down".to_string()).is_retryable());
    /// assert!(!LlmError::AuthError("bad key".to_string()).is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Get a user-friendly description of the error with suggested action.
    pub fn user_description(&self) -> String {
        match self {
            Self::ConfigError(msg) => format!("Configuration error: {}.", msg),
            Self::AuthError(_) => {
                "Authentication failed. Check that the provider API key is set and valid."
                    .to_string()
            }
            Self::RateLimited(_) => "Rate limited by the provider. Backing off...".to_string(),
            Self::ProviderUnavailable(_) => {
                "Provider is unreachable or overloaded. Retrying or falling back...".to_string()
            }
            Self::ValidationError(msg) => {
                format!("The model response was not usable structured data: {}", msg)
            }
            Self::Unknown(msg) => format!("An unexpected error occurred: {}", msg),
        }
    }
}

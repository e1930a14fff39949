//! Provider seam — the external LLM call behind the pipeline.
//!
//! The orchestration layer only cares about the shape of the call and
//! the class of each failure:
//!
//! ```text
//! invoke(model, fields, payload)
//!   ├─ Ok(values)                  → merge + record_success
//!   ├─ Err(RateLimited)            → limiter backoff, re-attempt
//!   ├─ Err(Transient)              → bounded in-tier retry, then fallback
//!   ├─ Err(MalformedResponse)      → one in-tier retry, then fallback
//!   └─ Err(Rejected)               → no retry, fallback only if allowed
//! ```
//!
//! Prompt wording and provider-specific capabilities are deliberately
//! out of scope; [`http::HttpProvider`] is a generic JSON transport.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpProvider;

/// Enriched field values returned by a provider: field name → value.
pub type FieldValues = serde_json::Map<String, serde_json::Value>;

/// One enrichment request for one item against one model.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderRequest {
    /// Stable item identity (checkpoint key).
    pub item_id: String,
    /// Model identifier resolved by the tier router.
    pub model: String,
    /// Fields the provider should fill in.
    pub fields: Vec<String>,
    /// Item payload: source record plus the current accumulator.
    pub payload: serde_json::Value,
    /// Output size cap for this tier.
    pub max_output_tokens: u32,
    /// Sampling temperature for this tier.
    pub temperature: f32,
}

/// Provider failure, classified for the retry/fallback machinery.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Provider throttled the request. Feeds the rate limiter's
    /// backoff; never counted as an item failure.
    #[error("rate limited{}", retry_after_ms.map(|ms| format!(" (retry after {ms}ms)")).unwrap_or_default())]
    RateLimited { retry_after_ms: Option<u64> },

    /// Network trouble, 5xx, or a request timeout.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Provider answered, but the body could not be parsed.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Provider refused the input (invalid request, policy refusal).
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Coarse error class used by retry and fallback policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    RateLimited,
    Transient,
    MalformedResponse,
    Rejected,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Transient => write!(f, "transient"),
            Self::MalformedResponse => write!(f, "malformed_response"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl ProviderError {
    /// The class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::Transient(_) => ErrorClass::Transient,
            Self::MalformedResponse(_) => ErrorClass::MalformedResponse,
            Self::Rejected(_) => ErrorClass::Rejected,
        }
    }
}

/// Serializable record of the last error for an item/tier pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierError {
    pub class: ErrorClass,
    pub message: String,
}

impl TierError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

impl From<&ProviderError> for TierError {
    fn from(err: &ProviderError) -> Self {
        Self::new(err.class(), err.to_string())
    }
}

impl std::fmt::Display for TierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.class, self.message)
    }
}

/// External enrichment provider.
///
/// Implementations must be safe to call from many concurrent workers;
/// admission pacing is the caller's job (the orchestrator holds a
/// [`RateLimiter`](crate::limiter::RateLimiter) permit across each call).
#[async_trait]
pub trait Provider: Send + Sync {
    /// Issue one enrichment request and return the field values.
    async fn invoke(&self, request: ProviderRequest) -> Result<FieldValues, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            ProviderError::RateLimited {
                retry_after_ms: None
            }
            .class(),
            ErrorClass::RateLimited
        );
        assert_eq!(
            ProviderError::Transient("timeout".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ProviderError::MalformedResponse("not json".into()).class(),
            ErrorClass::MalformedResponse
        );
        assert_eq!(
            ProviderError::Rejected("policy".into()).class(),
            ErrorClass::Rejected
        );
    }

    #[test]
    fn test_tier_error_from_provider_error() {
        let err = ProviderError::Rejected("invalid input".into());
        let tier_err = TierError::from(&err);
        assert_eq!(tier_err.class, ErrorClass::Rejected);
        assert!(tier_err.message.contains("invalid input"));
    }

    #[test]
    fn test_error_class_serde_roundtrip() {
        let json = serde_json::to_string(&ErrorClass::MalformedResponse).unwrap();
        assert_eq!(json, "\"malformed_response\"");
        let back: ErrorClass = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorClass::MalformedResponse);
    }

    #[test]
    fn test_rate_limited_display_includes_hint() {
        let err = ProviderError::RateLimited {
            retry_after_ms: Some(1500),
        };
        assert!(err.to_string().contains("1500ms"));
    }
}

//! Generic HTTP JSON provider.
//!
//! Posts the request as JSON to a single endpoint and maps the HTTP
//! surface onto the orchestration error taxonomy:
//!
//! - 429 → [`ProviderError::RateLimited`] (honoring `Retry-After`)
//! - 5xx → [`ProviderError::Transient`]
//! - other non-success → [`ProviderError::Rejected`]
//! - unparseable body → [`ProviderError::MalformedResponse`]
//!
//! The expected response body is a JSON object of field values, or an
//! object with a `values` key holding one.

use async_trait::async_trait;
use tracing::debug;

use crate::provider::{FieldValues, Provider, ProviderError, ProviderRequest};

/// Provider speaking plain JSON over HTTP.
pub struct HttpProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpProvider {
    /// Create a provider for `endpoint`.
    ///
    /// No request timeout is set on the client itself; the orchestrator
    /// wraps each call in its own configurable timeout.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::Transient(format!("http client build failed: {e}")))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key: None,
        })
    }

    /// Attach a bearer token to every request.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// `Retry-After` seconds → milliseconds, saturating on oversized
    /// header values rather than overflowing.
    fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
        headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(|secs| secs.saturating_mul(1000))
    }

    fn parse_values(body: &str) -> Result<FieldValues, ProviderError> {
        let value: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| ProviderError::MalformedResponse(format!("body is not JSON: {e}")))?;

        // Accept either {"values": {...}} or a bare object of fields.
        let object = match value {
            serde_json::Value::Object(mut map) => match map.remove("values") {
                Some(serde_json::Value::Object(inner)) => inner,
                Some(other) => {
                    return Err(ProviderError::MalformedResponse(format!(
                        "'values' is not an object: {other}"
                    )))
                }
                None => map,
            },
            other => {
                return Err(ProviderError::MalformedResponse(format!(
                    "expected a JSON object, got: {other}"
                )))
            }
        };

        Ok(object)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn invoke(&self, request: ProviderRequest) -> Result<FieldValues, ProviderError> {
        debug!(
            item = %request.item_id,
            model = %request.model,
            fields = request.fields.len(),
            "dispatching enrichment request"
        );

        let mut builder = self.http.post(&self.endpoint).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_ms: Self::retry_after_ms(response.headers()),
            });
        }
        if status.is_server_error() {
            return Err(ProviderError::Transient(format!(
                "provider returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected(format!(
                "provider returned {status}: {body}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("body read failed: {e}")))?;
        Self::parse_values(&body)
    }
}

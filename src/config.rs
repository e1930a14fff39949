//! Pipeline configuration.
//!
//! Loaded from TOML (or built in code), validated before any request is
//! issued. Structural problems — an empty tier table, a fallback chain
//! naming an unknown tier, a zero rate budget — are fatal here, not
//! discovered mid-run.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{EnrichError, EnrichResult};
use crate::fallback::FallbackPolicy;
use crate::limiter::RateLimitConfig;
use crate::router::{TierRouter, TierSpec};

/// In-tier retry budgets per error class.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Transient failures (network, 5xx, timeout) retried in-tier.
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
    /// Malformed responses get one in-tier retry by default.
    #[serde(default = "default_max_malformed_retries")]
    pub max_malformed_retries: u32,
    /// Safety cap on consecutive rate-limit hits for one attempt; past
    /// it the attempt degrades to a transient failure instead of
    /// spinning forever against a throttled provider.
    #[serde(default = "default_max_rate_limit_hits")]
    pub max_rate_limit_hits: u32,
}

fn default_max_transient_retries() -> u32 {
    2
}
fn default_max_malformed_retries() -> u32 {
    1
}
fn default_max_rate_limit_hits() -> u32 {
    10
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: default_max_transient_retries(),
            max_malformed_retries: default_max_malformed_retries(),
            max_rate_limit_hits: default_max_rate_limit_hits(),
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Run identity; checkpoints are keyed by it. Generated when absent.
    #[serde(default = "default_run_id")]
    pub run_id: String,
    /// Tier table: fields, models, request shape.
    pub tiers: Vec<TierSpec>,
    /// Primary pass order; defaults to tier table order.
    #[serde(default)]
    pub primary_order: Option<Vec<String>>,
    /// Fallback chain and limits. An empty chain defaults to the
    /// primary order reversed (cheapest-last becomes first fallback).
    #[serde(default)]
    pub fallback: FallbackPolicy,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per provider-call timeout; a timeout is a transient error.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Checkpoint file; no path means no resumability.
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
    /// Output fields to enrich; defaults to every configured field.
    #[serde(default)]
    pub requested_fields: Option<Vec<String>>,
    /// Provider endpoint for the HTTP provider (binary only; library
    /// callers inject their own provider).
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl PipelineConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> EnrichResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| EnrichError::config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration; called again by the orchestrator as
    /// a pre-flight check.
    pub fn validate(&self) -> EnrichResult<()> {
        let router = self.router()?;
        for tier in &self.fallback.chain {
            if router.tier(tier).is_none() {
                return Err(EnrichError::config(format!(
                    "fallback chain names unknown tier '{tier}'"
                )));
            }
        }
        if self.rate_limit.requests_per_window == 0 {
            return Err(EnrichError::config("rate limit budget must be at least 1"));
        }
        if self.rate_limit.window_ms == 0 {
            return Err(EnrichError::config("rate limit window must be non-zero"));
        }
        if let Some(ref fields) = self.requested_fields {
            // Routability check up front, so a bad field list aborts
            // before any request.
            router.route(fields)?;
        }
        Ok(())
    }

    /// Build the tier router from this configuration.
    pub fn router(&self) -> EnrichResult<TierRouter> {
        TierRouter::new(self.tiers.clone(), self.primary_order.clone())
    }

    /// The effective fallback policy: an empty configured chain
    /// defaults to the primary order reversed.
    pub fn effective_fallback(&self, router: &TierRouter) -> FallbackPolicy {
        if !self.fallback.chain.is_empty() {
            return self.fallback.clone();
        }
        let mut chain: Vec<String> = router.primary_order().to_vec();
        chain.reverse();
        FallbackPolicy {
            chain,
            ..self.fallback.clone()
        }
    }

    /// The fields this run enriches.
    pub fn requested_fields(&self, router: &TierRouter) -> Vec<String> {
        self.requested_fields
            .clone()
            .unwrap_or_else(|| router.all_fields())
    }
}

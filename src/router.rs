//! Tier classification and model routing.
//!
//! Each output field belongs to exactly one complexity tier; a tier
//! resolves to a model identifier plus request-shaping parameters
//! (batch size, concurrency, token budget, temperature). The router
//! turns a requested field subset into per-tier plans in the
//! caller-configured primary order — which is deliberately distinct
//! from the fallback order.
//!
//! Fields no tier covers are a configuration error, surfaced before any
//! request is issued, never as a per-item failure.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EnrichError, EnrichResult};

/// One complexity tier: its fields, model, and request shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSpec {
    /// Tier name, unique (e.g. "simple", "medium", "complex").
    pub name: String,
    /// Model identifier handed to the provider.
    pub model: String,
    /// Output fields this tier owns.
    pub fields: Vec<String>,
    /// Items per chunk when this tier runs.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Concurrent workers within a chunk.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Output token cap per request.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Average token cost per field, for cost estimation.
    #[serde(default = "default_avg_tokens_per_field")]
    pub avg_tokens_per_field: u32,
}

fn default_max_batch_size() -> usize {
    10
}
fn default_max_concurrency() -> usize {
    4
}
fn default_max_output_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.2
}
fn default_avg_tokens_per_field() -> u32 {
    80
}

/// Routing outcome for one tier: the fields to request and the spec to
/// request them with.
#[derive(Debug, Clone)]
pub struct TierPlan {
    pub tier: TierSpec,
    pub fields: Vec<String>,
}

/// Maps requested fields onto tiers and models.
#[derive(Debug, Clone)]
pub struct TierRouter {
    tiers: Vec<TierSpec>,
    primary_order: Vec<String>,
}

impl TierRouter {
    /// Build a router, validating the tier table.
    ///
    /// `primary_order` defaults to configuration order when `None`.
    /// Fails on duplicate tier names, a field owned by more than one
    /// tier, an empty table, or an order naming an unknown tier.
    pub fn new(tiers: Vec<TierSpec>, primary_order: Option<Vec<String>>) -> EnrichResult<Self> {
        if tiers.is_empty() {
            return Err(EnrichError::config("no tiers configured"));
        }

        let mut owners: HashMap<&str, &str> = HashMap::new();
        let mut names: BTreeSet<&str> = BTreeSet::new();
        for tier in &tiers {
            if tier.name.is_empty() {
                return Err(EnrichError::config("tier with empty name"));
            }
            if !names.insert(&tier.name) {
                return Err(EnrichError::config(format!(
                    "duplicate tier name '{}'",
                    tier.name
                )));
            }
            if tier.max_batch_size == 0 || tier.max_concurrency == 0 {
                return Err(EnrichError::config(format!(
                    "tier '{}' has a zero batch size or concurrency",
                    tier.name
                )));
            }
            for field in &tier.fields {
                if let Some(other) = owners.insert(field, &tier.name) {
                    return Err(EnrichError::config(format!(
                        "field '{field}' belongs to both tier '{other}' and tier '{}'",
                        tier.name
                    )));
                }
            }
        }

        let primary_order = match primary_order {
            Some(order) => {
                for name in &order {
                    if !names.contains(name.as_str()) {
                        return Err(EnrichError::config(format!(
                            "primary order names unknown tier '{name}'"
                        )));
                    }
                }
                order
            }
            None => tiers.iter().map(|t| t.name.clone()).collect(),
        };

        Ok(Self {
            tiers,
            primary_order,
        })
    }

    /// Plans for each tier owning at least one requested field, in
    /// primary order. Unroutable fields abort the run.
    pub fn route(&self, requested: &[String]) -> EnrichResult<Vec<TierPlan>> {
        let mut unrouted: BTreeSet<&String> = requested.iter().collect();
        let mut plans = Vec::new();

        for name in &self.primary_order {
            let tier = self.tier(name).expect("primary order validated");
            let fields: Vec<String> = tier
                .fields
                .iter()
                .filter(|f| unrouted.remove(f))
                .cloned()
                .collect();
            if !fields.is_empty() {
                debug!(tier = %tier.name, model = %tier.model, fields = fields.len(), "tier routed");
                plans.push(TierPlan {
                    tier: tier.clone(),
                    fields,
                });
            }
        }

        if !unrouted.is_empty() {
            return Err(EnrichError::UnroutableFields {
                fields: unrouted.into_iter().cloned().collect(),
            });
        }
        Ok(plans)
    }

    /// Look up a tier by name.
    pub fn tier(&self, name: &str) -> Option<&TierSpec> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// The configured primary pass order.
    pub fn primary_order(&self) -> &[String] {
        &self.primary_order
    }

    /// Every field owned by any tier, in tier order.
    pub fn all_fields(&self) -> Vec<String> {
        self.tiers
            .iter()
            .flat_map(|t| t.fields.iter().cloned())
            .collect()
    }
}

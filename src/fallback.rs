//! Cross-tier fallback on enrichment failure.
//!
//! When a tier fails for an item, the coordinator walks the configured
//! chain — conventionally from more to less capable tiers — re-invoking
//! the per-item attempt until one succeeds or the hop budget runs out.
//! The chain order is pure configuration: nothing here hard-codes a
//! downward direction, so an operator may route transient failures back
//! through a higher tier if that suits their cost profile.
//!
//! Fallback attempts flow through the same rate limiter and checkpoint
//! discipline as primary attempts; the attempt closure supplied by the
//! orchestrator carries that context. A chain that runs dry marks the
//! pair `FallbackExhausted` — a partial failure, never a run abort.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::provider::{ErrorClass, FieldValues, TierError};

/// Fallback configuration: the ordered tier chain and its limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackPolicy {
    /// Ordered tier names to retry against. A failed tier falls back to
    /// the entries after it; a tier absent from the chain falls back
    /// from the chain's start.
    #[serde(default)]
    pub chain: Vec<String>,
    /// Maximum fallback hops per item failure.
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    /// Whether `rejected` errors may fall back at all. They are never
    /// retried within the failing tier.
    #[serde(default = "default_on_rejected")]
    pub on_rejected: bool,
}

fn default_max_hops() -> usize {
    2
}
fn default_on_rejected() -> bool {
    true
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            chain: Vec::new(),
            max_hops: default_max_hops(),
            on_rejected: default_on_rejected(),
        }
    }
}

impl FallbackPolicy {
    /// Whether an error of `class` is eligible to trigger fallback.
    pub fn is_eligible(&self, class: ErrorClass) -> bool {
        match class {
            ErrorClass::Transient | ErrorClass::RateLimited | ErrorClass::MalformedResponse => true,
            ErrorClass::Rejected => self.on_rejected,
        }
    }

    /// Chain tiers to try after `failed_tier`, in order. The failed
    /// tier itself is never returned, so it cannot run twice from the
    /// same failure.
    pub fn tiers_after<'a>(&'a self, failed_tier: &'a str) -> impl Iterator<Item = &'a str> {
        let start = self
            .chain
            .iter()
            .position(|t| t == failed_tier)
            .map(|pos| pos + 1)
            .unwrap_or(0);
        self.chain[start.min(self.chain.len())..]
            .iter()
            .map(String::as_str)
            .filter(move |t| *t != failed_tier)
    }
}

/// Terminal outcome of a fallback walk.
#[derive(Debug, Clone)]
pub enum FallbackOutcome {
    /// A chain tier produced values.
    Recovered {
        values: FieldValues,
        served_by: String,
        hops: usize,
    },
    /// The error class was not fallback-eligible; the original failure
    /// stands.
    NotEligible { error: TierError },
    /// The chain (or hop budget) ran out without a success.
    Exhausted { last_error: TierError, hops: usize },
}

/// Walks the fallback chain for one failed item/tier pair.
pub struct FallbackCoordinator {
    policy: FallbackPolicy,
}

impl FallbackCoordinator {
    pub fn new(policy: FallbackPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &FallbackPolicy {
        &self.policy
    }

    /// Attempt recovery for `item_id` after `failed_tier` failed with
    /// `error`. `attempt` re-invokes the tier pipeline for this single
    /// item against the named tier (limiter-gated, checkpoint-aware).
    pub async fn recover<F, Fut>(
        &self,
        item_id: &str,
        failed_tier: &str,
        error: &TierError,
        attempt: F,
    ) -> FallbackOutcome
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<FieldValues, TierError>>,
    {
        if !self.policy.is_eligible(error.class) {
            debug!(
                item = item_id,
                tier = failed_tier,
                class = %error.class,
                "error class not fallback-eligible"
            );
            return FallbackOutcome::NotEligible {
                error: error.clone(),
            };
        }

        let mut last_error = error.clone();
        let mut hops = 0usize;

        for tier in self.policy.tiers_after(failed_tier) {
            if hops >= self.policy.max_hops {
                warn!(
                    item = item_id,
                    tier = failed_tier,
                    hops,
                    "fallback hop budget consumed"
                );
                break;
            }
            hops += 1;
            debug!(item = item_id, from = failed_tier, to = tier, hop = hops, "falling back");

            match attempt(tier.to_string()).await {
                Ok(values) => {
                    info!(item = item_id, from = failed_tier, served_by = tier, hops, "fallback recovered");
                    return FallbackOutcome::Recovered {
                        values,
                        served_by: tier.to_string(),
                        hops,
                    };
                }
                Err(err) => {
                    let eligible = self.policy.is_eligible(err.class);
                    last_error = err;
                    if !eligible {
                        // A non-eligible failure mid-chain stops the walk.
                        break;
                    }
                }
            }
        }

        warn!(
            item = item_id,
            tier = failed_tier,
            hops,
            last_error = %last_error,
            "fallback chain exhausted"
        );
        FallbackOutcome::Exhausted { last_error, hops }
    }
}

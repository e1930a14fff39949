//! Pre-flight cost estimation.
//!
//! A pure function of item count and tier configuration: projected
//! request counts and a per-tier average-token heuristic, summed into a
//! total. Never issues a request, so it is safe to call standalone and
//! repeatedly.

use serde::Serialize;

use crate::error::EnrichResult;
use crate::router::TierRouter;

/// Projected cost for one tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierCost {
    pub tier: String,
    pub model: String,
    /// One request per item on this tier.
    pub requests: usize,
    pub fields_per_item: usize,
    /// `items × fields × avg_tokens_per_field`
    pub estimated_tokens: u64,
}

/// Projected cost for a whole run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEstimate {
    pub item_count: usize,
    pub per_tier: Vec<TierCost>,
    pub total_requests: usize,
    pub total_tokens: u64,
}

/// Estimate the cost of enriching `item_count` items for the
/// `requested` fields.
pub fn estimate_cost(
    item_count: usize,
    router: &TierRouter,
    requested: &[String],
) -> EnrichResult<CostEstimate> {
    let plans = router.route(requested)?;

    let per_tier: Vec<TierCost> = plans
        .iter()
        .map(|plan| {
            let fields_per_item = plan.fields.len();
            TierCost {
                tier: plan.tier.name.clone(),
                model: plan.tier.model.clone(),
                requests: item_count,
                fields_per_item,
                estimated_tokens: item_count as u64
                    * fields_per_item as u64
                    * plan.tier.avg_tokens_per_field as u64,
            }
        })
        .collect();

    let total_requests = per_tier.iter().map(|t| t.requests).sum();
    let total_tokens = per_tier.iter().map(|t| t.estimated_tokens).sum();

    Ok(CostEstimate {
        item_count,
        per_tier,
        total_requests,
        total_tokens,
    })
}

impl std::fmt::Display for CostEstimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Estimated cost for {} items:", self.item_count)?;
        for tier in &self.per_tier {
            writeln!(
                f,
                "  {} ({}): {} requests, ~{} tokens",
                tier.tier, tier.model, tier.requests, tier.estimated_tokens
            )?;
        }
        write!(
            f,
            "Total: {} requests, ~{} tokens",
            self.total_requests, self.total_tokens
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::TierSpec;

    fn router() -> TierRouter {
        let tiers = vec![
            TierSpec {
                name: "simple".into(),
                model: "small".into(),
                fields: vec!["genre".into(), "year".into()],
                max_batch_size: 10,
                max_concurrency: 4,
                max_output_tokens: 256,
                temperature: 0.2,
                avg_tokens_per_field: 50,
            },
            TierSpec {
                name: "complex".into(),
                model: "large".into(),
                fields: vec!["summary".into()],
                max_batch_size: 5,
                max_concurrency: 2,
                max_output_tokens: 1024,
                temperature: 0.4,
                avg_tokens_per_field: 400,
            },
        ];
        TierRouter::new(tiers, None).unwrap()
    }

    fn all_fields() -> Vec<String> {
        vec!["genre".into(), "year".into(), "summary".into()]
    }

    #[test]
    fn test_estimate_arithmetic() {
        let estimate = estimate_cost(100, &router(), &all_fields()).unwrap();
        assert_eq!(estimate.per_tier.len(), 2);
        assert_eq!(estimate.per_tier[0].requests, 100);
        assert_eq!(estimate.per_tier[0].estimated_tokens, 100 * 2 * 50);
        assert_eq!(estimate.per_tier[1].estimated_tokens, 100 * 1 * 400);
        assert_eq!(estimate.total_requests, 200);
        assert_eq!(estimate.total_tokens, 10_000 + 40_000);
    }

    #[test]
    fn test_estimate_is_deterministic() {
        let router = router();
        let a = estimate_cost(42, &router, &all_fields()).unwrap();
        let b = estimate_cost(42, &router, &all_fields()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_estimate_skips_unrequested_tiers() {
        let estimate = estimate_cost(10, &router(), &["genre".to_string()]).unwrap();
        assert_eq!(estimate.per_tier.len(), 1);
        assert_eq!(estimate.per_tier[0].tier, "simple");
        assert_eq!(estimate.per_tier[0].fields_per_item, 1);
    }

    #[test]
    fn test_estimate_surfaces_unroutable_fields() {
        assert!(estimate_cost(10, &router(), &["bpm".to_string()]).is_err());
    }

    #[test]
    fn test_zero_items() {
        let estimate = estimate_cost(0, &router(), &all_fields()).unwrap();
        assert_eq!(estimate.total_requests, 0);
        assert_eq!(estimate.total_tokens, 0);
    }
}

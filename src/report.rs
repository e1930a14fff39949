//! Run reports.
//!
//! The final report enumerates per-tier tallies and every failed or
//! fallback-exhausted item with its last error, so a caller can re-run
//! just those items against a fresh checkpoint.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::checkpoint::{Checkpoint, TierStatus};
use crate::item::EnrichItem;
use crate::provider::TierError;

/// Per-tier outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierTally {
    pub succeeded: usize,
    pub failed: usize,
    pub fallback_exhausted: usize,
}

/// One item/tier pair that ended in failure.
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub item_id: String,
    pub tier: String,
    pub status: TierStatus,
    pub error: Option<TierError>,
}

/// Aggregate outcome of an enrichment run.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentReport {
    pub run_id: String,
    pub items: usize,
    pub per_tier: BTreeMap<String, TierTally>,
    pub succeeded: usize,
    pub failed: usize,
    pub fallback_exhausted: usize,
    /// Failed/exhausted pairs with their last errors.
    pub failures: Vec<ItemFailure>,
    pub elapsed_ms: u64,
    /// Set when the run stopped on the shared cancellation signal.
    pub cancelled: bool,
}

impl EnrichmentReport {
    /// Aggregate a report from the final checkpoint state.
    pub fn from_checkpoint(
        checkpoint: &Checkpoint,
        items: &[EnrichItem],
        elapsed_ms: u64,
        cancelled: bool,
    ) -> Self {
        let mut per_tier: BTreeMap<String, TierTally> = BTreeMap::new();
        let mut failures = Vec::new();

        for (item_id, tier, result) in checkpoint.iter_results() {
            let tally = per_tier.entry(tier.to_string()).or_default();
            match result.status {
                TierStatus::Succeeded => tally.succeeded += 1,
                TierStatus::Failed => {
                    tally.failed += 1;
                    failures.push(ItemFailure {
                        item_id: item_id.to_string(),
                        tier: tier.to_string(),
                        status: result.status,
                        error: result.last_error.clone(),
                    });
                }
                TierStatus::FallbackExhausted => {
                    tally.fallback_exhausted += 1;
                    failures.push(ItemFailure {
                        item_id: item_id.to_string(),
                        tier: tier.to_string(),
                        status: result.status,
                        error: result.last_error.clone(),
                    });
                }
                TierStatus::Pending | TierStatus::InProgress => {}
            }
        }

        let succeeded = per_tier.values().map(|t| t.succeeded).sum();
        let failed = per_tier.values().map(|t| t.failed).sum();
        let fallback_exhausted = per_tier.values().map(|t| t.fallback_exhausted).sum();

        Self {
            run_id: checkpoint.run_id.clone(),
            items: items.len(),
            per_tier,
            succeeded,
            failed,
            fallback_exhausted,
            failures,
            elapsed_ms,
            cancelled,
        }
    }
}

impl std::fmt::Display for EnrichmentReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Run: {} ({} items)", self.run_id, self.items)?;
        for (tier, tally) in &self.per_tier {
            writeln!(
                f,
                "  {tier}: {} succeeded, {} failed, {} exhausted",
                tally.succeeded, tally.failed, tally.fallback_exhausted
            )?;
        }
        writeln!(
            f,
            "Totals: {} succeeded, {} failed, {} exhausted",
            self.succeeded, self.failed, self.fallback_exhausted
        )?;
        write!(f, "Elapsed: {}ms", self.elapsed_ms)?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

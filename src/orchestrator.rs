//! Enrichment run orchestration.
//!
//! Drives the whole pipeline: pre-flight validation, optional cost
//! estimation, checkpoint load, rate-limited tier passes through the
//! batch executor, fallback on failure, checkpoint persistence after
//! every chunk, and the final report.
//!
//! ```text
//! run(items)
//!   ├─ validate config (fatal before any request)
//!   ├─ load checkpoint (succeeded pairs taken as given)
//!   ├─ for tier in primary order:
//!   │    pending items ─► BatchExecutor chunks
//!   │      worker: limiter.acquire → provider.invoke (timeout) → retry policy
//!   │      failures ─► FallbackCoordinator
//!   │      after every chunk: checkpoint persist + progress
//!   └─ report (per-tier tallies, failures, elapsed)
//! ```
//!
//! Cancellation is a single shared [`CancelToken`]: once set, no new
//! chunk or tier is scheduled, the in-flight chunk finishes so
//! checkpoint state stays consistent, and a final checkpoint is
//! persisted before the report is returned.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::batch::{BatchExecutor, BatchHooks, BatchOptions, BatchProgress, ProgressHook};
use crate::checkpoint::{Checkpoint, CheckpointStore, TierResult, TierStatus};
use crate::config::PipelineConfig;
use crate::error::{EnrichError, EnrichResult};
use crate::estimate::{estimate_cost, CostEstimate};
use crate::fallback::{FallbackCoordinator, FallbackOutcome};
use crate::item::{DefaultMapper, EnrichItem, FieldMapper};
use crate::limiter::RateLimiter;
use crate::provider::{ErrorClass, FieldValues, Provider, ProviderError, ProviderRequest, TierError};
use crate::report::EnrichmentReport;
use crate::router::{TierRouter, TierSpec};

/// Shared cancellation signal for a run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Cloneable slice of one item handed to chunk workers.
#[derive(Debug, Clone)]
struct WorkUnit {
    index: usize,
    id: String,
    payload: serde_json::Value,
}

/// Top-level pipeline driver.
pub struct EnrichmentOrchestrator {
    config: PipelineConfig,
    router: TierRouter,
    fallback: FallbackCoordinator,
    provider: Arc<dyn Provider>,
    mapper: Arc<dyn FieldMapper>,
    limiter: Arc<RateLimiter>,
    store: Option<CheckpointStore>,
    cancel: CancelToken,
    on_progress: Option<ProgressHook>,
}

impl EnrichmentOrchestrator {
    /// Build an orchestrator, validating the configuration up front.
    pub fn new(config: PipelineConfig, provider: Arc<dyn Provider>) -> EnrichResult<Self> {
        config.validate()?;
        let router = config.router()?;
        let fallback = FallbackCoordinator::new(config.effective_fallback(&router));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let store = config.checkpoint_path.as_ref().map(CheckpointStore::new);
        Ok(Self {
            config,
            router,
            fallback,
            provider,
            mapper: Arc::new(DefaultMapper),
            limiter,
            store,
            cancel: CancelToken::new(),
            on_progress: None,
        })
    }

    /// Replace the default field mapper.
    pub fn with_mapper(mut self, mapper: Arc<dyn FieldMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    /// Attach a run-wide progress callback (chunk granularity).
    pub fn with_progress(mut self, hook: ProgressHook) -> Self {
        self.on_progress = Some(hook);
        self
    }

    /// Handle for cancelling this run from another task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Rate limiter snapshot, for observability.
    pub async fn limiter_snapshot(&self) -> crate::limiter::LimiterSnapshot {
        self.limiter.snapshot().await
    }

    /// Project run cost without issuing any request.
    pub fn estimate(&self, item_count: usize) -> EnrichResult<CostEstimate> {
        let requested = self.config.requested_fields(&self.router);
        estimate_cost(item_count, &self.router, &requested)
    }

    /// Run the pipeline over `items`, merging enriched values into each
    /// item's accumulator in place.
    pub async fn run(&self, items: &mut [EnrichItem]) -> EnrichResult<EnrichmentReport> {
        let started = std::time::Instant::now();

        // Pre-flight: structural errors abort before any request.
        self.config.validate()?;
        let mut seen = HashSet::new();
        for item in items.iter() {
            if !seen.insert(item.id.clone()) {
                return Err(EnrichError::DuplicateItemId(item.id.clone()));
            }
        }
        let requested = self.config.requested_fields(&self.router);
        let plans = self.router.route(&requested)?;

        let mut checkpoint = self.load_checkpoint().await?;
        self.replay_succeeded(&checkpoint, items);

        // Pending (item, tier) pairs per plan, and the run-wide total
        // for progress reporting.
        let pending_per_plan: Vec<Vec<usize>> = plans
            .iter()
            .map(|plan| {
                items
                    .iter()
                    .enumerate()
                    .filter(|(_, item)| {
                        // Terminal pairs (succeeded or exhausted) are
                        // never re-run; failed and pending pairs are.
                        let terminal = checkpoint
                            .get(&item.id, &plan.tier.name)
                            .map(|r| r.status.is_terminal())
                            .unwrap_or(false);
                        !terminal && !self.mapper.missing_fields(item, &plan.fields).is_empty()
                    })
                    .map(|(index, _)| index)
                    .collect()
            })
            .collect();
        let total: usize = pending_per_plan.iter().map(Vec::len).sum();

        info!(
            run_id = %self.config.run_id,
            items = items.len(),
            pending_pairs = total,
            tiers = plans.len(),
            "enrichment run starting"
        );

        let mut processed = 0usize;
        let mut successful = 0usize;
        let mut failed = 0usize;
        let mut cancelled = false;

        'tiers: for (plan, pending) in plans.iter().zip(&pending_per_plan) {
            if pending.is_empty() {
                continue;
            }
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let tier = &plan.tier;
            info!(tier = %tier.name, model = %tier.model, items = pending.len(), "tier pass");
            let executor = BatchExecutor::new(BatchOptions {
                concurrency: tier.max_concurrency,
                chunk_size: tier.max_batch_size,
            });

            for chunk_indices in pending.chunks(tier.max_batch_size.max(1)) {
                if self.cancel.is_cancelled() {
                    cancelled = true;
                    break 'tiers;
                }

                let units: Vec<WorkUnit> = chunk_indices
                    .iter()
                    .map(|&index| WorkUnit {
                        index,
                        id: items[index].id.clone(),
                        payload: items[index].payload(),
                    })
                    .collect();

                let worker =
                    |unit: WorkUnit, _index: usize| self.attempt(tier, &plan.fields, unit);
                let outcomes = executor
                    .run_chunk(&units, 0, &worker, &BatchHooks::default())
                    .await;

                for (unit, outcome) in units.iter().zip(outcomes) {
                    let succeeded = self
                        .settle(&mut checkpoint, items, plan, unit, outcome)
                        .await?;
                    processed += 1;
                    if succeeded {
                        successful += 1;
                    } else {
                        failed += 1;
                    }
                }

                // A crash loses at most the chunk in flight.
                self.persist(&checkpoint).await?;
                if let Some(hook) = &self.on_progress {
                    hook(BatchProgress::new(processed, total, successful, failed));
                }
            }
        }

        if cancelled {
            warn!(run_id = %self.config.run_id, processed, total, "run cancelled");
            self.persist(&checkpoint).await?;
        }

        let report = EnrichmentReport::from_checkpoint(
            &checkpoint,
            items,
            started.elapsed().as_millis() as u64,
            cancelled,
        );
        info!(
            run_id = %report.run_id,
            succeeded = report.succeeded,
            failed = report.failed,
            fallback_exhausted = report.fallback_exhausted,
            "enrichment run finished"
        );
        Ok(report)
    }

    /// Settle one item's chunk outcome: merge + record on success,
    /// otherwise walk the fallback chain. Returns whether the pair
    /// ended succeeded.
    async fn settle(
        &self,
        checkpoint: &mut Checkpoint,
        items: &mut [EnrichItem],
        plan: &crate::router::TierPlan,
        unit: &WorkUnit,
        outcome: Result<FieldValues, TierError>,
    ) -> EnrichResult<bool> {
        let tier_name = &plan.tier.name;
        let mut result = self.resume_result(checkpoint, &unit.id, tier_name)?;
        result.attempts += 1;

        match outcome {
            Ok(values) => {
                self.mapper.merge(&mut items[unit.index], &values);
                result.succeed(values, tier_name)?;
                checkpoint.record(&unit.id, tier_name, result);
                Ok(true)
            }
            Err(error) => {
                result.fail(error.clone())?;

                let recovery = self
                    .fallback
                    .recover(&unit.id, tier_name, &error, |fallback_tier| {
                        let unit = unit.clone();
                        async move {
                            let spec = self.router.tier(&fallback_tier).ok_or_else(|| {
                                TierError::new(
                                    ErrorClass::Transient,
                                    format!("unknown fallback tier '{fallback_tier}'"),
                                )
                            })?;
                            self.attempt(spec, &plan.fields, unit).await
                        }
                    })
                    .await;

                let succeeded = match recovery {
                    FallbackOutcome::Recovered {
                        values,
                        served_by,
                        hops,
                    } => {
                        result.transition(TierStatus::InProgress)?;
                        result.attempts += hops as u32;
                        self.mapper.merge(&mut items[unit.index], &values);
                        result.succeed(values, &served_by)?;
                        true
                    }
                    FallbackOutcome::NotEligible { .. } => false,
                    FallbackOutcome::Exhausted { last_error, hops } => {
                        result.attempts += hops as u32;
                        result.exhaust(last_error)?;
                        false
                    }
                };
                checkpoint.record(&unit.id, tier_name, result);
                Ok(succeeded)
            }
        }
    }

    /// One enrichment attempt for one item against one tier, applying
    /// the in-tier retry policy. Rate-limit responses feed the limiter
    /// and are re-attempted after backoff without counting as failures.
    async fn attempt(
        &self,
        tier: &TierSpec,
        fields: &[String],
        unit: WorkUnit,
    ) -> Result<FieldValues, TierError> {
        let mut transient_left = self.config.retry.max_transient_retries;
        let mut malformed_left = self.config.retry.max_malformed_retries;
        let mut rate_limit_hits = 0u32;
        let per_request = Duration::from_millis(self.config.request_timeout_ms);

        loop {
            self.limiter.acquire().await;

            let request = ProviderRequest {
                item_id: unit.id.clone(),
                model: tier.model.clone(),
                fields: fields.to_vec(),
                payload: unit.payload.clone(),
                max_output_tokens: tier.max_output_tokens,
                temperature: tier.temperature,
            };

            let outcome = match timeout(per_request, self.provider.invoke(request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::Transient(format!(
                    "request timed out after {}ms",
                    self.config.request_timeout_ms
                ))),
            };

            match outcome {
                Ok(values) => {
                    self.limiter.record_success().await;
                    return Ok(values);
                }
                Err(ProviderError::RateLimited { retry_after_ms }) => {
                    let hint = retry_after_ms.map(Duration::from_millis);
                    self.limiter.record_failure(hint).await;
                    rate_limit_hits += 1;
                    if rate_limit_hits > self.config.retry.max_rate_limit_hits {
                        warn!(item = %unit.id, tier = %tier.name, hits = rate_limit_hits, "rate limit safety cap reached");
                        return Err(TierError::new(
                            ErrorClass::Transient,
                            "rate limit safety cap reached",
                        ));
                    }
                }
                Err(error @ ProviderError::Transient(_)) => {
                    if transient_left == 0 {
                        return Err(TierError::from(&error));
                    }
                    transient_left -= 1;
                    debug!(item = %unit.id, tier = %tier.name, error = %error, retries_left = transient_left, "transient failure; retrying in tier");
                }
                Err(error @ ProviderError::MalformedResponse(_)) => {
                    if malformed_left == 0 {
                        return Err(TierError::from(&error));
                    }
                    malformed_left -= 1;
                    debug!(item = %unit.id, tier = %tier.name, "malformed response; one retry");
                }
                Err(error @ ProviderError::Rejected(_)) => {
                    return Err(TierError::from(&error));
                }
            }
        }
    }

    /// Resume or start the pair's result, enforcing legal transitions.
    fn resume_result(
        &self,
        checkpoint: &Checkpoint,
        item_id: &str,
        tier: &str,
    ) -> EnrichResult<TierResult> {
        let mut result = checkpoint.get(item_id, tier).cloned().unwrap_or_default();
        result.transition(TierStatus::InProgress)?;
        Ok(result)
    }

    async fn load_checkpoint(&self) -> EnrichResult<Checkpoint> {
        if let Some(store) = &self.store {
            if let Some(checkpoint) = store.load().await? {
                if checkpoint.run_id == self.config.run_id {
                    info!(
                        run_id = %checkpoint.run_id,
                        items = checkpoint.entries.len(),
                        "resuming from checkpoint"
                    );
                    return Ok(checkpoint);
                }
                warn!(
                    found = %checkpoint.run_id,
                    expected = %self.config.run_id,
                    "checkpoint belongs to a different run; starting fresh"
                );
            }
        }
        Ok(Checkpoint::new(&self.config.run_id))
    }

    /// Merge values from succeeded checkpoint entries so resumed runs
    /// see the same accumulators an uninterrupted run would.
    fn replay_succeeded(&self, checkpoint: &Checkpoint, items: &mut [EnrichItem]) {
        for item in items.iter_mut() {
            if let Some(entry) = checkpoint.entries.get(&item.id) {
                for result in entry.tiers.values() {
                    if result.status == TierStatus::Succeeded {
                        if let Some(values) = &result.values {
                            self.mapper.merge(item, values);
                        }
                    }
                }
            }
        }
    }

    async fn persist(&self, checkpoint: &Checkpoint) -> EnrichResult<()> {
        if let Some(store) = &self.store {
            store.save(checkpoint).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::{BackoffStrategy, RateLimitConfig};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct CountingProvider {
        calls: AtomicUsize,
    }

    /// One scripted outcome per call, in order; succeeds once the
    /// script runs out.
    #[derive(Debug, Clone, Copy)]
    enum Step {
        Transient,
        Malformed,
        RateLimited,
        Hang,
    }

    struct SequenceProvider {
        script: std::sync::Mutex<std::collections::VecDeque<Step>>,
        calls: AtomicUsize,
    }

    impl SequenceProvider {
        fn new(script: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for SequenceProvider {
        async fn invoke(&self, request: ProviderRequest) -> Result<FieldValues, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front();
            match step {
                None => {
                    let mut values = FieldValues::new();
                    for field in &request.fields {
                        values.insert(field.clone(), json!(format!("{field}-value")));
                    }
                    Ok(values)
                }
                Some(Step::Transient) => Err(ProviderError::Transient("connection reset".into())),
                Some(Step::Malformed) => {
                    Err(ProviderError::MalformedResponse("not an object".into()))
                }
                Some(Step::RateLimited) => Err(ProviderError::RateLimited {
                    retry_after_ms: None,
                }),
                Some(Step::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(ProviderError::Transient("never reached".into()))
                }
            }
        }
    }

    #[async_trait]
    impl Provider for CountingProvider {
        async fn invoke(&self, request: ProviderRequest) -> Result<FieldValues, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut values = FieldValues::new();
            for field in &request.fields {
                values.insert(field.clone(), json!(format!("{field}-value")));
            }
            Ok(values)
        }
    }

    fn config() -> PipelineConfig {
        let raw = r#"
run_id = "test-run"

[[tiers]]
name = "simple"
model = "small"
fields = ["genre", "year"]

[[tiers]]
name = "complex"
model = "large"
fields = ["summary"]
"#;
        toml::from_str(raw).unwrap()
    }

    fn fast_limits(config: &mut PipelineConfig) {
        config.rate_limit = RateLimitConfig {
            requests_per_window: 1_000,
            window_ms: 60_000,
            strategy: BackoffStrategy::Fixed,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
        };
    }

    fn one_tier_config() -> PipelineConfig {
        let raw = r#"
run_id = "retry-run"

[[tiers]]
name = "simple"
model = "small"
fields = ["genre"]
"#;
        let mut config: PipelineConfig = toml::from_str(raw).unwrap();
        fast_limits(&mut config);
        config
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_enriches_all_items() {
        let mut cfg = config();
        fast_limits(&mut cfg);
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let orchestrator = EnrichmentOrchestrator::new(cfg, provider.clone()).unwrap();

        let mut items = vec![
            EnrichItem::new("a", json!({"title": "x"})),
            EnrichItem::new("b", json!({"title": "y"})),
        ];
        let report = orchestrator.run(&mut items).await.unwrap();

        assert_eq!(report.succeeded, 4); // 2 items × 2 tiers
        assert_eq!(report.failed, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
        assert_eq!(items[0].accumulator.get("genre").unwrap(), "genre-value");
        assert_eq!(items[1].accumulator.get("summary").unwrap(), "summary-value");
    }

    #[tokio::test]
    async fn test_populated_fields_are_not_requested() {
        let mut cfg = config();
        fast_limits(&mut cfg);
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let orchestrator = EnrichmentOrchestrator::new(cfg, provider.clone()).unwrap();

        let mut item = EnrichItem::new("a", json!({}));
        item.accumulator.insert("genre".into(), json!("jazz"));
        item.accumulator.insert("year".into(), json!(1959));
        let mut items = vec![item];

        let report = orchestrator.run(&mut items).await.unwrap();

        // Only the complex tier had missing fields.
        assert_eq!(report.succeeded, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(items[0].accumulator.get("genre").unwrap(), "jazz");
    }

    #[tokio::test]
    async fn test_unroutable_field_aborts_before_any_request() {
        let mut cfg = config();
        fast_limits(&mut cfg);
        cfg.requested_fields = Some(vec!["bpm".to_string()]);
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });

        let err = EnrichmentOrchestrator::new(cfg, provider.clone())
            .err()
            .expect("unroutable field must fail validation");
        assert!(matches!(err, EnrichError::UnroutableFields { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_item_ids_rejected() {
        let mut cfg = config();
        fast_limits(&mut cfg);
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let orchestrator = EnrichmentOrchestrator::new(cfg, provider.clone()).unwrap();

        let mut items = vec![
            EnrichItem::new("a", json!({})),
            EnrichItem::new("a", json!({})),
        ];
        let err = orchestrator.run(&mut items).await.unwrap_err();
        assert!(matches!(err, EnrichError::DuplicateItemId(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_does_nothing() {
        let mut cfg = config();
        fast_limits(&mut cfg);
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let orchestrator = EnrichmentOrchestrator::new(cfg, provider.clone()).unwrap();
        orchestrator.cancel_token().cancel();

        let mut items = vec![EnrichItem::new("a", json!({}))];
        let report = orchestrator.run(&mut items).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.succeeded, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_estimate_issues_no_requests() {
        let mut cfg = config();
        fast_limits(&mut cfg);
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let orchestrator = EnrichmentOrchestrator::new(cfg, provider.clone()).unwrap();

        let a = orchestrator.estimate(100).unwrap();
        let b = orchestrator.estimate(100).unwrap();
        assert_eq!(a, b);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_progress_fires_per_chunk_across_tiers() {
        let mut cfg = config();
        fast_limits(&mut cfg);
        cfg.tiers[0].max_batch_size = 2;
        cfg.tiers[1].max_batch_size = 2;
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });

        let seen: Arc<std::sync::Mutex<Vec<BatchProgress>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let orchestrator = EnrichmentOrchestrator::new(cfg, provider)
            .unwrap()
            .with_progress(Arc::new(move |p| sink.lock().unwrap().push(p)));

        let mut items: Vec<EnrichItem> = (0..3)
            .map(|i| EnrichItem::new(format!("item-{i}"), json!({})))
            .collect();
        orchestrator.run(&mut items).await.unwrap();

        let seen = seen.lock().unwrap();
        // 3 items × 2 tiers = 6 pairs; chunks of 2 → 2 per tier.
        assert_eq!(seen.len(), 4);
        let processed: Vec<usize> = seen.iter().map(|p| p.processed).collect();
        assert_eq!(processed, vec![2, 3, 5, 6]);
        assert!(seen.iter().all(|p| p.total == 6));
    }

    #[tokio::test]
    async fn test_mid_run_cancel_finishes_chunk_and_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.checkpoint.json");
        let mut cfg = config();
        fast_limits(&mut cfg);
        cfg.tiers[0].max_batch_size = 2;
        cfg.tiers[1].max_batch_size = 2;
        cfg.checkpoint_path = Some(path.clone());
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });

        let orchestrator = EnrichmentOrchestrator::new(cfg, provider.clone()).unwrap();
        // Cancel as soon as the first chunk reports progress.
        let cancel = orchestrator.cancel_token();
        let orchestrator = orchestrator.with_progress(Arc::new(move |_| cancel.cancel()));

        let mut items: Vec<EnrichItem> = (0..4)
            .map(|i| EnrichItem::new(format!("item-{i}"), json!({})))
            .collect();
        let report = orchestrator.run(&mut items).await.unwrap();

        assert!(report.cancelled);
        // The in-flight chunk finished; nothing further was scheduled.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 0);

        // The finished chunk made it to disk before the run returned.
        let checkpoint = CheckpointStore::new(&path).load().await.unwrap().unwrap();
        assert!(checkpoint.is_succeeded("item-0", "simple"));
        assert!(checkpoint.is_succeeded("item-1", "simple"));
        assert!(checkpoint.get("item-2", "simple").is_none());
        assert!(checkpoint.get("item-0", "complex").is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_retried_in_tier() {
        let provider = SequenceProvider::new(vec![Step::Transient]);
        let orchestrator =
            EnrichmentOrchestrator::new(one_tier_config(), provider.clone()).unwrap();

        let mut items = vec![EnrichItem::new("a", json!({}))];
        let report = orchestrator.run(&mut items).await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed + report.fallback_exhausted, 0);
        // First call failed, the in-tier retry succeeded; no fallback.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(items[0].accumulator.get("genre").unwrap(), "genre-value");
    }

    #[tokio::test]
    async fn test_transient_budget_bounds_retries() {
        // Default budget is two in-tier retries: three failures exhaust
        // the pair.
        let provider =
            SequenceProvider::new(vec![Step::Transient, Step::Transient, Step::Transient]);
        let orchestrator =
            EnrichmentOrchestrator::new(one_tier_config(), provider.clone()).unwrap();

        let mut items = vec![EnrichItem::new("a", json!({}))];
        let report = orchestrator.run(&mut items).await.unwrap();

        assert_eq!(report.succeeded, 0);
        assert_eq!(report.fallback_exhausted, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_malformed_response_gets_one_retry() {
        let provider = SequenceProvider::new(vec![Step::Malformed, Step::Malformed]);
        let orchestrator =
            EnrichmentOrchestrator::new(one_tier_config(), provider.clone()).unwrap();

        let mut items = vec![EnrichItem::new("a", json!({}))];
        let report = orchestrator.run(&mut items).await.unwrap();

        // Exactly one in-tier retry, then the pair leaves the tier.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.fallback_exhausted, 1);
        let failure = &report.failures[0];
        assert_eq!(
            failure.error.as_ref().unwrap().class,
            ErrorClass::MalformedResponse
        );
    }

    #[tokio::test]
    async fn test_rate_limited_reattempted_after_backoff() {
        let provider = SequenceProvider::new(vec![Step::RateLimited]);
        let orchestrator =
            EnrichmentOrchestrator::new(one_tier_config(), provider.clone()).unwrap();

        let mut items = vec![EnrichItem::new("a", json!({}))];
        let report = orchestrator.run(&mut items).await.unwrap();

        // Throttling is not an item failure: the call is re-issued
        // after backoff and succeeds.
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed + report.fallback_exhausted, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_is_transient_and_retried() {
        let mut cfg = one_tier_config();
        cfg.request_timeout_ms = 50;
        let provider = SequenceProvider::new(vec![Step::Hang]);
        let orchestrator = EnrichmentOrchestrator::new(cfg, provider.clone()).unwrap();

        let mut items = vec![EnrichItem::new("a", json!({}))];
        let report = orchestrator.run(&mut items).await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(items[0].accumulator.get("genre").unwrap(), "genre-value");
    }
}

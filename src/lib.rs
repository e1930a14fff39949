//! Tiered LLM Enrichment Pipeline
//!
//! This library enriches catalogs of records by routing each missing
//! output field to a complexity tier, and each tier to a model — cheap
//! models for simple fields, capable models for hard ones.
//!
//! # Features
//!
//! ## Routing
//! - `TierRouter`: maps requested fields onto tiers and models in a
//!   configurable primary order
//! - `estimate_cost`: projected requests and tokens before a run
//!
//! ## Execution
//! - `BatchExecutor`: chunked, bounded-concurrency execution with
//!   per-item failure isolation and input-order results
//! - `RateLimiter`: trailing-window request pacing with exponential,
//!   linear, or fixed throttle backoff
//!
//! ## Resilience
//! - `FallbackCoordinator`: walks a configured tier chain when a tier
//!   fails for an item, bounded by a hop budget
//! - `CheckpointStore`: atomic JSON snapshots of per-item, per-tier
//!   completion; interrupted runs resume without repeating succeeded
//!   work
//!
//! ## Orchestration
//! - `EnrichmentOrchestrator`: ties it together — pre-flight
//!   validation, tier passes, retries, fallback, checkpointing,
//!   progress, and a final per-tier report
//!
//! # Usage
//!
//! ```bash
//! # Enrich a catalog with a TOML pipeline config
//! enrich run --config pipeline.toml --items records.json
//!
//! # Project cost without issuing a single request
//! enrich estimate --config pipeline.toml --items records.json
//! ```

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod estimate;
pub mod fallback;
pub mod item;
pub mod limiter;
pub mod orchestrator;
pub mod provider;
pub mod report;
pub mod router;

// Re-export key error types
pub use error::{EnrichError, EnrichResult};

// Re-export key routing types
pub use router::{TierPlan, TierRouter, TierSpec};

// Re-export key execution types
pub use batch::{BatchExecutor, BatchHooks, BatchOptions, BatchProgress, ProgressHook};
pub use limiter::{BackoffStrategy, LimiterSnapshot, RateLimitConfig, RateLimiter};

// Re-export key provider types
pub use provider::{
    ErrorClass, FieldValues, HttpProvider, Provider, ProviderError, ProviderRequest, TierError,
};

// Re-export key checkpoint types
pub use checkpoint::{
    Checkpoint, CheckpointStore, ItemCheckpoint, TierResult, TierStatus, CHECKPOINT_VERSION,
};

// Re-export key fallback types
pub use fallback::{FallbackCoordinator, FallbackOutcome, FallbackPolicy};

// Re-export key item types
pub use item::{DefaultMapper, EnrichItem, FieldMapper};

// Re-export key orchestration types
pub use config::{PipelineConfig, RetryConfig};
pub use estimate::{estimate_cost, CostEstimate, TierCost};
pub use orchestrator::{CancelToken, EnrichmentOrchestrator};
pub use report::{EnrichmentReport, ItemFailure, TierTally};

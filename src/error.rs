//! Pipeline error types
//!
//! Splits fatal configuration errors (abort before any request) from
//! per-item provider errors, which are captured in [`TierResult`]s and
//! never propagate out of a run.
//!
//! [`TierResult`]: crate::checkpoint::TierResult

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type EnrichResult<T> = Result<T, EnrichError>;

/// Fatal pipeline errors.
///
/// Everything here aborts the run before (or instead of) issuing
/// requests. Per-item failures are a different animal — see
/// [`ProviderError`](crate::provider::ProviderError).
#[derive(Debug, Error)]
pub enum EnrichError {
    /// Requested output fields not covered by any configured tier.
    #[error("unroutable fields (no tier covers them): {}", fields.join(", "))]
    UnroutableFields { fields: Vec<String> },

    /// Structurally invalid configuration (bad tier table, unknown tier
    /// in the fallback chain, zero rate budget, ...).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Two input items share an identity; checkpointing requires
    /// unique ids within a run.
    #[error("duplicate item id '{0}' in input")]
    DuplicateItemId(String),

    /// Checkpoint file carries an unsupported format version.
    #[error("checkpoint format version {found} unsupported (expected {expected})")]
    CheckpointVersion { found: u32, expected: u32 },

    /// Checkpoint file exists but is not valid JSON for the schema.
    #[error("checkpoint at {} is corrupt: {reason}", path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },

    /// Illegal tier-result state transition (e.g. resuming a pair
    /// already recorded as succeeded).
    #[error("invalid tier result transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Filesystem failure while reading/writing checkpoints or config.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EnrichError {
    /// Shorthand for an [`EnrichError::InvalidConfig`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

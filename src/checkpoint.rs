//! Durable per-item, per-tier completion state.
//!
//! A [`Checkpoint`] is a JSON snapshot keyed by item identity, recording
//! each attempted tier's [`TierResult`]. Replaying a checkpoint never
//! re-runs a pair recorded as `Succeeded`; `Failed` and `Pending` pairs
//! are retried from the start of that tier for that item.
//!
//! Status is an explicit tagged enum with exhaustive transition checks —
//! an illegal move (e.g. resuming a succeeded entry) is an error at the
//! transition call, not a silent overwrite.
//!
//! [`CheckpointStore`] persists snapshots with a tmp-file + atomic
//! rename so a crash mid-write can never truncate the previous one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EnrichError, EnrichResult};
use crate::provider::{FieldValues, TierError};

/// Current checkpoint file format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Lifecycle of one item/tier pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    FallbackExhausted,
}

impl TierStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::FallbackExhausted)
    }

    /// Whether `self → to` is a legal move.
    ///
    /// ```text
    /// Pending → InProgress
    /// InProgress → Succeeded | Failed
    /// Failed → InProgress (retry/fallback) | FallbackExhausted
    /// ```
    pub fn can_transition(&self, to: TierStatus) -> bool {
        use TierStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Succeeded)
                | (InProgress, Failed)
                | (Failed, InProgress)
                | (Failed, FallbackExhausted)
        )
    }
}

impl std::fmt::Display for TierStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::FallbackExhausted => write!(f, "fallback_exhausted"),
        }
    }
}

/// Outcome of enrichment for one item on one tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierResult {
    pub status: TierStatus,
    /// Merged field values on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<FieldValues>,
    /// Last error observed on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TierError>,
    /// Tier that actually produced the values (differs from the keyed
    /// tier when a fallback served the result).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub served_by: Option<String>,
    /// Provider attempts consumed, fallback hops included.
    #[serde(default)]
    pub attempts: u32,
}

impl TierResult {
    pub fn new() -> Self {
        Self {
            status: TierStatus::Pending,
            values: None,
            last_error: None,
            served_by: None,
            attempts: 0,
        }
    }

    /// Move to `to`, rejecting illegal transitions.
    pub fn transition(&mut self, to: TierStatus) -> EnrichResult<()> {
        if !self.status.can_transition(to) {
            return Err(EnrichError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Record success with the merged values.
    pub fn succeed(&mut self, values: FieldValues, served_by: &str) -> EnrichResult<()> {
        self.transition(TierStatus::Succeeded)?;
        self.values = Some(values);
        self.served_by = Some(served_by.to_string());
        self.last_error = None;
        Ok(())
    }

    /// Record a failure for this tier.
    pub fn fail(&mut self, error: TierError) -> EnrichResult<()> {
        self.transition(TierStatus::Failed)?;
        self.last_error = Some(error);
        Ok(())
    }

    /// Mark the pair terminally exhausted after the fallback chain.
    pub fn exhaust(&mut self, error: TierError) -> EnrichResult<()> {
        self.transition(TierStatus::FallbackExhausted)?;
        self.last_error = Some(error);
        Ok(())
    }
}

impl Default for TierResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-item slice of the checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemCheckpoint {
    /// Tier name → result for that tier.
    pub tiers: BTreeMap<String, TierResult>,
}

/// Snapshot of a run's per-item, per-tier completion state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub run_id: String,
    pub updated_at: DateTime<Utc>,
    pub entries: BTreeMap<String, ItemCheckpoint>,
}

impl Checkpoint {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            run_id: run_id.into(),
            updated_at: Utc::now(),
            entries: BTreeMap::new(),
        }
    }

    /// Whether the item/tier pair is recorded as succeeded.
    pub fn is_succeeded(&self, item_id: &str, tier: &str) -> bool {
        self.get(item_id, tier)
            .map(|r| r.status == TierStatus::Succeeded)
            .unwrap_or(false)
    }

    pub fn get(&self, item_id: &str, tier: &str) -> Option<&TierResult> {
        self.entries.get(item_id).and_then(|e| e.tiers.get(tier))
    }

    /// Store `result` for the pair, bumping the update marker.
    pub fn record(&mut self, item_id: &str, tier: &str, result: TierResult) {
        self.entries
            .entry(item_id.to_string())
            .or_default()
            .tiers
            .insert(tier.to_string(), result);
        self.updated_at = Utc::now();
    }

    /// All (item, tier, result) triples, for report aggregation.
    pub fn iter_results(&self) -> impl Iterator<Item = (&str, &str, &TierResult)> {
        self.entries.iter().flat_map(|(item_id, entry)| {
            entry
                .tiers
                .iter()
                .map(move |(tier, result)| (item_id.as_str(), tier.as_str(), result))
        })
    }
}

/// File-backed checkpoint persistence with atomic replace.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint, or `None` when no file exists.
    pub async fn load(&self) -> EnrichResult<Option<Checkpoint>> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint =
            serde_json::from_str(&json).map_err(|e| EnrichError::CheckpointCorrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(EnrichError::CheckpointVersion {
                found: checkpoint.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        debug!(
            path = %self.path.display(),
            items = checkpoint.entries.len(),
            run_id = %checkpoint.run_id,
            "checkpoint loaded"
        );
        Ok(Some(checkpoint))
    }

    /// Persist the checkpoint: write to a sibling tmp file, then rename
    /// over the target so a crash mid-write cannot truncate it.
    pub async fn save(&self, checkpoint: &Checkpoint) -> EnrichResult<()> {
        let json = serde_json::to_string_pretty(checkpoint)?;
        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(
            path = %self.path.display(),
            items = checkpoint.entries.len(),
            "checkpoint persisted"
        );
        Ok(())
    }

    /// Delete the persisted checkpoint, if any.
    pub async fn clear(&self) -> EnrichResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "checkpoint clear failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ErrorClass;

    fn values(field: &str, value: &str) -> FieldValues {
        let mut map = FieldValues::new();
        map.insert(field.to_string(), serde_json::json!(value));
        map
    }

    #[test]
    fn test_legal_lifecycle() {
        let mut result = TierResult::new();
        result.transition(TierStatus::InProgress).unwrap();
        result.succeed(values("genre", "jazz"), "simple").unwrap();
        assert_eq!(result.status, TierStatus::Succeeded);
        assert!(result.last_error.is_none());
    }

    #[test]
    fn test_succeeded_is_terminal() {
        let mut result = TierResult::new();
        result.transition(TierStatus::InProgress).unwrap();
        result.succeed(FieldValues::new(), "simple").unwrap();

        let err = result.transition(TierStatus::InProgress).unwrap_err();
        assert!(matches!(err, EnrichError::InvalidTransition { .. }));
    }

    #[test]
    fn test_failed_can_retry_or_exhaust() {
        let mut result = TierResult::new();
        result.transition(TierStatus::InProgress).unwrap();
        result
            .fail(TierError::new(ErrorClass::Transient, "timeout"))
            .unwrap();

        // Retry path
        let mut retry = result.clone();
        retry.transition(TierStatus::InProgress).unwrap();

        // Exhaustion path
        result
            .exhaust(TierError::new(ErrorClass::Rejected, "all tiers refused"))
            .unwrap();
        assert!(result.status.is_terminal());
        assert!(result
            .transition(TierStatus::InProgress)
            .is_err());
    }

    #[test]
    fn test_pending_cannot_jump_to_succeeded() {
        let mut result = TierResult::new();
        assert!(result.transition(TierStatus::Succeeded).is_err());
    }

    #[test]
    fn test_checkpoint_record_and_query() {
        let mut cp = Checkpoint::new("run-1");
        let mut result = TierResult::new();
        result.transition(TierStatus::InProgress).unwrap();
        result.succeed(values("genre", "jazz"), "simple").unwrap();
        cp.record("item-1", "simple", result);

        assert!(cp.is_succeeded("item-1", "simple"));
        assert!(!cp.is_succeeded("item-1", "complex"));
        assert!(!cp.is_succeeded("item-2", "simple"));
        assert_eq!(cp.iter_results().count(), 1);
    }

    #[tokio::test]
    async fn test_store_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("run.checkpoint.json"));

        assert!(store.load().await.unwrap().is_none());

        let mut cp = Checkpoint::new("run-1");
        let mut result = TierResult::new();
        result.transition(TierStatus::InProgress).unwrap();
        result.succeed(values("mood", "calm"), "medium").unwrap();
        cp.record("item-7", "medium", result);
        store.save(&cp).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert!(loaded.is_succeeded("item-7", "medium"));
        let stored = loaded.get("item-7", "medium").unwrap();
        assert_eq!(stored.values.as_ref().unwrap().get("mood").unwrap(), "calm");
    }

    #[tokio::test]
    async fn test_store_overwrites_atomically() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.checkpoint.json");
        let store = CheckpointStore::new(&path);

        let cp = Checkpoint::new("run-1");
        store.save(&cp).await.unwrap();
        store.save(&cp).await.unwrap();

        // No stray tmp file left behind after the rename.
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_store_rejects_unknown_version() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.checkpoint.json");
        std::fs::write(
            &path,
            r#"{"version": 99, "run_id": "run-1", "updated_at": "2026-01-01T00:00:00Z", "entries": {}}"#,
        )
        .unwrap();

        let store = CheckpointStore::new(&path);
        let err = store.load().await.unwrap_err();
        assert!(matches!(
            err,
            EnrichError::CheckpointVersion {
                found: 99,
                expected: CHECKPOINT_VERSION
            }
        ));
    }

    #[tokio::test]
    async fn test_store_rejects_corrupt_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.checkpoint.json");
        std::fs::write(&path, "{ half a checkpoint").unwrap();

        let store = CheckpointStore::new(&path);
        assert!(matches!(
            store.load().await.unwrap_err(),
            EnrichError::CheckpointCorrupt { .. }
        ));
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("run.checkpoint.json"));
        store.clear().await.unwrap();
        store.save(&Checkpoint::new("run-1")).await.unwrap();
        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }
}

//! Input items and the field mapping seam.
//!
//! An [`EnrichItem`] is a source record plus a mutable accumulator of
//! canonical output fields. The [`FieldMapper`] trait is the boundary to
//! the mapping/transform layer: it reports which requested fields are
//! still missing and merges enriched values back without clobbering
//! fields that already hold valid data.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::provider::FieldValues;

/// One record flowing through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichItem {
    /// Stable identity, unique within a run (checkpoint key).
    pub id: String,
    /// Immutable source record.
    pub source: Value,
    /// Canonical output accumulator, filled by mapping + enrichment.
    #[serde(default)]
    pub accumulator: Map<String, Value>,
}

impl EnrichItem {
    pub fn new(id: impl Into<String>, source: Value) -> Self {
        Self {
            id: id.into(),
            source,
            accumulator: Map::new(),
        }
    }

    /// Parse an item from a raw JSON record.
    ///
    /// The identity is taken from an `id` field when present, otherwise
    /// the record's position in the input is used.
    pub fn from_record(index: usize, record: Value) -> Self {
        let id = record
            .get("id")
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| format!("item-{index}"));
        Self::new(id, record)
    }

    /// Payload handed to the provider: identity, source, and whatever
    /// the accumulator already holds.
    pub fn payload(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "source": self.source,
            "current": self.accumulator,
        })
    }
}

/// Boundary to the mapping/transform layer.
pub trait FieldMapper: Send + Sync {
    /// Subset of `requested` fields the item is still missing.
    fn missing_fields(&self, item: &EnrichItem, requested: &[String]) -> Vec<String>;

    /// Merge enriched `values` into the accumulator. Returns the number
    /// of fields actually written.
    fn merge(&self, item: &mut EnrichItem, values: &FieldValues) -> usize;
}

/// Default mapper: a field is missing when absent, null, or an empty
/// string; merging never overwrites a populated field.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMapper;

impl DefaultMapper {
    fn is_populated(value: Option<&Value>) -> bool {
        match value {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        }
    }
}

impl FieldMapper for DefaultMapper {
    fn missing_fields(&self, item: &EnrichItem, requested: &[String]) -> Vec<String> {
        requested
            .iter()
            .filter(|f| !Self::is_populated(item.accumulator.get(f.as_str())))
            .cloned()
            .collect()
    }

    fn merge(&self, item: &mut EnrichItem, values: &FieldValues) -> usize {
        let mut written = 0;
        for (field, value) in values {
            if Self::is_populated(item.accumulator.get(field)) {
                continue;
            }
            if !Self::is_populated(Some(value)) {
                continue;
            }
            item.accumulator.insert(field.clone(), value.clone());
            written += 1;
        }
        written
    }
}

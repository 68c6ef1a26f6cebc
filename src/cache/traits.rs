//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::youtrack::types::FieldValue;

/// Trait for entities that can be cached and optimistically mutated.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Stable identifier for this entity (e.g., the issue's database id)
  fn cache_key(&self) -> &str;

  /// Whether `key` refers to this entity. Defaults to the cache key; entities
  /// with a human-readable id may accept that too.
  fn matches(&self, key: &str) -> bool {
    self.cache_key() == key
  }

  /// Apply a local field change.
  fn apply(&mut self, mutation: &FieldMutation);

  /// Entity type name for log output (e.g., "issue")
  fn entity_type() -> &'static str;
}

/// One local change to one field of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMutation {
  /// Id (or readable id) of the record
  pub record_id: String,
  /// Custom field name, e.g. `State`
  pub field: String,
  pub value: FieldValue,
}

impl FieldMutation {
  pub fn new(record_id: impl Into<String>, field: impl Into<String>, value: FieldValue) -> Self {
    Self {
      record_id: record_id.into(),
      field: field.into(),
      value,
    }
  }
}

/// What is stored on disk: the snapshot plus when it was produced.
///
/// Serialized as `{ "updatedAt": <epoch millis>, "response": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope<T> {
  #[serde(rename = "updatedAt")]
  pub updated_at: i64,
  #[serde(rename = "response")]
  pub payload: T,
}

impl<T> CacheEnvelope<T> {
  /// Wrap a payload stamped with the current time.
  pub fn now(payload: T) -> Self {
    Self {
      updated_at: Utc::now().timestamp_millis(),
      payload,
    }
  }

  pub fn cached_at(&self) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(self.updated_at)
  }
}

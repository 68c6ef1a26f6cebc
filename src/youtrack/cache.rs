//! Caching implementations for YouTrack types.

use crate::cache::{Cacheable, FieldMutation};

use super::types::Issue;

impl Cacheable for Issue {
  fn cache_key(&self) -> &str {
    &self.id
  }

  fn matches(&self, key: &str) -> bool {
    self.id == key || self.id_readable.as_deref() == Some(key)
  }

  fn apply(&mut self, mutation: &FieldMutation) {
    self.set_custom_field(&mutation.field, mutation.value.clone());
  }

  fn entity_type() -> &'static str {
    "issue"
  }
}

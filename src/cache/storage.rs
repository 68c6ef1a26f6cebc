//! Cache storage trait and JSON file implementation.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheEnvelope, Cacheable};
use crate::youtrack::types::PaginatedResponse;

/// A cached collection snapshot as stored on disk.
pub type Snapshot<T> = CacheEnvelope<PaginatedResponse<T>>;

/// Trait for cache storage backends.
///
/// The cache is advisory: `read` never fails, it reports absence instead.
pub trait CacheStorage: Send + Sync {
  /// Load the last snapshot, or `None` if there is no usable one.
  fn read<T: Cacheable>(&self) -> Option<Snapshot<T>>;

  /// Replace the stored snapshot.
  fn write<T: Cacheable>(&self, snapshot: &PaginatedResponse<T>) -> Result<()>;

  /// Replace one record inside the stored snapshot. Returns `false` without
  /// touching storage when there is no snapshot or no matching record.
  fn patch<T: Cacheable>(&self, id: &str, record: &T) -> Result<bool>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn read<T: Cacheable>(&self) -> Option<Snapshot<T>> {
    None // Always miss
  }

  fn write<T: Cacheable>(&self, _snapshot: &PaginatedResponse<T>) -> Result<()> {
    Ok(()) // Discard
  }

  fn patch<T: Cacheable>(&self, _id: &str, _record: &T) -> Result<bool> {
    Ok(false)
  }
}

/// Envelope as found on disk, before validation.
#[derive(Deserialize)]
struct RawEnvelope<T> {
  #[serde(rename = "updatedAt")]
  updated_at: Option<i64>,
  response: Option<PaginatedResponse<T>>,
}

/// Single-file JSON storage. Holds at most one envelope; every write
/// replaces the whole file.
pub struct JsonFileStorage {
  path: PathBuf,
  /// Serializes read-modify-write cycles on the file within this process
  lock: Mutex<()>,
}

impl JsonFileStorage {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      lock: Mutex::new(()),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn guard(&self) -> MutexGuard<'_, ()> {
    // The guarded data is `()`, so a poisoned lock carries no broken state.
    self.lock.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn load<T: Cacheable>(&self) -> Option<Snapshot<T>> {
    let text = match std::fs::read_to_string(&self.path) {
      Ok(text) => text,
      Err(e) if e.kind() == ErrorKind::NotFound => {
        tracing::debug!(path = %self.path.display(), "no cache file");
        return None;
      }
      Err(e) => {
        tracing::warn!(path = %self.path.display(), error = %e, "cache file unreadable, ignoring");
        return None;
      }
    };

    if text.trim().is_empty() {
      return None;
    }

    let raw: RawEnvelope<T> = match serde_json::from_str(&text) {
      Ok(raw) => raw,
      Err(e) => {
        tracing::warn!(path = %self.path.display(), error = %e, "cache file corrupt, ignoring");
        return None;
      }
    };

    match (raw.updated_at, raw.response) {
      (Some(updated_at), Some(payload)) if updated_at > 0 => Some(CacheEnvelope {
        updated_at,
        payload,
      }),
      _ => {
        tracing::warn!(path = %self.path.display(), "cache envelope incomplete, ignoring");
        None
      }
    }
  }

  fn store<T: Cacheable>(&self, snapshot: &Snapshot<T>) -> Result<()> {
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let data =
      serde_json::to_vec(snapshot).map_err(|e| eyre!("Failed to serialize cache: {}", e))?;

    // Write beside the target and rename so readers never see a partial file.
    let tmp = self.path.with_extension("json.tmp");
    std::fs::write(&tmp, data)
      .map_err(|e| eyre!("Failed to write cache file {}: {}", tmp.display(), e))?;
    std::fs::rename(&tmp, &self.path)
      .map_err(|e| eyre!("Failed to replace cache file {}: {}", self.path.display(), e))?;

    Ok(())
  }
}

impl CacheStorage for JsonFileStorage {
  fn read<T: Cacheable>(&self) -> Option<Snapshot<T>> {
    let _guard = self.guard();
    self.load()
  }

  fn write<T: Cacheable>(&self, snapshot: &PaginatedResponse<T>) -> Result<()> {
    let _guard = self.guard();
    self.store(&CacheEnvelope::now(snapshot.clone()))?;
    tracing::debug!(
      entity = T::entity_type(),
      records = snapshot.data.len(),
      "cache written"
    );
    Ok(())
  }

  fn patch<T: Cacheable>(&self, id: &str, record: &T) -> Result<bool> {
    let _guard = self.guard();

    let Some(mut snapshot) = self.load::<T>() else {
      return Ok(false);
    };
    let Some(slot) = snapshot.payload.data.iter_mut().find(|r| r.cache_key() == id) else {
      return Ok(false);
    };
    *slot = record.clone();

    self.store(&CacheEnvelope::now(snapshot.payload))?;
    tracing::debug!(entity = T::entity_type(), id, "cache record patched");
    Ok(true)
  }
}

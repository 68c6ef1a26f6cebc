//! Offline-first caching for fetched collections.
//!
//! This module provides:
//! - A single-file JSON snapshot store that treats a damaged file as absent
//! - A reconciler that serves the cached snapshot immediately, revalidates
//!   it in the background and replays local edits over the fresh result

mod reconciler;
mod storage;
mod traits;

pub use reconciler::{MutationFailure, Phase, Reconciler};
pub use storage::{CacheStorage, JsonFileStorage, NoopStorage, Snapshot};
pub use traits::{CacheEnvelope, Cacheable, FieldMutation};

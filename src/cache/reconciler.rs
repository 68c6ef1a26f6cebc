//! Stale-while-revalidate state for one cached collection.
//!
//! A `Reconciler` publishes the last cached snapshot immediately, fetches a
//! fresh one in the background and merges it in. Local edits are applied
//! optimistically and replayed onto the next fetched snapshot, so a fetch
//! that started before the edit cannot visibly revert it.
//!
//! The reconciler is owned by the UI loop: background work
//! reports back over a channel and `poll()` folds results in without
//! blocking.
//!
//! ```ignore
//! let storage = Arc::new(JsonFileStorage::new(path));
//! let client = client.clone();
//! let mut issues = Reconciler::new(storage, move || {
//!     let client = client.clone();
//!     async move { client.search_issues("#Unresolved", &SearchOptions::page(100)).await }
//! });
//!
//! issues.start();          // cached snapshot (if any) is visible right away
//!
//! // In event loop tick
//! if issues.poll() {
//!     // fresh data or a failure arrived, re-render
//! }
//! ```

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::storage::CacheStorage;
use super::traits::{Cacheable, FieldMutation};
use crate::youtrack::types::PaginatedResponse;
use crate::youtrack::ClassifiedFailure;

type FetchResult<T> = Result<PaginatedResponse<T>, ClassifiedFailure>;

/// A factory function that creates futures for fetching the collection
type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<'static, FetchResult<T>> + Send + Sync>;

/// Where the published snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Nothing published yet
  Empty,
  /// Serving the snapshot read from disk
  Cached,
  /// A fetch is in flight; whatever was published stays visible
  Fetching,
  /// Serving a snapshot fetched during this run
  Fresh,
}

/// A local edit the server refused. The optimistic value stays published.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationFailure {
  pub mutation: FieldMutation,
  pub error: ClassifiedFailure,
}

enum Message<T> {
  Fetched {
    generation: u64,
    result: FetchResult<T>,
  },
  MutationSettled {
    mutation: FieldMutation,
    result: Result<(), ClassifiedFailure>,
  },
}

pub struct Reconciler<T: Cacheable, S: CacheStorage> {
  storage: Arc<S>,
  writer: CacheWriter<T>,
  fetcher: FetcherFn<T>,
  phase: Phase,
  /// Phase to fall back to if the in-flight fetch fails
  settled: Phase,
  published: Option<PaginatedResponse<T>>,
  published_at: Option<DateTime<Utc>>,
  /// Last fetch failure; cleared only by a successful fetch
  fetch_error: Option<ClassifiedFailure>,
  /// Rejected mutations, kept until the consumer takes them
  failed: Vec<MutationFailure>,
  /// Local edits not yet confirmed by a fetch; `dirty` iff non-empty
  pending: Vec<FieldMutation>,
  generation: u64,
  in_flight: Option<JoinHandle<()>>,
  mutations_in_flight: usize,
  tx: mpsc::UnboundedSender<Message<T>>,
  rx: mpsc::UnboundedReceiver<Message<T>>,
}

impl<T: Cacheable, S: CacheStorage + 'static> Reconciler<T, S> {
  /// Create a reconciler over `storage`. Must be called inside a tokio
  /// runtime: cache writes are handed to a background task.
  pub fn new<F, Fut>(storage: Arc<S>, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult<T>> + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      writer: CacheWriter::spawn(storage.clone()),
      storage,
      fetcher: Box::new(move || fetcher().boxed()),
      phase: Phase::Empty,
      settled: Phase::Empty,
      published: None,
      published_at: None,
      fetch_error: None,
      failed: Vec::new(),
      pending: Vec::new(),
      generation: 0,
      in_flight: None,
      mutations_in_flight: 0,
      tx,
      rx,
    }
  }

  /// Publish the cached snapshot (if any) and start a fresh fetch.
  pub fn start(&mut self) {
    if self.published.is_none() {
      if let Some(cached) = self.storage.read::<T>() {
        tracing::debug!(
          entity = T::entity_type(),
          records = cached.payload.data.len(),
          "serving cached snapshot"
        );
        self.published_at = cached.cached_at();
        self.published = Some(cached.payload);
        self.phase = Phase::Cached;
      }
    }
    self.refetch();
  }

  /// Start a fetch, superseding any fetch still in flight.
  pub fn refetch(&mut self) {
    if let Some(handle) = self.in_flight.take() {
      handle.abort();
    }
    if self.phase != Phase::Fetching {
      self.settled = self.phase;
    }
    self.phase = Phase::Fetching;
    self.generation += 1;

    let generation = self.generation;
    let tx = self.tx.clone();
    let future = (self.fetcher)();
    self.in_flight = Some(tokio::spawn(async move {
      let result = AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
          Err(ClassifiedFailure::Unknown {
            message: "fetch task panicked".to_string(),
          })
        });
      // Ignore send errors - the reconciler may have been dropped
      let _ = tx.send(Message::Fetched { generation, result });
    }));
  }

  /// Apply a field change to the published snapshot right away, persist it
  /// to the cache, and run `remote` (the server-side update) in the
  /// background. A failed `remote` is reported through
  /// `failed_mutations()`; the local change is kept.
  ///
  /// Returns whether the record was present in the published snapshot.
  pub fn apply_mutation<Fut>(&mut self, mutation: FieldMutation, remote: Fut) -> bool
  where
    Fut: Future<Output = Result<(), ClassifiedFailure>> + Send + 'static,
  {
    let patched = self
      .published
      .as_mut()
      .and_then(|snapshot| {
        snapshot
          .data
          .iter_mut()
          .find(|record| record.matches(&mutation.record_id))
      })
      .map(|record| {
        record.apply(&mutation);
        record.clone()
      });

    match &patched {
      Some(record) => self.writer.patch(record.clone()),
      None => tracing::debug!(
        entity = T::entity_type(),
        id = %mutation.record_id,
        "mutated record not published yet"
      ),
    }

    self.pending.push(mutation.clone());
    self.mutations_in_flight += 1;

    let tx = self.tx.clone();
    tokio::spawn(async move {
      let result = AssertUnwindSafe(remote)
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
          Err(ClassifiedFailure::Unknown {
            message: "mutation task panicked".to_string(),
          })
        });
      let _ = tx.send(Message::MutationSettled { mutation, result });
    });

    patched.is_some()
  }

  /// Fold in any finished background work without blocking.
  ///
  /// Returns `true` if the published state changed.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    while let Ok(message) = self.rx.try_recv() {
      changed |= self.handle(message);
    }
    changed
  }

  /// Wait for the next piece of background work to finish and fold it in.
  ///
  /// Returns `false` once nothing is outstanding.
  pub async fn wait(&mut self) -> bool {
    if !self.is_loading() && self.mutations_in_flight == 0 {
      return false;
    }
    match self.rx.recv().await {
      Some(message) => {
        self.handle(message);
        true
      }
      None => false,
    }
  }

  /// Resolves once every cache write queued so far has hit storage.
  pub async fn flush_cache(&self) {
    self.writer.flush().await;
  }

  fn handle(&mut self, message: Message<T>) -> bool {
    match message {
      Message::Fetched { generation, result } => {
        if generation != self.generation {
          tracing::debug!(generation, current = self.generation, "discarding superseded fetch");
          return false;
        }
        self.in_flight = None;
        match result {
          Ok(fresh) => self.publish_fresh(fresh),
          Err(error) => {
            tracing::warn!(entity = T::entity_type(), %error, "fetch failed, keeping last snapshot");
            self.phase = self.settled;
            self.fetch_error = Some(error);
          }
        }
        true
      }
      Message::MutationSettled { mutation, result } => {
        self.mutations_in_flight = self.mutations_in_flight.saturating_sub(1);
        match result {
          Ok(()) => {
            tracing::debug!(id = %mutation.record_id, field = %mutation.field, "mutation saved");
            false
          }
          Err(error) => {
            tracing::warn!(
              id = %mutation.record_id,
              field = %mutation.field,
              %error,
              "mutation failed, local value kept"
            );
            self.failed.push(MutationFailure { mutation, error });
            true
          }
        }
      }
    }
  }

  fn publish_fresh(&mut self, mut fresh: PaginatedResponse<T>) {
    if self.is_dirty() {
      for mutation in self.pending.drain(..) {
        if let Some(record) = fresh
          .data
          .iter_mut()
          .find(|record| record.matches(&mutation.record_id))
        {
          record.apply(&mutation);
        }
      }
    }

    self.writer.write(fresh.clone());
    self.published = Some(fresh);
    self.published_at = Some(Utc::now());
    self.phase = Phase::Fresh;
    self.fetch_error = None;
  }

  // Accessors for UI rendering

  pub fn phase(&self) -> Phase {
    self.phase
  }

  pub fn is_loading(&self) -> bool {
    self.phase == Phase::Fetching
  }

  /// Whether local edits are waiting to be replayed onto the next fetch.
  pub fn is_dirty(&self) -> bool {
    !self.pending.is_empty()
  }

  pub fn data(&self) -> Option<&PaginatedResponse<T>> {
    self.published.as_ref()
  }

  pub fn records(&self) -> &[T] {
    self.published.as_ref().map_or(&[], |p| p.data.as_slice())
  }

  pub fn find(&self, key: &str) -> Option<&T> {
    self.records().iter().find(|record| record.matches(key))
  }

  /// When the published snapshot was produced.
  pub fn published_at(&self) -> Option<DateTime<Utc>> {
    self.published_at
  }

  /// The most recent fetch failure, cleared by the next successful fetch.
  pub fn fetch_error(&self) -> Option<&ClassifiedFailure> {
    self.fetch_error.as_ref()
  }

  /// Mutations the server rejected since the last `take_failed_mutations`.
  pub fn failed_mutations(&self) -> &[MutationFailure] {
    &self.failed
  }

  pub fn take_failed_mutations(&mut self) -> Vec<MutationFailure> {
    std::mem::take(&mut self.failed)
  }
}

impl<T: Cacheable, S: CacheStorage> std::fmt::Debug for Reconciler<T, S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Reconciler")
      .field("phase", &self.phase)
      .field("pending", &self.pending.len())
      .field("generation", &self.generation)
      .field("fetch_error", &self.fetch_error)
      .field("failed", &self.failed.len())
      .finish_non_exhaustive()
  }
}

enum CacheOp<T> {
  Write(PaginatedResponse<T>),
  Patch(T),
  Flush(oneshot::Sender<()>),
}

/// Applies cache writes and patches one at a time, in the order queued, so
/// a patch can never be overtaken by an older full write.
struct CacheWriter<T> {
  tx: mpsc::UnboundedSender<CacheOp<T>>,
}

impl<T: Cacheable> CacheWriter<T> {
  fn spawn<S: CacheStorage + 'static>(storage: Arc<S>) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel::<CacheOp<T>>();

    tokio::spawn(async move {
      while let Some(op) = rx.recv().await {
        let storage = storage.clone();
        let outcome = match op {
          CacheOp::Flush(done) => {
            let _ = done.send(());
            continue;
          }
          CacheOp::Write(snapshot) => {
            tokio::task::spawn_blocking(move || storage.write(&snapshot)).await
          }
          CacheOp::Patch(record) => {
            tokio::task::spawn_blocking(move || {
              storage.patch(record.cache_key(), &record).map(|_| ())
            })
            .await
          }
        };

        match outcome {
          Ok(Ok(())) => {}
          Ok(Err(e)) => tracing::warn!(error = %e, "failed to update cache"),
          Err(e) => tracing::warn!(error = %e, "cache task panicked"),
        }
      }
    });

    Self { tx }
  }

  fn write(&self, snapshot: PaginatedResponse<T>) {
    let _ = self.tx.send(CacheOp::Write(snapshot));
  }

  fn patch(&self, record: T) {
    let _ = self.tx.send(CacheOp::Patch(record));
  }

  async fn flush(&self) {
    let (done, wait) = oneshot::channel();
    if self.tx.send(CacheOp::Flush(done)).is_ok() {
      let _ = wait.await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{JsonFileStorage, NoopStorage};
  use crate::youtrack::types::{FieldValue, Issue, ValueRecord};
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;
  use tempfile::TempDir;
  use tokio::sync::Notify;

  fn issue(id: &str, state: &str) -> Issue {
    serde_json::from_value(json!({
      "id": id,
      "idReadable": format!("DEMO-{}", id),
      "customFields": [{"name": "State", "value": {"name": state}}]
    }))
    .unwrap()
  }

  fn page(issues: Vec<Issue>) -> PaginatedResponse<Issue> {
    PaginatedResponse {
      data: issues,
      total: None,
      skip: None,
      top: Some(100),
    }
  }

  fn set_state(id: &str, state: &str) -> FieldMutation {
    FieldMutation::new(
      id,
      "State",
      FieldValue::One(ValueRecord {
        name: Some(state.to_string()),
        ..Default::default()
      }),
    )
  }

  fn state_of<S: CacheStorage + 'static>(r: &Reconciler<Issue, S>, id: &str) -> Option<String> {
    r.find(id).and_then(|i| i.state_name()).map(String::from)
  }

  fn cached_storage(issues: Vec<Issue>) -> (TempDir, Arc<JsonFileStorage>) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(JsonFileStorage::new(dir.path().join("issues-cache.json")));
    if !issues.is_empty() {
      storage.write(&page(issues)).unwrap();
    }
    (dir, storage)
  }

  async fn settle<S: CacheStorage + 'static>(r: &mut Reconciler<Issue, S>) {
    while r.wait().await {}
  }

  #[tokio::test]
  async fn test_cached_snapshot_is_published_before_fetch_completes() {
    let (_dir, storage) = cached_storage(vec![issue("1", "Open")]);
    let gate = Arc::new(Notify::new());
    let fetch_gate = gate.clone();

    let mut issues = Reconciler::new(storage, move || {
      let gate = fetch_gate.clone();
      async move {
        gate.notified().await;
        Ok(page(vec![issue("1", "In Progress"), issue("2", "Open")]))
      }
    });
    issues.start();

    assert_eq!(issues.phase(), Phase::Fetching);
    assert_eq!(issues.records().len(), 1);
    assert_eq!(state_of(&issues, "1").as_deref(), Some("Open"));
    assert!(!issues.poll());

    gate.notify_one();
    settle(&mut issues).await;

    assert_eq!(issues.phase(), Phase::Fresh);
    assert_eq!(issues.records().len(), 2);
    assert_eq!(state_of(&issues, "1").as_deref(), Some("In Progress"));
  }

  #[tokio::test]
  async fn test_optimistic_mutation_survives_in_flight_fetch() {
    let (_dir, storage) = cached_storage(vec![issue("1", "Open")]);
    let gate = Arc::new(Notify::new());
    let fetch_gate = gate.clone();

    // The fetch starts before the edit and still reports the old state.
    let mut issues = Reconciler::new(storage.clone(), move || {
      let gate = fetch_gate.clone();
      async move {
        gate.notified().await;
        Ok(page(vec![issue("1", "Open")]))
      }
    });
    issues.start();

    let found = issues.apply_mutation(set_state("1", "Closed"), async { Ok(()) });
    assert!(found);
    assert!(issues.is_dirty());
    assert_eq!(state_of(&issues, "1").as_deref(), Some("Closed"));

    gate.notify_one();
    settle(&mut issues).await;

    assert_eq!(issues.phase(), Phase::Fresh);
    assert!(!issues.is_dirty());
    assert_eq!(state_of(&issues, "1").as_deref(), Some("Closed"));

    issues.flush_cache().await;
    let cached = storage.read::<Issue>().unwrap();
    assert_eq!(cached.payload.data[0].state_name(), Some("Closed"));
  }

  #[tokio::test]
  async fn test_mutation_is_patched_into_cache() {
    let (_dir, storage) = cached_storage(vec![issue("1", "Open"), issue("2", "Open")]);
    let mut issues = Reconciler::<Issue, _>::new(storage.clone(), || async {
      Err(ClassifiedFailure::timeout("offline"))
    });
    issues.start();

    issues.apply_mutation(set_state("DEMO-2", "Closed"), async { Ok(()) });
    issues.flush_cache().await;

    let cached = storage.read::<Issue>().unwrap();
    let states: Vec<_> = cached.payload.data.iter().map(|i| i.state_name()).collect();
    assert_eq!(states, vec![Some("Open"), Some("Closed")]);
  }

  #[tokio::test]
  async fn test_fetch_failure_keeps_cached_snapshot() {
    let (_dir, storage) = cached_storage(vec![issue("1", "Open")]);
    let mut issues = Reconciler::<Issue, _>::new(storage, || async {
      Err(ClassifiedFailure::Transient {
        status: Some(502),
        message: "bad gateway".to_string(),
      })
    });
    issues.start();
    settle(&mut issues).await;

    assert_eq!(issues.phase(), Phase::Cached);
    assert_eq!(issues.records().len(), 1);
    assert_eq!(issues.fetch_error().and_then(|e| e.status()), Some(502));
  }

  #[tokio::test]
  async fn test_fetch_failure_without_cache_stays_empty() {
    let mut issues = Reconciler::<Issue, _>::new(Arc::new(NoopStorage), || async {
      Err(ClassifiedFailure::Client {
        status: 401,
        message: "Unauthorized".to_string(),
      })
    });
    issues.start();
    settle(&mut issues).await;

    assert_eq!(issues.phase(), Phase::Empty);
    assert!(issues.data().is_none());
    assert!(issues.fetch_error().is_some_and(|e| e.is_client()));
  }

  #[tokio::test]
  async fn test_first_fetch_populates_cache() {
    let (_dir, storage) = cached_storage(Vec::new());
    let mut issues = Reconciler::new(storage.clone(), || async {
      Ok(page(vec![issue("1", "Open")]))
    });
    issues.start();
    assert_eq!(issues.phase(), Phase::Fetching);
    assert!(issues.data().is_none());

    settle(&mut issues).await;
    issues.flush_cache().await;

    assert_eq!(issues.phase(), Phase::Fresh);
    assert_eq!(storage.read::<Issue>().unwrap().payload.data.len(), 1);
  }

  #[tokio::test]
  async fn test_mutation_failure_is_reported_without_rollback() {
    let (_dir, storage) = cached_storage(vec![issue("1", "Open")]);
    let mut issues = Reconciler::new(storage, || async { Ok(page(vec![issue("1", "Open")])) });
    issues.start();
    settle(&mut issues).await;

    issues.apply_mutation(set_state("1", "Closed"), async {
      Err(ClassifiedFailure::Client {
        status: 403,
        message: "Forbidden".to_string(),
      })
    });
    settle(&mut issues).await;

    let failed = issues.take_failed_mutations();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error.status(), Some(403));
    assert_eq!(failed[0].mutation.record_id, "1");
    assert!(issues.fetch_error().is_none());
    assert!(issues.failed_mutations().is_empty());
    assert_eq!(state_of(&issues, "1").as_deref(), Some("Closed"));
  }

  #[tokio::test]
  async fn test_mutation_failure_survives_later_fetch() {
    let (_dir, storage) = cached_storage(vec![issue("1", "Open")]);
    let mut issues = Reconciler::new(storage, || async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(page(vec![issue("1", "Open")]))
    });
    issues.start();

    issues.apply_mutation(set_state("1", "Closed"), async {
      Err(ClassifiedFailure::Client {
        status: 403,
        message: "Forbidden".to_string(),
      })
    });

    // Both results are queued before the consumer looks.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(issues.poll());

    assert_eq!(issues.phase(), Phase::Fresh);
    assert!(issues.fetch_error().is_none());
    assert_eq!(issues.failed_mutations().len(), 1);
    assert_eq!(issues.failed_mutations()[0].error.status(), Some(403));
    assert_eq!(state_of(&issues, "1").as_deref(), Some("Closed"));
  }

  #[tokio::test]
  async fn test_fetch_failure_does_not_count_as_mutation_failure() {
    let mut issues = Reconciler::<Issue, _>::new(Arc::new(NoopStorage), || async {
      Err(ClassifiedFailure::timeout("offline"))
    });
    issues.start();
    issues.apply_mutation(set_state("1", "Closed"), async { Ok(()) });
    settle(&mut issues).await;

    assert!(issues.fetch_error().is_some());
    assert!(issues.failed_mutations().is_empty());
  }

  #[tokio::test]
  async fn test_panicking_fetcher_is_reported_as_failure() {
    let mut issues = Reconciler::new(Arc::new(NoopStorage), || async {
      let records: Vec<Issue> = serde_json::from_str("not json").expect("fetcher exploded");
      Ok(page(records))
    });
    issues.start();

    let settled = tokio::time::timeout(Duration::from_secs(1), settle(&mut issues)).await;
    assert!(settled.is_ok());
    assert_eq!(issues.phase(), Phase::Empty);
    assert!(matches!(
      issues.fetch_error(),
      Some(ClassifiedFailure::Unknown { .. })
    ));
  }

  #[tokio::test]
  async fn test_pending_mutation_applies_to_record_arriving_later() {
    let mut issues = Reconciler::new(Arc::new(NoopStorage), || async {
      Ok(page(vec![issue("7", "Open")]))
    });
    issues.start();

    let found = issues.apply_mutation(set_state("7", "Fixed"), async { Ok(()) });
    assert!(!found);
    settle(&mut issues).await;

    assert_eq!(state_of(&issues, "7").as_deref(), Some("Fixed"));
    assert!(!issues.is_dirty());
  }

  #[tokio::test]
  async fn test_refetch_supersedes_in_flight_fetch() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let mut issues = Reconciler::new(Arc::new(NoopStorage), move || {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        if n == 0 {
          tokio::time::sleep(Duration::from_millis(200)).await;
          Ok(page(vec![issue("old", "Open")]))
        } else {
          tokio::time::sleep(Duration::from_millis(20)).await;
          Ok(page(vec![issue("new", "Open")]))
        }
      }
    });
    issues.start();
    issues.refetch();
    settle(&mut issues).await;

    // Give the first fetch time to finish had it not been aborted.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!issues.poll());

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(issues.records().len(), 1);
    assert_eq!(issues.records()[0].id, "new");
    assert_eq!(issues.phase(), Phase::Fresh);
  }

  #[tokio::test]
  async fn test_poll_picks_up_finished_fetch() {
    let mut issues = Reconciler::new(Arc::new(NoopStorage), || async {
      Ok(page(vec![issue("1", "Open")]))
    });
    issues.start();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(issues.poll());
    assert_eq!(issues.phase(), Phase::Fresh);
    assert!(issues.published_at().is_some());
  }
}

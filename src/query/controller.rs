use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use super::bridge::{self, LiveUpdate, LiveUpdateSink};
use super::event::{ChangeBatch, EventStream, QueryEvent};
use super::projection::{Comparator, ResultProjection};
use super::state::{ControllerState, Transition};
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::record::{CachedEntity, Query, QueryCursor, SyncRecord};
use crate::remote::{QueryPage, QueryRequest, RemoteBackend};
use crate::store::{CacheStore, QueryState};

pub const DEFAULT_PAGE_SIZE: usize = 50;

pub struct QueryOptions<T> {
  /// Results requested per remote page
  pub page_size: usize,
  /// Row order. Defaults to the query's sort descriptors with the record
  /// identifier as tie-break.
  pub comparator: Option<Comparator<T>>,
}

impl<T> Default for QueryOptions<T> {
  fn default() -> Self {
    Self {
      page_size: DEFAULT_PAGE_SIZE,
      comparator: None,
    }
  }
}

/// Value at a row of a controller's results.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue<T> {
  Record(T),
  /// Placeholder after the last row while more pages exist. Reading it
  /// requests the next page.
  Loading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageKind {
  Fresh,
  Continuation,
}

impl PageKind {
  fn finished(self) -> Transition {
    match self {
      PageKind::Fresh => Transition::RefreshFinished,
      PageKind::Continuation => Transition::LoadMoreFinished,
    }
  }
}

struct Inner<T> {
  state: ControllerState,
  cursor: Option<QueryCursor>,
  projection: ResultProjection<T>,
  /// Live updates received while the rows were not settled, with their
  /// commit sequence, in commit order
  deferred: Vec<(u64, LiveUpdate<T>)>,
  /// Local loads in progress. Before the first one starts, commits need no
  /// queueing since its snapshot will include them.
  local_loads: usize,
}

impl<T: SyncRecord> Inner<T> {
  fn apply_live(&mut self, updates: impl IntoIterator<Item = LiveUpdate<T>>, batch: &mut ChangeBatch<T>) {
    for update in updates {
      let change = match update {
        LiveUpdate::Insert(value) | LiveUpdate::Update(value) | LiveUpdate::Move(value) => {
          self.projection.upsert(value)
        }
        LiveUpdate::Delete(id) => self.projection.remove(&id),
        LiveUpdate::Failed(id, err) => self.projection.mark_failed(&id, SyncError::Decode(err)),
      };
      batch.push(change);
    }
  }

  /// Leave a busy state and catch up on anything deferred meanwhile.
  fn settle(&mut self, transition: Transition, batch: &mut ChangeBatch<T>) {
    match self.state.apply(transition) {
      Some(next) => self.state = next,
      None => warn!(state = ?self.state, ?transition, "unexpected controller transition"),
    }
    if self.state.applies_live_changes() && !self.deferred.is_empty() {
      let deferred = std::mem::take(&mut self.deferred);
      self.apply_live(deferred.into_iter().map(|(_, update)| update), batch);
    }
  }
}

struct Shared<T, B> {
  remote: Arc<B>,
  store: CacheStore,
  query: Query,
  page_size: usize,
  comparator: Comparator<T>,
  inner: Mutex<Inner<T>>,
  events: mpsc::UnboundedSender<QueryEvent<T>>,
  /// Sequence of the last commit the bridge has handed over
  delivered: watch::Receiver<u64>,
}

impl<T: SyncRecord, B: RemoteBackend> Shared<T, B> {
  fn lock(&self) -> MutexGuard<'_, Inner<T>> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn emit(&self, event: QueryEvent<T>) {
    let _ = self.events.send(event);
  }

  /// Issue one remote page request on a background task.
  fn spawn_page(self: &Arc<Self>, cursor: Option<QueryCursor>, kind: PageKind) {
    let request = QueryRequest {
      query: self.query.clone(),
      cursor,
      limit: self.page_size,
    };
    let remote = Arc::clone(&self.remote);
    let owner = Arc::downgrade(self);
    let span = info_span!("query_page", query = %self.query, ?kind);

    tokio::spawn(
      async move {
        let result = remote.run_query(request).await;
        match owner.upgrade() {
          Some(shared) => shared.finish_page(result, kind).await,
          None => debug!("controller dropped, discarding page"),
        }
      }
      .instrument(span),
    );
  }

  async fn finish_page(&self, result: Result<QueryPage, RemoteError>, kind: PageKind) {
    let page = match result {
      Ok(page) => page,
      Err(err) => {
        let err = SyncError::from(err);
        warn!(error = %err, "query page failed");
        let mut inner = self.lock();
        // A vanished continuation cannot be retried
        if kind == PageKind::Continuation && err.is_not_found() {
          inner.cursor = None;
        }
        let mut batch = ChangeBatch::new();
        inner.settle(kind.finished(), &mut batch);
        batch.send(&self.events);
        self.emit(QueryEvent::QueryCompleted { error: Some(err) });
        return;
      }
    };

    let mut entities = Vec::with_capacity(page.records.len());
    for record in page.records {
      match T::from_record(&record.id, &record.fields) {
        Ok(_) => entities.push(CachedEntity::from_remote(record)),
        Err(err) => warn!(id = %record.id, error = %err, "page record does not decode, skipped"),
      }
    }

    // Rows reach the projection through the bridge, in commit order with
    // every other cache write, so wait until it has handed over this page.
    let error = match self.store.upsert_all(entities).await {
      Ok(Some(sequence)) => {
        let mut delivered = self.delivered.clone();
        let stopped = delivered.wait_for(|seen| *seen >= sequence).await.is_err();
        if stopped {
          debug!("change bridge stopped, discarding page");
          return;
        }
        None
      }
      Ok(None) => None,
      Err(err) => Some(SyncError::from(err)),
    };

    let row_count = {
      let mut inner = self.lock();
      if error.is_none() {
        inner.cursor = page.cursor;
      }
      let mut batch = ChangeBatch::new();
      inner.settle(kind.finished(), &mut batch);
      batch.send(&self.events);
      debug!(rows = inner.projection.len(), more = inner.cursor.is_some(), "page applied");
      inner.projection.len()
    };

    if kind == PageKind::Fresh && error.is_none() {
      let state = QueryState {
        fingerprint: self.query.fingerprint(),
        description: self.query.description(),
        record_type: self.query.record_type.clone(),
        refreshed_at: chrono::Utc::now(),
        row_count,
      };
      if let Err(err) = self.store.record_query(state).await {
        warn!(error = %err, "failed to record query refresh");
      }
    }
    self.emit(QueryEvent::QueryCompleted { error });
  }
}

impl<T: SyncRecord, B: RemoteBackend> LiveUpdateSink<T> for Shared<T, B> {
  fn query(&self) -> &Query {
    &self.query
  }

  fn comparator(&self) -> &Comparator<T> {
    &self.comparator
  }

  fn apply(&self, sequence: u64, updates: Vec<LiveUpdate<T>>) {
    let mut inner = self.lock();
    if !inner.state.applies_live_changes() {
      if inner.state == ControllerState::Initial && inner.local_loads == 0 {
        return;
      }
      debug!(sequence, count = updates.len(), state = ?inner.state, "deferring live updates");
      inner
        .deferred
        .extend(updates.into_iter().map(|update| (sequence, update)));
      return;
    }
    let mut batch = ChangeBatch::new();
    inner.apply_live(updates, &mut batch);
    batch.send(&self.events);
  }
}

/// Live, paged, sorted view of one query's results.
///
/// Rows come from the local store, so they stay current with every cache
/// write (including the synchronizer's). Remote pages are merged into the
/// store and the rows. All changes are reported in order on the
/// [`EventStream`] returned alongside the controller.
///
/// Must be created and used inside a tokio runtime.
pub struct QueryController<T: SyncRecord, B: RemoteBackend> {
  shared: Arc<Shared<T, B>>,
  bridge: JoinHandle<()>,
}

impl<T: SyncRecord, B: RemoteBackend> QueryController<T, B> {
  pub fn new(remote: Arc<B>, store: CacheStore, query: Query) -> (Self, EventStream<T>) {
    Self::with_options(remote, store, query, QueryOptions::default())
  }

  pub fn with_options(
    remote: Arc<B>,
    store: CacheStore,
    query: Query,
    options: QueryOptions<T>,
  ) -> (Self, EventStream<T>) {
    let comparator = options.comparator.unwrap_or_else(|| {
      let order = query.clone();
      Arc::new(move |a: &T, b: &T| order.compare(a, b))
    });
    let (events, rx) = mpsc::unbounded_channel();
    let (delivered_tx, delivered) = watch::channel(0);
    let commits = store.subscribe();

    let shared = Arc::new(Shared {
      remote,
      store,
      query,
      page_size: options.page_size.max(1),
      comparator: Arc::clone(&comparator),
      inner: Mutex::new(Inner {
        state: ControllerState::Initial,
        cursor: None,
        projection: ResultProjection::new(comparator),
        deferred: Vec::new(),
        local_loads: 0,
      }),
      events,
      delivered,
    });
    let bridge = bridge::spawn::<T, _>(commits, Arc::downgrade(&shared), delivered_tx);

    (Self { shared, bridge }, EventStream::new(rx))
  }

  pub fn query(&self) -> &Query {
    &self.shared.query
  }

  pub fn state(&self) -> ControllerState {
    self.shared.lock().state
  }

  /// Whether the server reported more results after the last page.
  pub fn has_more(&self) -> bool {
    self.shared.lock().cursor.is_some()
  }

  /// Snapshot of the current rows.
  pub fn rows(&self) -> Vec<T> {
    self.shared.lock().projection.rows().to_vec()
  }

  /// Load cached results on first use, then start a fresh remote query.
  ///
  /// Returns once the remote query is in flight; its outcome arrives as
  /// [`QueryEvent::QueryCompleted`]. Ignored while a page is already
  /// loading. Errors only when the local store cannot be read.
  #[instrument(skip_all, fields(query = %self.shared.query))]
  pub async fn refresh(&self) -> SyncResult<()> {
    if self.state() == ControllerState::Initial {
      self.load_local().await?;
    }

    {
      let mut inner = self.shared.lock();
      let Some(next) = inner.state.apply(Transition::RefreshStarted) else {
        debug!(state = ?inner.state, "refresh ignored, page in flight");
        return Ok(());
      };
      inner.state = next;
      inner.cursor = None;
    }
    self.shared.spawn_page(None, PageKind::Fresh);
    Ok(())
  }

  async fn load_local(&self) -> SyncResult<()> {
    let query = &self.shared.query;
    self.shared.lock().local_loads += 1;
    let snapshot = self.shared.store.snapshot(&query.record_type).await;
    let (entities, sequence) = match snapshot {
      Ok(snapshot) => snapshot,
      Err(err) => {
        self.shared.lock().local_loads -= 1;
        return Err(err.into());
      }
    };
    let values: Vec<T> = entities
      .iter()
      .filter(|entity| query.matches(entity))
      .filter_map(|entity| match entity.decode::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
          warn!(id = %entity.id, error = %err, "cached entity does not decode, skipped");
          None
        }
      })
      .collect();

    let mut inner = self.shared.lock();
    inner.local_loads -= 1;
    // Another refresh finished the initial load first
    let Some(next) = inner.state.apply(Transition::LocalLoaded) else {
      return Ok(());
    };
    let mut batch = ChangeBatch::new();
    batch.extend(inner.projection.load(values));
    inner.state = next;
    // Commits up to the snapshot are already in it
    let deferred = std::mem::take(&mut inner.deferred);
    let newer = deferred
      .into_iter()
      .filter(|(committed, _)| *committed > sequence)
      .map(|(_, update)| update);
    inner.apply_live(newer, &mut batch);
    batch.send(&self.shared.events);
    info!(rows = inner.projection.len(), "loaded from cache");
    Ok(())
  }

  /// Request the next page. Returns false when there is no next page or a
  /// page is already loading.
  pub fn load_more(&self) -> bool {
    let cursor = {
      let mut inner = self.shared.lock();
      let Some(cursor) = inner.cursor.clone() else {
        return false;
      };
      let Some(next) = inner.state.apply(Transition::LoadMoreStarted) else {
        debug!(state = ?inner.state, "load more ignored, page in flight");
        return false;
      };
      inner.state = next;
      cursor
    };
    self.shared.spawn_page(Some(cursor), PageKind::Continuation);
    true
  }

  /// Row count, including the trailing placeholder when more pages exist.
  pub fn number_of_rows(&self) -> usize {
    let inner = self.shared.lock();
    inner.projection.len() + usize::from(inner.cursor.is_some())
  }

  /// Value at `row`. Reading the placeholder row requests the next page.
  pub fn value_at_row(&self, row: usize) -> Option<RowValue<T>> {
    let placeholder = {
      let inner = self.shared.lock();
      if let Some(value) = inner.projection.get(row) {
        return Some(RowValue::Record(value.clone()));
      }
      row == inner.projection.len() && inner.cursor.is_some()
    };
    if !placeholder {
      return None;
    }
    self.load_more();
    Some(RowValue::Loading)
  }
}

impl<T: SyncRecord, B: RemoteBackend> Drop for QueryController<T, B> {
  fn drop(&mut self) {
    self.bridge.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query::event::testing::*;
  use crate::record::fixtures::{note_fields, Note};
  use crate::record::{FieldValue, RecordId, RemoteRecord, SortDescriptor};
  use crate::remote::mock::MockBackend;
  use crate::query::event::RowChange;
  use std::time::Duration;

  type Controller = QueryController<Note, MockBackend>;

  fn setup() -> (Arc<MockBackend>, CacheStore) {
    (MockBackend::new(), CacheStore::open_in_memory().unwrap())
  }

  fn controller(remote: &Arc<MockBackend>, store: &CacheStore) -> (Controller, EventStream<Note>) {
    let query = Query::of::<Note>().sort_by(SortDescriptor::ascending("rank"));
    QueryController::new(Arc::clone(remote), store.clone(), query)
  }

  fn record(name: &str, rank: i64) -> RemoteRecord {
    RemoteRecord::new("Note", RecordId::new(name), note_fields(name, rank))
  }

  async fn cache(store: &CacheStore, name: &str, rank: i64) {
    store
      .upsert(CachedEntity::synced(&Note::new(name, name, rank)))
      .await
      .unwrap();
  }

  fn names(controller: &Controller) -> Vec<String> {
    controller
      .rows()
      .iter()
      .map(|n| n.id.name().to_string())
      .collect()
  }

  #[tokio::test]
  async fn test_fresh_query_loads_cache_then_queries_remote() {
    let (remote, store) = setup();
    cache(&store, "B", 2).await;
    cache(&store, "A", 1).await;
    let (controller, mut events) = controller(&remote, &store);

    controller.refresh().await.unwrap();

    assert!(matches!(next_event(&mut events).await, QueryEvent::WillChangeContent));
    assert!(matches!(
      next_event(&mut events).await,
      QueryEvent::Row(RowChange::Inserted { row: 0, value }) if value.id.name() == "A"
    ));
    assert!(matches!(
      next_event(&mut events).await,
      QueryEvent::Row(RowChange::Inserted { row: 1, value }) if value.id.name() == "B"
    ));
    assert!(matches!(next_event(&mut events).await, QueryEvent::DidChangeContent));

    let (_, error) = until_completed(&mut events).await;
    assert!(error.is_none());
    assert_eq!(controller.state(), ControllerState::Loaded);

    let calls = remote.query_calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].cursor.is_none());
    assert_eq!(calls[0].limit, DEFAULT_PAGE_SIZE);
    assert_eq!(controller.number_of_rows(), 2);

    let recorded = store.queries().await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].fingerprint, controller.query().fingerprint());
  }

  #[tokio::test]
  async fn test_refresh_ignored_while_refreshing() {
    let (remote, store) = setup();
    let (controller, mut events) = controller(&remote, &store);
    remote.hold_queries();

    controller.refresh().await.unwrap();
    controller.refresh().await.unwrap();
    remote.wait_for_queries(1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(remote.query_calls().len(), 1);
    assert_eq!(controller.state(), ControllerState::Refreshing);

    remote.release_queries(1);
    until_completed(&mut events).await;
    assert_eq!(controller.state(), ControllerState::Loaded);
  }

  #[tokio::test]
  async fn test_placeholder_row_loads_next_page_once() {
    let (remote, store) = setup();
    remote.push_page(vec![record("A", 1), record("B", 2), record("C", 3)], Some("c1"));
    remote.push_page(vec![record("D", 4), record("E", 5)], None);
    let (controller, mut events) = controller(&remote, &store);

    controller.refresh().await.unwrap();
    let (rows, _) = until_completed(&mut events).await;
    assert_eq!(rows.len(), 3);
    assert_eq!(controller.number_of_rows(), 4);

    assert_eq!(controller.value_at_row(3), Some(RowValue::Loading));
    assert_eq!(controller.value_at_row(3), Some(RowValue::Loading));
    assert_eq!(controller.state(), ControllerState::LoadingCursor);

    let (rows, error) = until_completed(&mut events).await;
    assert!(error.is_none());
    assert!(matches!(&rows[0], RowChange::Inserted { row: 3, value } if value.id.name() == "D"));
    assert!(matches!(&rows[1], RowChange::Inserted { row: 4, value } if value.id.name() == "E"));

    assert_eq!(names(&controller), vec!["A", "B", "C", "D", "E"]);
    assert_eq!(controller.number_of_rows(), 5);
    assert_eq!(controller.value_at_row(5), None);

    let calls = remote.query_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].cursor, Some(QueryCursor::new("c1")));
  }

  #[tokio::test]
  async fn test_failed_refresh_keeps_rows() {
    let (remote, store) = setup();
    cache(&store, "A", 1).await;
    remote.push_page_error(RemoteError::Transport("offline".to_string()));
    let (controller, mut events) = controller(&remote, &store);

    controller.refresh().await.unwrap();
    let (_, error) = until_completed(&mut events).await;

    assert!(matches!(error, Some(SyncError::Remote(RemoteError::Transport(_)))));
    assert_eq!(names(&controller), vec!["A"]);
    assert_eq!(controller.state(), ControllerState::Loaded);
  }

  #[tokio::test]
  async fn test_failed_load_more_keeps_cursor_unless_gone() {
    let (remote, store) = setup();
    remote.push_page(vec![record("A", 1)], Some("c1"));
    remote.push_page_error(RemoteError::Transport("offline".to_string()));
    remote.push_page_error(RemoteError::NotFound(RecordId::new("c1")));
    let (controller, mut events) = controller(&remote, &store);

    controller.refresh().await.unwrap();
    until_completed(&mut events).await;

    assert!(controller.load_more());
    let (_, error) = until_completed(&mut events).await;
    assert!(error.is_some());
    assert_eq!(controller.number_of_rows(), 2);
    assert_eq!(controller.state(), ControllerState::Loaded);

    assert!(controller.load_more());
    let (_, error) = until_completed(&mut events).await;
    assert!(error.map_or(false, |e| e.is_not_found()));
    assert_eq!(controller.number_of_rows(), 1);
    assert!(!controller.load_more());
  }

  #[tokio::test]
  async fn test_store_commits_update_rows() {
    let (remote, store) = setup();
    cache(&store, "A", 1).await;
    cache(&store, "B", 2).await;
    let (controller, mut events) = controller(&remote, &store);
    controller.refresh().await.unwrap();
    until_completed(&mut events).await;

    cache(&store, "C", 0).await;
    let rows = next_batch(&mut events).await;
    assert!(matches!(&rows[..], [RowChange::Inserted { row: 0, .. }]));

    cache(&store, "A", 9).await;
    let rows = next_batch(&mut events).await;
    assert!(matches!(&rows[..], [RowChange::Moved { from: 1, to: 2, .. }]));

    store.delete("Note", &RecordId::new("B")).await.unwrap();
    let rows = next_batch(&mut events).await;
    assert!(matches!(&rows[..], [RowChange::Deleted { row: 1, .. }]));

    assert_eq!(names(&controller), vec!["C", "A"]);
  }

  #[tokio::test]
  async fn test_repeated_changes_are_idempotent() {
    let (remote, store) = setup();
    cache(&store, "A", 1).await;
    let (controller, mut events) = controller(&remote, &store);
    controller.refresh().await.unwrap();
    until_completed(&mut events).await;

    cache(&store, "A", 1).await;
    store.delete("Note", &RecordId::new("A")).await.unwrap();
    store.delete("Note", &RecordId::new("A")).await.unwrap();

    let rows = next_batch(&mut events).await;
    assert!(matches!(&rows[..], [RowChange::Deleted { row: 0, .. }]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_next().is_none());
    assert!(controller.rows().is_empty());
  }

  #[tokio::test]
  async fn test_undecodable_update_reports_error_on_row() {
    let (remote, store) = setup();
    cache(&store, "A", 1).await;
    let (controller, mut events) = controller(&remote, &store);
    controller.refresh().await.unwrap();
    until_completed(&mut events).await;

    let mut broken = CachedEntity::synced(&Note::new("A", "A", 1));
    broken.fields.remove("title");
    store.upsert(broken).await.unwrap();

    let rows = next_batch(&mut events).await;
    assert!(matches!(
      &rows[..],
      [RowChange::Updated { row: 0, error: Some(SyncError::Decode(_)), value }] if value.title == "A"
    ));
    assert_eq!(names(&controller), vec!["A"]);
  }

  #[tokio::test]
  async fn test_changes_during_load_more_are_deferred() {
    let (remote, store) = setup();
    remote.push_page(vec![record("A", 1)], Some("c1"));
    let (controller, mut events) = controller(&remote, &store);
    controller.refresh().await.unwrap();
    until_completed(&mut events).await;

    remote.hold_queries();
    assert_eq!(controller.value_at_row(1), Some(RowValue::Loading));
    remote.wait_for_queries(2).await;

    cache(&store, "Z", 7).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_next().is_none());

    remote.release_queries(1);
    let (rows, error) = until_completed(&mut events).await;
    assert!(error.is_none());
    assert!(matches!(&rows[..], [RowChange::Inserted { row: 1, value }] if value.id.name() == "Z"));
    assert_eq!(controller.number_of_rows(), 2);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_cache_write_after_page_commit_wins() {
    for _ in 0..50 {
      let (remote, store) = setup();
      remote.push_page(vec![record("X", 1)], None);
      let mut commits = store.subscribe();
      let (controller, mut events) = controller(&remote, &store);

      controller.refresh().await.unwrap();
      // Overwrite the row as soon as the page lands in the cache
      commits.recv().await.unwrap();
      cache(&store, "X", 9).await;
      until_completed(&mut events).await;

      let expected = vec![Note::new("X", "X", 9)];
      let settled = tokio::time::timeout(Duration::from_secs(2), async {
        while controller.rows() != expected {
          tokio::time::sleep(Duration::from_millis(1)).await;
        }
      })
      .await;
      assert!(settled.is_ok(), "rows {:?} lag the cache", controller.rows());
    }
  }

  #[tokio::test]
  async fn test_page_keeps_fields_the_record_does_not_model() {
    let (remote, store) = setup();
    let mut wide = record("A", 1);
    wide.fields.insert("color".to_string(), FieldValue::from("red"));
    remote.push_page(vec![wide], None);
    let (controller, mut events) = controller(&remote, &store);

    controller.refresh().await.unwrap();
    until_completed(&mut events).await;

    let cached = store.lookup("Note", &RecordId::new("A")).await.unwrap().unwrap();
    assert_eq!(cached.fields["color"], FieldValue::from("red"));
    assert!(cached.last_synced.is_some());
    assert_eq!(names(&controller), vec!["A"]);
  }

  #[tokio::test]
  async fn test_commits_before_first_refresh_are_not_queued() {
    let (remote, store) = setup();
    let (controller, mut events) = controller(&remote, &store);

    for rank in 0..20 {
      cache(&store, "A", rank).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(controller.shared.lock().deferred.is_empty());
    assert!(events.try_next().is_none());

    controller.refresh().await.unwrap();
    let (rows, error) = until_completed(&mut events).await;
    assert!(error.is_none());
    assert!(matches!(&rows[..], [RowChange::Inserted { row: 0, value }] if value.rank == 19));
  }

  #[tokio::test]
  async fn test_dropped_controller_discards_pending_page() {
    let (remote, store) = setup();
    let (controller, mut events) = controller(&remote, &store);
    remote.hold_queries();

    controller.refresh().await.unwrap();
    remote.wait_for_queries(1).await;
    drop(controller);
    remote.release_queries(1);

    let closed = tokio::time::timeout(Duration::from_secs(1), events.next()).await;
    assert!(matches!(closed, Ok(None)));
  }
}

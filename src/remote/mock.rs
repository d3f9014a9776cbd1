//! Scripted in-memory backend for tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use super::{ModifyRequest, ModifyResult, QueryPage, QueryRequest, RecordsById, RemoteBackend};
use crate::error::RemoteError;
use crate::record::{Fields, QueryCursor, RecordId, RemoteRecord, SavePolicy};

#[derive(Default)]
struct MockState {
  records: HashMap<RecordId, RemoteRecord>,
  pages: VecDeque<Result<QueryPage, RemoteError>>,
  fetch_failure: Option<RemoteError>,
  modify_failure: Option<RemoteError>,
  fetch_calls: Vec<(Vec<RecordId>, Option<Vec<String>>)>,
  modify_calls: Vec<ModifyRequest>,
  query_calls: Vec<QueryRequest>,
  next_tag: u64,
  next_name: u64,
}

#[derive(Default)]
pub(crate) struct MockBackend {
  state: Mutex<MockState>,
  query_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockBackend {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
    self.state.lock().unwrap()
  }

  pub fn put(&self, record_type: &str, id: RecordId, fields: Fields) {
    let mut state = self.state();
    state.next_tag += 1;
    let mut record = RemoteRecord::new(record_type, id.clone(), fields);
    record.change_tag = Some(format!("tag-{}", state.next_tag));
    state.records.insert(id, record);
  }

  pub fn remove(&self, id: &RecordId) {
    self.state().records.remove(id);
  }

  pub fn record(&self, id: &RecordId) -> Option<RemoteRecord> {
    self.state().records.get(id).cloned()
  }

  pub fn push_page(&self, records: Vec<RemoteRecord>, cursor: Option<&str>) {
    self.state().pages.push_back(Ok(QueryPage {
      records,
      cursor: cursor.map(QueryCursor::new),
    }));
  }

  pub fn push_page_error(&self, err: RemoteError) {
    self.state().pages.push_back(Err(err));
  }

  pub fn fail_next_fetch(&self, err: RemoteError) {
    self.state().fetch_failure = Some(err);
  }

  pub fn fail_next_modify(&self, err: RemoteError) {
    self.state().modify_failure = Some(err);
  }

  pub fn fetch_calls(&self) -> Vec<(Vec<RecordId>, Option<Vec<String>>)> {
    self.state().fetch_calls.clone()
  }

  pub fn modify_calls(&self) -> Vec<ModifyRequest> {
    self.state().modify_calls.clone()
  }

  pub fn query_calls(&self) -> Vec<QueryRequest> {
    self.state().query_calls.clone()
  }

  /// Hold every subsequent query until [`release_queries`](Self::release_queries).
  pub fn hold_queries(&self) {
    *self.query_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
  }

  pub fn release_queries(&self, count: usize) {
    if let Some(gate) = self.query_gate.lock().unwrap().as_ref() {
      gate.add_permits(count);
    }
  }

  /// Wait until `count` queries have been issued.
  pub async fn wait_for_queries(&self, count: usize) {
    for _ in 0..200 {
      if self.state().query_calls.len() >= count {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {} queries, saw {}", count, self.state().query_calls.len());
  }
}

#[async_trait]
impl RemoteBackend for MockBackend {
  async fn fetch_records(
    &self,
    ids: &[RecordId],
    desired_keys: Option<&[String]>,
  ) -> Result<RecordsById, RemoteError> {
    let mut state = self.state();
    state
      .fetch_calls
      .push((ids.to_vec(), desired_keys.map(<[String]>::to_vec)));
    if let Some(err) = state.fetch_failure.take() {
      return Err(err);
    }

    let mut results = RecordsById::new();
    for id in ids {
      let result = match state.records.get(id) {
        Some(record) => {
          let mut record = record.clone();
          if let Some(keys) = desired_keys {
            record.fields.retain(|name, _| keys.contains(name));
          }
          Ok(record)
        }
        None => Err(RemoteError::NotFound(id.clone())),
      };
      results.insert(id.clone(), result);
    }
    Ok(results)
  }

  async fn modify_records(&self, request: ModifyRequest) -> Result<ModifyResult, RemoteError> {
    let mut state = self.state();
    state.modify_calls.push(request.clone());
    if let Some(err) = state.modify_failure.take() {
      return Err(err);
    }

    let mut result = ModifyResult::default();
    for mut record in request.save {
      if record.id.name().is_empty() {
        state.next_name += 1;
        record.id = RecordId::with_zone(
          format!("server-{}", state.next_name),
          record.id.zone().map(String::from),
        );
      }

      let existing = state.records.get(&record.id).cloned();
      if request.policy == SavePolicy::IfUnchanged {
        match (&existing, &record.change_tag) {
          (None, Some(_)) => return Err(RemoteError::NotFound(record.id)),
          (Some(existing), Some(tag)) if existing.change_tag.as_ref() != Some(tag) => {
            return Err(RemoteError::Server {
              code: "CONFLICT".to_string(),
              reason: "record changed".to_string(),
            })
          }
          (Some(_), None) => {
            return Err(RemoteError::Server {
              code: "CONFLICT".to_string(),
              reason: "record exists".to_string(),
            })
          }
          _ => {}
        }
      }

      state.next_tag += 1;
      let mut stored = existing.unwrap_or_else(|| {
        RemoteRecord::new(record.record_type.clone(), record.id.clone(), Fields::new())
      });
      stored.fields.extend(record.fields);
      stored.change_tag = Some(format!("tag-{}", state.next_tag));
      state.records.insert(stored.id.clone(), stored.clone());

      // Saves are acknowledged without echoing field values
      stored.fields.clear();
      result.saved.push(stored);
    }

    for id in request.delete {
      if state.records.remove(&id).is_none() {
        return Err(RemoteError::NotFound(id));
      }
      result.deleted.push(id);
    }
    Ok(result)
  }

  async fn run_query(&self, request: QueryRequest) -> Result<QueryPage, RemoteError> {
    self.state().query_calls.push(request);

    let gate = self.query_gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      gate
        .acquire()
        .await
        .expect("query gate closed")
        .forget();
    }

    self
      .state()
      .pages
      .pop_front()
      .unwrap_or_else(|| Ok(QueryPage::default()))
  }
}

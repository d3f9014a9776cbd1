//! Turns store commits into row-level updates for one query.

use std::cmp::Ordering;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::projection::Comparator;
use crate::error::DecodeError;
use crate::record::{Query, RecordId, SyncRecord};
use crate::store::{Commit, StoreChange};

/// How one committed entity change affects a query's results.
#[derive(Debug, Clone)]
pub enum LiveUpdate<T> {
  Insert(T),
  /// New value, sort position unchanged.
  Update(T),
  /// New value whose sort keys changed.
  Move(T),
  Delete(RecordId),
  /// The entity is still in the results but its new state does not decode.
  Failed(RecordId, DecodeError),
}

/// Receiver of a bridge's updates.
pub(crate) trait LiveUpdateSink<T>: Send + Sync + 'static {
  fn query(&self) -> &Query;
  fn comparator(&self) -> &Comparator<T>;
  fn apply(&self, sequence: u64, updates: Vec<LiveUpdate<T>>);
}

/// Classify a store change against a query's predicate and sort order.
///
/// Returns `None` when the change is irrelevant to the query. An entity that
/// newly matches but does not decode is skipped, since there is no row to
/// attach the error to.
pub fn classify<T: SyncRecord>(
  query: &Query,
  comparator: &Comparator<T>,
  change: &StoreChange,
) -> Option<LiveUpdate<T>> {
  let before = change.previous.as_ref().filter(|e| query.matches(e));
  let after = change.current.as_ref().filter(|e| query.matches(e));

  match (before, after) {
    (None, None) => None,
    (Some(_), None) => Some(LiveUpdate::Delete(change.id.clone())),
    (None, Some(after)) => match after.decode::<T>() {
      Ok(value) => Some(LiveUpdate::Insert(value)),
      Err(err) => {
        warn!(id = %change.id, error = %err, "matching entity does not decode, skipped");
        None
      }
    },
    (Some(before), Some(after)) => {
      let value = match after.decode::<T>() {
        Ok(value) => value,
        Err(err) => return Some(LiveUpdate::Failed(change.id.clone(), err)),
      };
      let moved = match before.decode::<T>() {
        Ok(old) => comparator(&old, &value) != Ordering::Equal,
        Err(_) => true,
      };
      Some(if moved {
        LiveUpdate::Move(value)
      } else {
        LiveUpdate::Update(value)
      })
    }
  }
}

/// Forward commits to `sink` until the store or the sink goes away.
///
/// After each commit has been handed to the sink (or found irrelevant) its
/// sequence is published on `delivered`, which closes when the bridge stops.
/// Only a weak reference is held, so a dropped controller is noticed on the
/// next commit. Callers should also abort the returned handle on drop.
pub(crate) fn spawn<T, S>(
  mut commits: mpsc::UnboundedReceiver<Arc<Commit>>,
  sink: Weak<S>,
  delivered: watch::Sender<u64>,
) -> JoinHandle<()>
where
  T: SyncRecord,
  S: LiveUpdateSink<T>,
{
  tokio::spawn(async move {
    while let Some(commit) = commits.recv().await {
      let Some(sink) = sink.upgrade() else {
        break;
      };
      let updates: Vec<LiveUpdate<T>> = commit
        .changes
        .iter()
        .filter_map(|change| classify(sink.query(), sink.comparator(), change))
        .collect();
      if !updates.is_empty() {
        sink.apply(commit.sequence, updates);
      }
      delivered.send_replace(commit.sequence);
    }
    debug!("change bridge stopped");
  })
}

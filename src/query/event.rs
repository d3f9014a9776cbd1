use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::record::RecordId;

/// One row-level change to a controller's results.
#[derive(Debug, Clone)]
pub enum RowChange<T> {
  Inserted { row: usize, value: T },
  Deleted { row: usize, id: RecordId },
  /// The row's value changed in place. When `error` is set the new state
  /// could not be decoded and `value` is the last good one.
  Updated {
    row: usize,
    value: T,
    error: Option<SyncError>,
  },
  Moved { from: usize, to: usize, value: T },
}

/// Everything a controller reports to its consumer, in order.
///
/// Row changes always arrive between `WillChangeContent` and
/// `DidChangeContent`.
#[derive(Debug, Clone)]
pub enum QueryEvent<T> {
  QueryCompleted { error: Option<SyncError> },
  WillChangeContent,
  Row(RowChange<T>),
  DidChangeContent,
}

/// Callback interface for consumers that prefer methods over matching on
/// [`QueryEvent`]s. Fed by [`EventStream::dispatch_pending`].
#[allow(unused_variables)]
pub trait QueryObserver<T> {
  fn query_completed(&mut self, error: Option<&SyncError>) {}
  fn will_change_content(&mut self) {}
  fn row_inserted(&mut self, row: usize, value: &T) {}
  fn row_deleted(&mut self, row: usize, id: &RecordId) {}
  fn row_updated(&mut self, row: usize, value: &T, error: Option<&SyncError>) {}
  fn row_moved(&mut self, from: usize, to: usize, value: &T) {}
  fn did_change_content(&mut self) {}
}

impl<T> QueryEvent<T> {
  pub fn dispatch(&self, observer: &mut impl QueryObserver<T>) {
    match self {
      QueryEvent::QueryCompleted { error } => observer.query_completed(error.as_ref()),
      QueryEvent::WillChangeContent => observer.will_change_content(),
      QueryEvent::DidChangeContent => observer.did_change_content(),
      QueryEvent::Row(RowChange::Inserted { row, value }) => observer.row_inserted(*row, value),
      QueryEvent::Row(RowChange::Deleted { row, id }) => observer.row_deleted(*row, id),
      QueryEvent::Row(RowChange::Updated { row, value, error }) => {
        observer.row_updated(*row, value, error.as_ref())
      }
      QueryEvent::Row(RowChange::Moved { from, to, value }) => observer.row_moved(*from, *to, value),
    }
  }
}

/// Receiving end of a controller's events.
pub struct EventStream<T> {
  rx: mpsc::UnboundedReceiver<QueryEvent<T>>,
}

impl<T> EventStream<T> {
  pub(crate) fn new(rx: mpsc::UnboundedReceiver<QueryEvent<T>>) -> Self {
    Self { rx }
  }

  /// Wait for the next event. `None` once the controller is gone.
  pub async fn next(&mut self) -> Option<QueryEvent<T>> {
    self.rx.recv().await
  }

  /// Non-blocking poll, for render loops.
  pub fn try_next(&mut self) -> Option<QueryEvent<T>> {
    self.rx.try_recv().ok()
  }

  /// Deliver every queued event to `observer`. Returns how many were
  /// delivered.
  pub fn dispatch_pending(&mut self, observer: &mut impl QueryObserver<T>) -> usize {
    let mut delivered = 0;
    while let Some(event) = self.try_next() {
      event.dispatch(observer);
      delivered += 1;
    }
    delivered
  }
}

/// Row changes collected under the controller lock and sent as one bracketed
/// batch.
pub(crate) struct ChangeBatch<T> {
  rows: Vec<RowChange<T>>,
}

impl<T> ChangeBatch<T> {
  pub fn new() -> Self {
    Self { rows: Vec::new() }
  }

  pub fn push(&mut self, change: Option<RowChange<T>>) {
    self.rows.extend(change);
  }

  pub fn extend(&mut self, changes: impl IntoIterator<Item = RowChange<T>>) {
    self.rows.extend(changes);
  }

  /// Send the batch. An empty batch sends nothing.
  pub fn send(self, tx: &mpsc::UnboundedSender<QueryEvent<T>>) {
    if self.rows.is_empty() {
      return;
    }
    // A closed channel means the consumer went away; nothing to report to
    let _ = tx.send(QueryEvent::WillChangeContent);
    for change in self.rows {
      let _ = tx.send(QueryEvent::Row(change));
    }
    let _ = tx.send(QueryEvent::DidChangeContent);
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Default)]
  struct Recorder {
    calls: Vec<String>,
  }

  impl QueryObserver<i64> for Recorder {
    fn will_change_content(&mut self) {
      self.calls.push("will".to_string());
    }
    fn row_inserted(&mut self, row: usize, value: &i64) {
      self.calls.push(format!("insert {} {}", row, value));
    }
    fn did_change_content(&mut self) {
      self.calls.push("did".to_string());
    }
  }

  #[test]
  fn test_batch_is_bracketed() {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut batch = ChangeBatch::new();
    batch.push(Some(RowChange::Inserted { row: 0, value: 7 }));
    batch.push(None);
    batch.send(&tx);

    let mut recorder = Recorder::default();
    let delivered = EventStream::new(rx).dispatch_pending(&mut recorder);
    assert_eq!(delivered, 3);
    assert_eq!(recorder.calls, vec!["will", "insert 0 7", "did"]);
  }

  #[test]
  fn test_empty_batch_sends_nothing() {
    let (tx, rx) = mpsc::unbounded_channel::<QueryEvent<i64>>();
    ChangeBatch::new().send(&tx);
    assert!(EventStream::new(rx).try_next().is_none());
  }
}

use std::cmp::Ordering;
use std::sync::Arc;

use super::event::RowChange;
use crate::error::SyncError;
use crate::record::{Cacheable, RecordId};

/// Total order used to keep a controller's rows sorted.
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Sorted in-memory view of a query's results.
///
/// Every mutation reports the row-level change it made, or `None` when it
/// changed nothing, which makes repeated inserts and deletes of the same
/// record harmless.
pub struct ResultProjection<T> {
  rows: Vec<T>,
  comparator: Comparator<T>,
}

impl<T: Cacheable + Clone + PartialEq> ResultProjection<T> {
  pub fn new(comparator: Comparator<T>) -> Self {
    Self {
      rows: Vec::new(),
      comparator,
    }
  }

  pub fn len(&self) -> usize {
    self.rows.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }

  pub fn get(&self, row: usize) -> Option<&T> {
    self.rows.get(row)
  }

  pub fn rows(&self) -> &[T] {
    &self.rows
  }

  pub fn position(&self, id: &RecordId) -> Option<usize> {
    self.rows.iter().position(|row| row.record_id() == id)
  }

  /// Index after every row ordered at or before `value`, matching where a
  /// stable sort would leave an appended element.
  fn insertion_point(&self, value: &T) -> usize {
    self
      .rows
      .partition_point(|row| (self.comparator)(row, value) != Ordering::Greater)
  }

  /// Replace all rows, reporting an insert per row in final order.
  pub fn load(&mut self, values: Vec<T>) -> Vec<RowChange<T>> {
    self.rows.clear();
    for value in values {
      self.insert(value);
    }
    self
      .rows
      .iter()
      .enumerate()
      .map(|(row, value)| RowChange::Inserted {
        row,
        value: value.clone(),
      })
      .collect()
  }

  pub fn insert(&mut self, value: T) -> Option<RowChange<T>> {
    if self.position(value.record_id()).is_some() {
      return None;
    }
    let row = self.insertion_point(&value);
    self.rows.insert(row, value.clone());
    Some(RowChange::Inserted { row, value })
  }

  /// Replace a row's value without re-sorting.
  pub fn update(&mut self, value: T) -> Option<RowChange<T>> {
    let row = self.position(value.record_id())?;
    if self.rows[row] == value {
      return None;
    }
    self.rows[row] = value.clone();
    Some(RowChange::Updated {
      row,
      value,
      error: None,
    })
  }

  /// Replace a row's value and move it to its sorted position. Reported as
  /// an update when the position does not change.
  pub fn relocate(&mut self, value: T) -> Option<RowChange<T>> {
    let from = self.position(value.record_id())?;
    if self.rows[from] == value {
      return None;
    }
    self.rows.remove(from);
    let to = self.insertion_point(&value);
    self.rows.insert(to, value.clone());
    if from == to {
      Some(RowChange::Updated {
        row: to,
        value,
        error: None,
      })
    } else {
      Some(RowChange::Moved { from, to, value })
    }
  }

  pub fn remove(&mut self, id: &RecordId) -> Option<RowChange<T>> {
    let row = self.position(id)?;
    self.rows.remove(row);
    Some(RowChange::Deleted {
      row,
      id: id.clone(),
    })
  }

  /// Insert, move or update as needed to hold `value`.
  pub fn upsert(&mut self, value: T) -> Option<RowChange<T>> {
    match self.position(value.record_id()) {
      None => self.insert(value),
      Some(_) => self.relocate(value),
    }
  }

  /// Report that a row's latest state failed to decode. The row keeps its
  /// last good value.
  pub fn mark_failed(&self, id: &RecordId, error: SyncError) -> Option<RowChange<T>> {
    let row = self.position(id)?;
    Some(RowChange::Updated {
      row,
      value: self.rows[row].clone(),
      error: Some(error),
    })
  }

  #[cfg(test)]
  fn is_sorted(&self) -> bool {
    self
      .rows
      .windows(2)
      .all(|pair| (self.comparator)(&pair[0], &pair[1]) != Ordering::Greater)
  }
}

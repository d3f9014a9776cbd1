//! Server-side query description, shared with the local store.
//!
//! The same description is sent to the remote backend and evaluated locally:
//! filters become the local predicate over cached fields, sort descriptors
//! become the projection comparator.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

use super::{CachedEntity, Cacheable, FieldValue, Fields, RecordType, ToFields};

/// Opaque continuation token issued by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCursor(String);

impl QueryCursor {
  pub fn new(token: impl Into<String>) -> Self {
    Self(token.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterOp {
  Equals,
  NotEquals,
  LessThan,
  LessThanOrEquals,
  GreaterThan,
  GreaterThanOrEquals,
  BeginsWith,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
  pub field: String,
  pub op: FilterOp,
  pub value: FieldValue,
}

impl Filter {
  pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<FieldValue>) -> Self {
    Self {
      field: field.into(),
      op,
      value: value.into(),
    }
  }

  pub fn equals(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
    Self::new(field, FilterOp::Equals, value)
  }

  /// Evaluate against a cached field map. A missing field never matches.
  pub fn matches(&self, fields: &Fields) -> bool {
    let Some(actual) = fields.get(&self.field) else {
      return false;
    };

    match self.op {
      FilterOp::BeginsWith => match (actual.as_str(), self.value.as_str()) {
        (Some(a), Some(prefix)) => a.starts_with(prefix),
        _ => false,
      },
      op => match actual.compare(&self.value) {
        Some(ordering) => match op {
          FilterOp::Equals => ordering == Ordering::Equal,
          FilterOp::NotEquals => ordering != Ordering::Equal,
          FilterOp::LessThan => ordering == Ordering::Less,
          FilterOp::LessThanOrEquals => ordering != Ordering::Greater,
          FilterOp::GreaterThan => ordering == Ordering::Greater,
          FilterOp::GreaterThanOrEquals => ordering != Ordering::Less,
          FilterOp::BeginsWith => false,
        },
        // Unordered kinds only support (in)equality
        None => match op {
          FilterOp::Equals => actual == &self.value,
          FilterOp::NotEquals => actual != &self.value,
          _ => false,
        },
      },
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
  pub field: String,
  pub ascending: bool,
}

impl SortDescriptor {
  pub fn ascending(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      ascending: true,
    }
  }

  pub fn descending(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      ascending: false,
    }
  }
}

/// A query over one record type, optionally restricted to a zone.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
  pub record_type: String,
  pub zone: Option<String>,
  pub filters: Vec<Filter>,
  pub sort: Vec<SortDescriptor>,
}

impl Query {
  pub fn new(record_type: impl Into<String>) -> Self {
    Self {
      record_type: record_type.into(),
      zone: None,
      filters: Vec::new(),
      sort: Vec::new(),
    }
  }

  pub fn of<T: RecordType>() -> Self {
    Self::new(T::record_type())
  }

  pub fn in_zone(mut self, zone: impl Into<String>) -> Self {
    self.zone = Some(zone.into());
    self
  }

  pub fn filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn sort_by(mut self, descriptor: SortDescriptor) -> Self {
    self.sort.push(descriptor);
    self
  }

  /// Local predicate: does a cached entity belong to this query's results?
  pub fn matches(&self, entity: &CachedEntity) -> bool {
    if entity.record_type != self.record_type {
      return false;
    }
    if self.zone.is_some() && entity.id.zone() != self.zone.as_deref() {
      return false;
    }
    self.filters.iter().all(|f| f.matches(&entity.fields))
  }

  /// Compare two values by the declared sort descriptors.
  ///
  /// Missing fields sort first. Ties (including an empty sort list) are broken
  /// by record identifier so the order is total.
  pub fn compare<T: ToFields + Cacheable>(&self, a: &T, b: &T) -> Ordering {
    self
      .compare_sort_keys(a, b)
      .then_with(|| a.record_id().cmp(b.record_id()))
  }

  /// Compare by sort descriptors only, without the identifier tie-break.
  pub fn compare_sort_keys<T: ToFields>(&self, a: &T, b: &T) -> Ordering {
    for descriptor in &self.sort {
      let ordering = match (a.field(&descriptor.field), b.field(&descriptor.field)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.sort_cmp(&y),
      };
      let ordering = if descriptor.ascending {
        ordering
      } else {
        ordering.reverse()
      };
      if ordering != Ordering::Equal {
        return ordering;
      }
    }
    Ordering::Equal
  }

  /// Human readable description, stored alongside the query's bookkeeping.
  pub fn description(&self) -> String {
    self.to_string()
  }

  /// Stable, fixed-length key for this query.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for Query {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.record_type)?;
    if let Some(zone) = &self.zone {
      write!(f, " in {}", zone)?;
    }
    for (i, filter) in self.filters.iter().enumerate() {
      let sep = if i == 0 { " where" } else { " and" };
      write!(f, "{} {} {:?} {:?}", sep, filter.field, filter.op, filter.value)?;
    }
    for (i, sort) in self.sort.iter().enumerate() {
      let sep = if i == 0 { " order by" } else { "," };
      let dir = if sort.ascending { "asc" } else { "desc" };
      write!(f, "{} {} {}", sep, sort.field, dir)?;
    }
    Ok(())
  }
}

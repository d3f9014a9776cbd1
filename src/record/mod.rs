//! Record data model: identifiers, typed field values, the wire-side
//! `RemoteRecord` and the locally persisted `CachedEntity`.

mod query;
mod traits;

pub use query::{Filter, FilterOp, Query, QueryCursor, SortDescriptor};
pub use traits::{Cacheable, FieldReader, FromRecord, RecordType, SyncRecord, ToFields};
#[cfg(test)]
pub(crate) use traits::fixtures;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Field name to value mapping, ordered by field name.
pub type Fields = BTreeMap<String, FieldValue>;

/// Stable key of a record, scoped to an optional zone.
///
/// Two identifiers are equal iff both name and zone match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
  name: String,
  zone: Option<String>,
}

impl RecordId {
  /// Identifier in the default zone.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      zone: None,
    }
  }

  pub fn in_zone(name: impl Into<String>, zone: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      zone: Some(zone.into()),
    }
  }

  pub fn with_zone(name: impl Into<String>, zone: Option<String>) -> Self {
    Self {
      name: name.into(),
      zone,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn zone(&self) -> Option<&str> {
    self.zone.as_deref()
  }
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.zone {
      Some(zone) => write!(f, "{}/{}", zone, self.name),
      None => f.write_str(&self.name),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
  pub latitude: f64,
  pub longitude: f64,
}

/// Reference to a stored binary asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
  pub checksum: String,
  pub size: u64,
  pub download_url: Option<String>,
}

/// A typed field value as relayed by the remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
  String(String),
  Int64(i64),
  Double(f64),
  Timestamp(DateTime<Utc>),
  Bytes(Vec<u8>),
  Location(Location),
  Reference(RecordId),
  Asset(Asset),
}

impl FieldValue {
  /// Short name of the value's type, used in decode errors.
  pub fn kind(&self) -> &'static str {
    match self {
      FieldValue::String(_) => "string",
      FieldValue::Int64(_) => "int64",
      FieldValue::Double(_) => "double",
      FieldValue::Timestamp(_) => "timestamp",
      FieldValue::Bytes(_) => "bytes",
      FieldValue::Location(_) => "location",
      FieldValue::Reference(_) => "reference",
      FieldValue::Asset(_) => "asset",
    }
  }

  /// Ordering between two values of comparable kinds.
  ///
  /// Integers and doubles compare numerically with each other. Values of
  /// unrelated kinds, locations and assets have no ordering.
  pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
    use FieldValue::*;
    match (self, other) {
      (String(a), String(b)) => Some(a.cmp(b)),
      (Int64(a), Int64(b)) => Some(a.cmp(b)),
      (Double(a), Double(b)) => a.partial_cmp(b),
      (Int64(a), Double(b)) => (*a as f64).partial_cmp(b),
      (Double(a), Int64(b)) => a.partial_cmp(&(*b as f64)),
      (Timestamp(a), Timestamp(b)) => Some(a.cmp(b)),
      (Bytes(a), Bytes(b)) => Some(a.cmp(b)),
      (Reference(a), Reference(b)) => Some(a.cmp(b)),
      _ => None,
    }
  }

  /// Total order used for sorting.
  ///
  /// Agrees with [`compare`](Self::compare) where that is defined. Doubles
  /// use IEEE total ordering, so NaN sorts after every number. Values of
  /// unrelated kinds order by kind.
  pub fn sort_cmp(&self, other: &FieldValue) -> Ordering {
    use FieldValue::*;
    match (self, other) {
      (Double(a), Double(b)) => a.total_cmp(b),
      (Int64(a), Double(b)) => (*a as f64).total_cmp(b),
      (Double(a), Int64(b)) => a.total_cmp(&(*b as f64)),
      (Location(a), Location(b)) => a
        .latitude
        .total_cmp(&b.latitude)
        .then_with(|| a.longitude.total_cmp(&b.longitude)),
      (Asset(a), Asset(b)) => a
        .checksum
        .cmp(&b.checksum)
        .then_with(|| a.size.cmp(&b.size))
        .then_with(|| a.download_url.cmp(&b.download_url)),
      _ => self
        .compare(other)
        .unwrap_or_else(|| self.kind_rank().cmp(&other.kind_rank())),
    }
  }

  fn kind_rank(&self) -> u8 {
    match self {
      FieldValue::String(_) => 0,
      FieldValue::Int64(_) | FieldValue::Double(_) => 1,
      FieldValue::Timestamp(_) => 2,
      FieldValue::Bytes(_) => 3,
      FieldValue::Location(_) => 4,
      FieldValue::Reference(_) => 5,
      FieldValue::Asset(_) => 6,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      FieldValue::String(s) => Some(s),
      _ => None,
    }
  }
}

impl From<&str> for FieldValue {
  fn from(value: &str) -> Self {
    FieldValue::String(value.to_string())
  }
}

impl From<String> for FieldValue {
  fn from(value: String) -> Self {
    FieldValue::String(value)
  }
}

impl From<i64> for FieldValue {
  fn from(value: i64) -> Self {
    FieldValue::Int64(value)
  }
}

impl From<f64> for FieldValue {
  fn from(value: f64) -> Self {
    FieldValue::Double(value)
  }
}

impl From<DateTime<Utc>> for FieldValue {
  fn from(value: DateTime<Utc>) -> Self {
    FieldValue::Timestamp(value)
  }
}

/// Wire representation of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
  pub record_type: String,
  pub id: RecordId,
  /// Server version token used for conditional saves.
  pub change_tag: Option<String>,
  pub fields: Fields,
}

impl RemoteRecord {
  pub fn new(record_type: impl Into<String>, id: RecordId, fields: Fields) -> Self {
    Self {
      record_type: record_type.into(),
      id,
      change_tag: None,
      fields,
    }
  }
}

/// Locally persisted form of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity {
  pub record_type: String,
  pub id: RecordId,
  pub fields: Fields,
  pub last_synced: Option<DateTime<Utc>>,
}

impl CachedEntity {
  pub fn new(record_type: impl Into<String>, id: RecordId, fields: Fields) -> Self {
    Self {
      record_type: record_type.into(),
      id,
      fields,
      last_synced: None,
    }
  }

  /// Build the cached form of a decoded value, stamped as synced now.
  pub fn synced<T: SyncRecord>(value: &T) -> Self {
    Self {
      record_type: T::record_type().to_string(),
      id: value.record_id().clone(),
      fields: value.to_fields(),
      last_synced: Some(Utc::now()),
    }
  }

  /// Cached form of a record as the server sent it, stamped as synced now.
  ///
  /// Keeps every field, including ones no typed record models.
  pub fn from_remote(record: RemoteRecord) -> Self {
    Self {
      record_type: record.record_type,
      id: record.id,
      fields: record.fields,
      last_synced: Some(Utc::now()),
    }
  }

  /// Decode this entity into its typed form.
  pub fn decode<T: FromRecord>(&self) -> Result<T, crate::error::DecodeError> {
    T::from_record(&self.id, &self.fields)
  }
}

/// Conflict policy for a conditional save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SavePolicy {
  /// Save only if the server record is unchanged since it was fetched.
  #[default]
  IfUnchanged,
  /// Overwrite the server record unconditionally.
  Overwrite,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_record_id_equality_includes_zone() {
    assert_eq!(RecordId::new("A"), RecordId::new("A"));
    assert_ne!(RecordId::new("A"), RecordId::in_zone("A", "notes"));
    assert_ne!(RecordId::in_zone("A", "a"), RecordId::in_zone("A", "b"));
    assert_eq!(RecordId::in_zone("A", "notes").to_string(), "notes/A");
  }

  #[test]
  fn test_numeric_values_compare_across_kinds() {
    assert_eq!(
      FieldValue::Int64(2).compare(&FieldValue::Double(2.5)),
      Some(Ordering::Less)
    );
    assert_eq!(
      FieldValue::String("b".into()).compare(&FieldValue::String("a".into())),
      Some(Ordering::Greater)
    );
    assert_eq!(FieldValue::Int64(1).compare(&FieldValue::from("1")), None);
  }

  #[test]
  fn test_sort_order_is_total() {
    let nan = FieldValue::Double(f64::NAN);
    assert_eq!(nan.sort_cmp(&FieldValue::Double(1.0)), Ordering::Greater);
    assert_eq!(FieldValue::Int64(3).sort_cmp(&nan), Ordering::Less);
    assert_eq!(nan.sort_cmp(&nan), Ordering::Equal);

    // Mixed kinds order by kind, in both directions
    let text = FieldValue::from("1");
    let number = FieldValue::Int64(1);
    assert_eq!(text.sort_cmp(&number), Ordering::Less);
    assert_eq!(number.sort_cmp(&text), Ordering::Greater);
    assert_eq!(
      FieldValue::Int64(2).sort_cmp(&FieldValue::Double(2.5)),
      Ordering::Less
    );
  }

  #[test]
  fn test_field_value_serde_is_tagged() {
    let json = serde_json::to_value(FieldValue::Int64(7)).unwrap();
    assert_eq!(json, serde_json::json!({"type": "int64", "value": 7}));
    let back: FieldValue = serde_json::from_value(json).unwrap();
    assert_eq!(back, FieldValue::Int64(7));
  }
}

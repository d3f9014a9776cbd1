//! Capability traits a record type implements to take part in syncing.
//!
//! Each capability is separate: the synchronizer and query controllers are
//! generic over [`SyncRecord`], the intersection of all of them.

use chrono::{DateTime, Utc};

use super::{FieldValue, Fields, RecordId};
use crate::error::DecodeError;

/// Record type name shared by the remote backend and the local store
/// (e.g. "Note", "Contact").
pub trait RecordType {
  fn record_type() -> &'static str;
}

/// Decoding from a record's identifier and field values.
///
/// Used both for remote records and for cached entities, since the cached
/// fields mirror the remote ones.
pub trait FromRecord: Sized {
  fn from_record(id: &RecordId, fields: &Fields) -> Result<Self, DecodeError>;
}

/// Encoding into the flat field mapping persisted by the cache.
pub trait ToFields {
  fn to_fields(&self) -> Fields;

  /// Single field lookup, used by sort comparators.
  fn field(&self, name: &str) -> Option<FieldValue> {
    self.to_fields().remove(name)
  }
}

/// Lookup by identifier in the local store.
pub trait Cacheable: RecordType {
  fn record_id(&self) -> &RecordId;
}

/// Everything the synchronizer and query controllers need from a type.
pub trait SyncRecord:
  RecordType + FromRecord + ToFields + Cacheable + Clone + PartialEq + Send + Sync + 'static
{
}

impl<T> SyncRecord for T where
  T: RecordType + FromRecord + ToFields + Cacheable + Clone + PartialEq + Send + Sync + 'static
{
}

/// Typed accessors over a field map that produce [`DecodeError`]s naming the
/// record type and field.
pub struct FieldReader<'a> {
  record_type: &'a str,
  fields: &'a Fields,
}

impl<'a> FieldReader<'a> {
  pub fn new(record_type: &'a str, fields: &'a Fields) -> Self {
    Self {
      record_type,
      fields,
    }
  }

  fn require(&self, field: &str) -> Result<&'a FieldValue, DecodeError> {
    self
      .fields
      .get(field)
      .ok_or_else(|| DecodeError::MissingField {
        record_type: self.record_type.to_string(),
        field: field.to_string(),
      })
  }

  fn mismatch(&self, field: &str, expected: &'static str, found: &FieldValue) -> DecodeError {
    DecodeError::TypeMismatch {
      record_type: self.record_type.to_string(),
      field: field.to_string(),
      expected,
      found: found.kind(),
    }
  }

  pub fn string(&self, field: &str) -> Result<String, DecodeError> {
    match self.require(field)? {
      FieldValue::String(s) => Ok(s.clone()),
      other => Err(self.mismatch(field, "string", other)),
    }
  }

  pub fn opt_string(&self, field: &str) -> Result<Option<String>, DecodeError> {
    match self.fields.get(field) {
      None => Ok(None),
      Some(FieldValue::String(s)) => Ok(Some(s.clone())),
      Some(other) => Err(self.mismatch(field, "string", other)),
    }
  }

  pub fn int64(&self, field: &str) -> Result<i64, DecodeError> {
    match self.require(field)? {
      FieldValue::Int64(n) => Ok(*n),
      other => Err(self.mismatch(field, "int64", other)),
    }
  }

  pub fn double(&self, field: &str) -> Result<f64, DecodeError> {
    match self.require(field)? {
      FieldValue::Double(n) => Ok(*n),
      FieldValue::Int64(n) => Ok(*n as f64),
      other => Err(self.mismatch(field, "double", other)),
    }
  }

  pub fn timestamp(&self, field: &str) -> Result<DateTime<Utc>, DecodeError> {
    match self.require(field)? {
      FieldValue::Timestamp(t) => Ok(*t),
      other => Err(self.mismatch(field, "timestamp", other)),
    }
  }

  pub fn opt_timestamp(&self, field: &str) -> Result<Option<DateTime<Utc>>, DecodeError> {
    match self.fields.get(field) {
      None => Ok(None),
      Some(FieldValue::Timestamp(t)) => Ok(Some(*t)),
      Some(other) => Err(self.mismatch(field, "timestamp", other)),
    }
  }

  pub fn reference(&self, field: &str) -> Result<RecordId, DecodeError> {
    match self.require(field)? {
      FieldValue::Reference(id) => Ok(id.clone()),
      other => Err(self.mismatch(field, "reference", other)),
    }
  }
}

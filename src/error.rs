//! Error taxonomy shared by the store, the synchronizer and query controllers.

use std::sync::Arc;

use crate::record::RecordId;

/// A remote record could not be converted into the local schema.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
  #[error("{record_type}: missing field `{field}`")]
  MissingField {
    record_type: String,
    field: String,
  },
  #[error("{record_type}: field `{field}` expected {expected}, found {found}")]
  TypeMismatch {
    record_type: String,
    field: String,
    expected: &'static str,
    found: &'static str,
  },
  #[error("{record_type}: {reason}")]
  Invalid { record_type: String, reason: String },
}

/// Failures reported by a remote backend.
///
/// `NotFound` is the one distinguished subtype; everything else is opaque to
/// the cache and passed through unchanged.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
  #[error("record {0} not found")]
  NotFound(RecordId),
  #[error("server error {code}: {reason}")]
  Server { code: String, reason: String },
  #[error("transport error: {0}")]
  Transport(String),
  #[error("malformed response: {0}")]
  Malformed(String),
}

impl RemoteError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, RemoteError::NotFound(_))
  }
}

/// Local store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("sqlite: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("failed to encode cached fields: {0}")]
  Encode(#[from] serde_json::Error),
  #[error("invalid cached row: {0}")]
  InvalidRow(String),
  #[error("cache i/o: {0}")]
  Io(#[from] std::io::Error),
  #[error("cache writer has stopped")]
  WriterStopped,
}

/// Error returned by every synchronizer operation and carried in query events.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
  /// The remote record is absent. The local copy has already been evicted
  /// by the time the caller sees this.
  #[error("record {0} not found")]
  NotFound(RecordId),
  #[error(transparent)]
  Decode(#[from] DecodeError),
  #[error(transparent)]
  Remote(RemoteError),
  #[error("local cache commit failed: {0}")]
  Persistence(Arc<StoreError>),
}

impl SyncError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, SyncError::NotFound(_))
  }
}

impl From<RemoteError> for SyncError {
  fn from(err: RemoteError) -> Self {
    match err {
      RemoteError::NotFound(id) => SyncError::NotFound(id),
      other => SyncError::Remote(other),
    }
  }
}

impl From<StoreError> for SyncError {
  fn from(err: StoreError) -> Self {
    tracing::error!(error = %err, "cache commit failed");
    SyncError::Persistence(Arc::new(err))
  }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

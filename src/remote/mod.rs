//! Remote record backend interface and its HTTP implementation.

mod api_types;
mod client;
#[cfg(test)]
pub(crate) mod mock;

pub use client::HttpBackend;

use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;

use crate::error::RemoteError;
use crate::record::{Query, QueryCursor, RecordId, RemoteRecord, SavePolicy};

/// Per-identifier outcome of a lookup. Identifiers the server did not answer
/// for are treated as not found.
pub type RecordsById = HashMap<RecordId, Result<RemoteRecord, RemoteError>>;

/// Records to save and identifiers to delete in one modify call.
#[derive(Debug, Clone, Default)]
pub struct ModifyRequest {
  pub save: Vec<RemoteRecord>,
  pub delete: Vec<RecordId>,
  pub policy: SavePolicy,
}

#[derive(Debug, Clone, Default)]
pub struct ModifyResult {
  pub saved: Vec<RemoteRecord>,
  pub deleted: Vec<RecordId>,
}

/// One page request: a fresh query when `cursor` is `None`, otherwise a
/// continuation.
#[derive(Debug, Clone)]
pub struct QueryRequest {
  pub query: Query,
  pub cursor: Option<QueryCursor>,
  pub limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct QueryPage {
  pub records: Vec<RemoteRecord>,
  /// Present when the server has more results.
  pub cursor: Option<QueryCursor>,
}

/// Asynchronous, independently failable remote operations.
#[async_trait]
pub trait RemoteBackend: Send + Sync + 'static {
  /// Look up records by identifier, optionally restricted to `desired_keys`.
  async fn fetch_records(
    &self,
    ids: &[RecordId],
    desired_keys: Option<&[String]>,
  ) -> Result<RecordsById, RemoteError>;

  async fn modify_records(&self, request: ModifyRequest) -> Result<ModifyResult, RemoteError>;

  async fn run_query(&self, request: QueryRequest) -> Result<QueryPage, RemoteError>;
}

/// Look up a single record, mapping an unanswered identifier to not found.
pub async fn fetch_record<B: RemoteBackend + ?Sized>(
  backend: &B,
  id: &RecordId,
  desired_keys: Option<&[String]>,
) -> Result<RemoteRecord, RemoteError> {
  let mut records = backend
    .fetch_records(std::slice::from_ref(id), desired_keys)
    .await?;
  records
    .remove(id)
    .unwrap_or_else(|| Err(RemoteError::NotFound(id.clone())))
}

/// Every page of `query`, following continuation cursors until the server
/// reports no more results. Stops after the first error.
pub fn query_pages<B: RemoteBackend + ?Sized>(
  backend: &B,
  query: Query,
  limit: usize,
) -> impl Stream<Item = Result<QueryPage, RemoteError>> + '_ {
  // Outer None: exhausted. Inner None: first page.
  futures::stream::try_unfold(Some(None), move |next: Option<Option<QueryCursor>>| {
    let query = query.clone();
    async move {
      let Some(cursor) = next else {
        return Ok(None);
      };
      let page = backend
        .run_query(QueryRequest {
          query,
          cursor,
          limit,
        })
        .await?;
      let next = page.cursor.clone().map(Some);
      Ok(Some((page, next)))
    }
  })
}

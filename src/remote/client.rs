use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, instrument};
use url::Url;

use super::api_types::{
  ApiErrorResponse, ApiLookupRequest, ApiModifyRequest, ApiOperation, ApiQuery, ApiQueryRequest,
  ApiQueryResponse, ApiRecord, ApiRecordRef, ApiRecordsResponse, ApiZoneId,
};
use super::{ModifyRequest, ModifyResult, QueryPage, QueryRequest, RecordsById, RemoteBackend};
use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::record::{QueryCursor, RecordId, SavePolicy};

/// Records web service client.
///
/// Requests are scoped to a zone; operations touching several zones are
/// split into one request per zone.
#[derive(Clone)]
pub struct HttpBackend {
  http: reqwest::Client,
  base: Url,
  token: String,
}

impl HttpBackend {
  pub fn new(config: &RemoteConfig, token: String) -> Result<Self, RemoteError> {
    let base = config
      .database_url()
      .map_err(|e| RemoteError::Transport(format!("invalid remote url: {}", e)))?;
    let http = reqwest::Client::builder()
      .user_agent(concat!("zonesync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| RemoteError::Transport(e.to_string()))?;
    Ok(Self { http, base, token })
  }

  fn endpoint(&self, op: &str) -> Result<Url, RemoteError> {
    self
      .base
      .join(&format!("records/{}", op))
      .map_err(|e| RemoteError::Transport(format!("invalid endpoint: {}", e)))
  }

  async fn post<B: Serialize, R: DeserializeOwned>(&self, op: &str, body: &B) -> Result<R, RemoteError> {
    let response = self
      .http
      .post(self.endpoint(op)?)
      .bearer_auth(&self.token)
      .json(body)
      .send()
      .await
      .map_err(|e| RemoteError::Transport(e.to_string()))?;

    let status = response.status();
    let bytes = response
      .bytes()
      .await
      .map_err(|e| RemoteError::Transport(e.to_string()))?;

    if !status.is_success() {
      return Err(match serde_json::from_slice::<ApiErrorResponse>(&bytes) {
        Ok(err) => RemoteError::Server {
          code: err.server_error_code,
          reason: err.reason,
        },
        Err(_) => RemoteError::Server {
          code: status.as_u16().to_string(),
          reason: String::from_utf8_lossy(&bytes).into_owned(),
        },
      });
    }

    serde_json::from_slice(&bytes).map_err(|e| RemoteError::Malformed(e.to_string()))
  }
}

/// Group identifiers by zone, keeping request order within a zone.
fn by_zone<'a, I>(ids: I) -> BTreeMap<Option<String>, Vec<&'a RecordId>>
where
  I: IntoIterator<Item = &'a RecordId>,
{
  let mut zones: BTreeMap<Option<String>, Vec<&RecordId>> = BTreeMap::new();
  for id in ids {
    zones.entry(id.zone().map(String::from)).or_default().push(id);
  }
  zones
}

fn operation_type(change_tag: Option<&str>, policy: SavePolicy) -> &'static str {
  match (change_tag, policy) {
    (_, SavePolicy::Overwrite) => "forceUpdate",
    (Some(_), SavePolicy::IfUnchanged) => "update",
    (None, SavePolicy::IfUnchanged) => "create",
  }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
  #[instrument(skip(self), fields(count = ids.len()))]
  async fn fetch_records(
    &self,
    ids: &[RecordId],
    desired_keys: Option<&[String]>,
  ) -> Result<RecordsById, RemoteError> {
    let lookups = by_zone(ids).into_iter().map(|(zone, zone_ids)| async move {
      let body = ApiLookupRequest {
        records: zone_ids
          .iter()
          .map(|id| ApiRecordRef {
            record_name: id.name().to_string(),
          })
          .collect(),
        zone_id: ApiZoneId::for_zone(zone.as_deref()),
        desired_keys: desired_keys.map(<[String]>::to_vec),
      };
      let response: ApiRecordsResponse = self.post("lookup", &body).await?;

      Ok::<_, RemoteError>(
        response
          .records
          .into_iter()
          .map(|record| {
            let id = RecordId::with_zone(record.record_name.clone(), zone.clone());
            (id, record.into_remote(zone.as_deref()))
          })
          .collect::<Vec<_>>(),
      )
    });

    // One request per zone, issued concurrently
    let mut results = RecordsById::new();
    for records in futures::future::try_join_all(lookups).await? {
      results.extend(records);
    }

    debug!(returned = results.len(), "lookup complete");
    Ok(results)
  }

  #[instrument(skip(self, request), fields(save = request.save.len(), delete = request.delete.len()))]
  async fn modify_records(&self, request: ModifyRequest) -> Result<ModifyResult, RemoteError> {
    let mut operations: BTreeMap<Option<String>, Vec<ApiOperation>> = BTreeMap::new();

    for record in &request.save {
      operations
        .entry(record.id.zone().map(String::from))
        .or_default()
        .push(ApiOperation {
          operation_type: operation_type(record.change_tag.as_deref(), request.policy),
          record: ApiRecord::from_remote(record),
        });
    }
    for id in &request.delete {
      operations
        .entry(id.zone().map(String::from))
        .or_default()
        .push(ApiOperation {
          operation_type: "forceDelete",
          record: ApiRecord {
            record_name: id.name().to_string(),
            ..Default::default()
          },
        });
    }

    let mut result = ModifyResult::default();
    for (zone, operations) in operations {
      let body = ApiModifyRequest {
        operations,
        zone_id: ApiZoneId::for_zone(zone.as_deref()),
        atomic: true,
      };
      let response: ApiRecordsResponse = self.post("modify", &body).await?;

      for record in response.records {
        let id = RecordId::with_zone(record.record_name.clone(), zone.clone());
        if request.delete.contains(&id) {
          // Deletions come back as bare names, or as per-record errors
          if let Some(err) = record.error(zone.as_deref()) {
            return Err(err);
          }
          result.deleted.push(id);
        } else {
          result.saved.push(record.into_remote(zone.as_deref())?);
        }
      }
    }
    Ok(result)
  }

  #[instrument(skip(self, request), fields(record_type = %request.query.record_type, limit = request.limit))]
  async fn run_query(&self, request: QueryRequest) -> Result<QueryPage, RemoteError> {
    let zone = request.query.zone.clone();
    let body = ApiQueryRequest {
      zone_id: ApiZoneId::for_zone(zone.as_deref()),
      results_limit: request.limit,
      query: ApiQuery::from(&request.query),
      continuation_marker: request.cursor.map(|c| c.as_str().to_string()),
    };
    let response: ApiQueryResponse = self.post("query", &body).await?;

    let records = response
      .records
      .into_iter()
      .map(|record| record.into_remote(zone.as_deref()))
      .collect::<Result<Vec<_>, _>>()?;

    debug!(returned = records.len(), more = response.continuation_marker.is_some(), "query page");
    Ok(QueryPage {
      records,
      cursor: response.continuation_marker.map(QueryCursor::new),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_operation_type_follows_policy() {
    assert_eq!(operation_type(None, SavePolicy::IfUnchanged), "create");
    assert_eq!(operation_type(Some("t"), SavePolicy::IfUnchanged), "update");
    assert_eq!(operation_type(Some("t"), SavePolicy::Overwrite), "forceUpdate");
  }

  #[test]
  fn test_ids_grouped_by_zone() {
    let ids = vec![
      RecordId::new("a"),
      RecordId::in_zone("b", "work"),
      RecordId::new("c"),
    ];
    let zones = by_zone(&ids);
    assert_eq!(zones.len(), 2);
    assert_eq!(zones[&None].len(), 2);
    assert_eq!(zones[&Some("work".to_string())][0].name(), "b");
  }

  #[test]
  fn test_endpoint_joins_database_url() {
    let config = RemoteConfig {
      url: "https://api.example.com".to_string(),
      container: "iCloud.com.example.notes".to_string(),
      environment: "development".to_string(),
      database: "private".to_string(),
      default_zone: None,
    };
    let backend = HttpBackend::new(&config, "token".to_string()).unwrap();
    assert_eq!(
      backend.endpoint("lookup").unwrap().as_str(),
      "https://api.example.com/database/1/iCloud.com.example.notes/development/private/records/lookup"
    );
  }
}

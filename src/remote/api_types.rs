//! Serde types matching the records web service JSON.
//!
//! These types are separate from the record model so the wire format stays
//! out of the cache and query code.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::error::RemoteError;
use crate::record::{
  Asset, FieldValue, Fields, Filter, FilterOp, Location, Query, RecordId, RemoteRecord,
  SortDescriptor,
};

// ============================================================================
// Common nested types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiZoneId {
  #[serde(rename = "zoneName")]
  pub zone_name: String,
}

impl ApiZoneId {
  pub fn for_zone(zone: Option<&str>) -> Option<Self> {
    zone.map(|z| Self {
      zone_name: z.to_string(),
    })
  }
}

#[derive(Debug, Serialize)]
pub struct ApiRecordRef {
  #[serde(rename = "recordName")]
  pub record_name: String,
}

/// A typed field value: `{"value": ..., "type": "STRING"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiField {
  pub value: Value,
  #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
  pub kind: Option<String>,
}

impl ApiField {
  fn typed(kind: &str, value: Value) -> Self {
    Self {
      value,
      kind: Some(kind.to_string()),
    }
  }
}

impl From<&FieldValue> for ApiField {
  fn from(value: &FieldValue) -> Self {
    match value {
      FieldValue::String(s) => Self::typed("STRING", json!(s)),
      FieldValue::Int64(n) => Self::typed("INT64", json!(n)),
      FieldValue::Double(n) => Self::typed("DOUBLE", json!(n)),
      FieldValue::Timestamp(t) => Self::typed("TIMESTAMP", json!(t.timestamp_millis())),
      FieldValue::Bytes(b) => Self::typed("BYTES", json!(BASE64.encode(b))),
      FieldValue::Location(l) => Self::typed(
        "LOCATION",
        json!({"latitude": l.latitude, "longitude": l.longitude}),
      ),
      FieldValue::Reference(id) => {
        let mut reference = json!({"recordName": id.name(), "action": "NONE"});
        if let Some(zone) = id.zone() {
          reference["zoneID"] = json!({"zoneName": zone});
        }
        Self::typed("REFERENCE", reference)
      }
      FieldValue::Asset(a) => Self::typed(
        "ASSETID",
        json!({"fileChecksum": a.checksum, "size": a.size, "downloadURL": a.download_url}),
      ),
    }
  }
}

impl ApiField {
  /// Convert to a field value. `record_zone` is the zone a reference without
  /// an explicit zone is assumed to live in.
  pub fn to_field_value(&self, name: &str, record_zone: Option<&str>) -> Result<FieldValue, RemoteError> {
    let bad = || RemoteError::Malformed(format!("field `{}` has invalid value {}", name, self.value));

    let kind = match self.kind.as_deref() {
      Some(kind) => kind,
      None => match &self.value {
        Value::String(_) => "STRING",
        Value::Number(n) if n.is_i64() => "INT64",
        Value::Number(_) => "DOUBLE",
        _ => return Err(bad()),
      },
    };

    let value = match kind {
      "STRING" => FieldValue::String(self.value.as_str().ok_or_else(bad)?.to_string()),
      "INT64" => FieldValue::Int64(self.value.as_i64().ok_or_else(bad)?),
      "DOUBLE" => FieldValue::Double(self.value.as_f64().ok_or_else(bad)?),
      "TIMESTAMP" => {
        let millis = self.value.as_i64().ok_or_else(bad)?;
        FieldValue::Timestamp(Utc.timestamp_millis_opt(millis).single().ok_or_else(bad)?)
      }
      "BYTES" => {
        let encoded = self.value.as_str().ok_or_else(bad)?;
        FieldValue::Bytes(BASE64.decode(encoded).map_err(|_| bad())?)
      }
      "LOCATION" => FieldValue::Location(Location {
        latitude: self.value["latitude"].as_f64().ok_or_else(bad)?,
        longitude: self.value["longitude"].as_f64().ok_or_else(bad)?,
      }),
      "REFERENCE" => {
        let record_name = self.value["recordName"].as_str().ok_or_else(bad)?;
        let zone = self.value["zoneID"]["zoneName"]
          .as_str()
          .or(record_zone)
          .map(String::from);
        FieldValue::Reference(RecordId::with_zone(record_name, zone))
      }
      "ASSETID" => FieldValue::Asset(Asset {
        checksum: self.value["fileChecksum"].as_str().ok_or_else(bad)?.to_string(),
        size: self.value["size"].as_u64().unwrap_or_default(),
        download_url: self.value["downloadURL"].as_str().map(String::from),
      }),
      other => {
        return Err(RemoteError::Malformed(format!(
          "field `{}` has unknown type {}",
          name, other
        )))
      }
    };
    Ok(value)
  }
}

// ============================================================================
// Records
// ============================================================================

/// A record as sent and received, or a per-record error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRecord {
  /// Empty when the server should assign a name.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub record_name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub record_type: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub record_change_tag: Option<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub fields: BTreeMap<String, ApiField>,
  #[serde(default, skip_serializing)]
  pub server_error_code: Option<String>,
  #[serde(default, skip_serializing)]
  pub reason: Option<String>,
}

impl ApiRecord {
  pub fn from_remote(record: &RemoteRecord) -> Self {
    Self {
      record_name: record.id.name().to_string(),
      record_type: Some(record.record_type.clone()),
      record_change_tag: record.change_tag.clone(),
      fields: record
        .fields
        .iter()
        .map(|(name, value)| (name.clone(), ApiField::from(value)))
        .collect(),
      ..Default::default()
    }
  }

  /// The per-record error the server reported for this entry, if any.
  pub fn error(&self, zone: Option<&str>) -> Option<RemoteError> {
    let code = self.server_error_code.as_ref()?;
    let id = RecordId::with_zone(self.record_name.clone(), zone.map(String::from));
    Some(match code.as_str() {
      "NOT_FOUND" => RemoteError::NotFound(id),
      _ => RemoteError::Server {
        code: code.clone(),
        reason: self.reason.clone().unwrap_or_default(),
      },
    })
  }

  /// Convert into a record in `zone`, surfacing per-record server errors.
  pub fn into_remote(self, zone: Option<&str>) -> Result<RemoteRecord, RemoteError> {
    if let Some(err) = self.error(zone) {
      return Err(err);
    }
    let id = RecordId::with_zone(self.record_name, zone.map(String::from));

    let mut fields = Fields::new();
    for (name, field) in &self.fields {
      fields.insert(name.clone(), field.to_field_value(name, zone)?);
    }

    Ok(RemoteRecord {
      record_type: self
        .record_type
        .ok_or_else(|| RemoteError::Malformed(format!("record {} has no type", id)))?,
      id,
      change_tag: self.record_change_tag,
      fields,
    })
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiRecordsResponse {
  #[serde(default)]
  pub records: Vec<ApiRecord>,
}

/// Error body returned with non-success HTTP status codes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
  pub server_error_code: String,
  #[serde(default)]
  pub reason: String,
}

// ============================================================================
// records/lookup
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiLookupRequest {
  pub records: Vec<ApiRecordRef>,
  #[serde(rename = "zoneID", skip_serializing_if = "Option::is_none")]
  pub zone_id: Option<ApiZoneId>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub desired_keys: Option<Vec<String>>,
}

// ============================================================================
// records/modify
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiOperation {
  pub operation_type: &'static str,
  pub record: ApiRecord,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiModifyRequest {
  pub operations: Vec<ApiOperation>,
  #[serde(rename = "zoneID", skip_serializing_if = "Option::is_none")]
  pub zone_id: Option<ApiZoneId>,
  pub atomic: bool,
}

// ============================================================================
// records/query
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiFilter {
  pub field_name: String,
  pub comparator: FilterOp,
  pub field_value: ApiField,
}

impl From<&Filter> for ApiFilter {
  fn from(filter: &Filter) -> Self {
    Self {
      field_name: filter.field.clone(),
      comparator: filter.op,
      field_value: ApiField::from(&filter.value),
    }
  }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSort {
  pub field_name: String,
  pub ascending: bool,
}

impl From<&SortDescriptor> for ApiSort {
  fn from(sort: &SortDescriptor) -> Self {
    Self {
      field_name: sort.field.clone(),
      ascending: sort.ascending,
    }
  }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiQuery {
  pub record_type: String,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub filter_by: Vec<ApiFilter>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub sort_by: Vec<ApiSort>,
}

impl From<&Query> for ApiQuery {
  fn from(query: &Query) -> Self {
    Self {
      record_type: query.record_type.clone(),
      filter_by: query.filters.iter().map(ApiFilter::from).collect(),
      sort_by: query.sort.iter().map(ApiSort::from).collect(),
    }
  }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiQueryRequest {
  #[serde(rename = "zoneID", skip_serializing_if = "Option::is_none")]
  pub zone_id: Option<ApiZoneId>,
  pub results_limit: usize,
  pub query: ApiQuery,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub continuation_marker: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiQueryResponse {
  #[serde(default)]
  pub records: Vec<ApiRecord>,
  pub continuation_marker: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_field_values_survive_the_wire() {
    let values = vec![
      FieldValue::from("hello"),
      FieldValue::Int64(-4),
      FieldValue::Double(2.5),
      FieldValue::Timestamp(Utc.timestamp_millis_opt(1_700_000_000_123).unwrap()),
      FieldValue::Bytes(vec![0, 1, 254]),
      FieldValue::Location(Location {
        latitude: 52.5,
        longitude: 13.4,
      }),
      FieldValue::Reference(RecordId::in_zone("parent", "work")),
    ];
    for value in values {
      let wire = ApiField::from(&value);
      assert_eq!(wire.to_field_value("f", None).unwrap(), value);
    }
  }

  #[test]
  fn test_reference_without_zone_inherits_record_zone() {
    let field = ApiField::typed("REFERENCE", json!({"recordName": "p"}));
    let value = field.to_field_value("parent", Some("work")).unwrap();
    assert_eq!(value, FieldValue::Reference(RecordId::in_zone("p", "work")));
  }

  #[test]
  fn test_untyped_values_are_inferred() {
    let field: ApiField = serde_json::from_value(json!({"value": 3})).unwrap();
    assert_eq!(field.to_field_value("n", None).unwrap(), FieldValue::Int64(3));
  }

  #[test]
  fn test_record_with_server_error_code() {
    let record: ApiRecord = serde_json::from_value(json!({
      "recordName": "A",
      "serverErrorCode": "NOT_FOUND",
      "reason": "gone"
    }))
    .unwrap();
    let err = record.into_remote(Some("notes")).unwrap_err();
    assert_eq!(err, RemoteError::NotFound(RecordId::in_zone("A", "notes")));

    let record: ApiRecord = serde_json::from_value(json!({
      "recordName": "A",
      "serverErrorCode": "CONFLICT",
      "reason": "changed"
    }))
    .unwrap();
    assert!(matches!(
      record.into_remote(None).unwrap_err(),
      RemoteError::Server { ref code, .. } if code == "CONFLICT"
    ));
  }

  #[test]
  fn test_parse_record() {
    let record: ApiRecord = serde_json::from_value(json!({
      "recordName": "A",
      "recordType": "Note",
      "recordChangeTag": "t1",
      "fields": {
        "title": {"value": "hi", "type": "STRING"},
        "rank": {"value": 2, "type": "INT64"}
      }
    }))
    .unwrap();
    let remote = record.into_remote(None).unwrap();
    assert_eq!(remote.record_type, "Note");
    assert_eq!(remote.change_tag.as_deref(), Some("t1"));
    assert_eq!(remote.fields["rank"], FieldValue::Int64(2));
  }

  #[test]
  fn test_query_request_shape() {
    let query = Query::new("Note")
      .in_zone("work")
      .filter(Filter::equals("done", 0i64))
      .sort_by(SortDescriptor::descending("rank"));
    let body = ApiQueryRequest {
      zone_id: ApiZoneId::for_zone(query.zone.as_deref()),
      results_limit: 50,
      query: ApiQuery::from(&query),
      continuation_marker: None,
    };
    assert_eq!(
      serde_json::to_value(&body).unwrap(),
      json!({
        "zoneID": {"zoneName": "work"},
        "resultsLimit": 50,
        "query": {
          "recordType": "Note",
          "filterBy": [{
            "fieldName": "done",
            "comparator": "EQUALS",
            "fieldValue": {"value": 0, "type": "INT64"}
          }],
          "sortBy": [{"fieldName": "rank", "ascending": false}]
        }
      })
    );
  }
}

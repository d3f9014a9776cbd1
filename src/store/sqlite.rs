//! SQLite persistence for cached entities and query bookkeeping.
//!
//! Everything here runs on the cache writer thread; the functions take the
//! connection (or open transaction) they operate on.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use super::{ChangeKind, QueryState, StoreChange};
use crate::error::StoreError;
use crate::record::{CachedEntity, Fields, RecordId};

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Mirrored records (fields stored as serialized JSON)
CREATE TABLE IF NOT EXISTS cached_entity (
    record_type TEXT NOT NULL,
    zone TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL,
    fields BLOB NOT NULL,
    last_synced TEXT,
    PRIMARY KEY (record_type, zone, name)
);

CREATE INDEX IF NOT EXISTS idx_cached_entity_type
    ON cached_entity(record_type);

-- Last successful refresh per query
CREATE TABLE IF NOT EXISTS query_state (
    fingerprint TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    record_type TEXT NOT NULL,
    refreshed_at TEXT NOT NULL,
    row_count INTEGER NOT NULL
);
"#;

/// Open (or create) the cache database at `path`.
pub(super) fn open(path: &Path) -> Result<Connection, StoreError> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  let conn = Connection::open(path)?;
  run_migrations(&conn)?;
  Ok(conn)
}

pub(super) fn open_in_memory() -> Result<Connection, StoreError> {
  let conn = Connection::open_in_memory()?;
  run_migrations(&conn)?;
  Ok(conn)
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
  conn.execute_batch(CACHE_SCHEMA)?;
  Ok(())
}

fn zone_key(id: &RecordId) -> &str {
  id.zone().unwrap_or("")
}

fn row_to_entity(
  record_type: String,
  zone: String,
  name: String,
  data: Vec<u8>,
  last_synced: Option<String>,
) -> Result<CachedEntity, StoreError> {
  let fields: Fields = serde_json::from_slice(&data)?;
  let zone = if zone.is_empty() { None } else { Some(zone) };
  let last_synced = last_synced.map(|s| parse_datetime(&s)).transpose()?;
  Ok(CachedEntity {
    record_type,
    id: RecordId::with_zone(name, zone),
    fields,
    last_synced,
  })
}

pub(super) fn lookup(
  conn: &Connection,
  record_type: &str,
  id: &RecordId,
) -> Result<Option<CachedEntity>, StoreError> {
  let row = conn
    .query_row(
      "SELECT fields, last_synced FROM cached_entity
       WHERE record_type = ? AND zone = ? AND name = ?",
      params![record_type, zone_key(id), id.name()],
      |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Option<String>>(1)?)),
    )
    .optional()?;

  row
    .map(|(data, last_synced)| {
      row_to_entity(
        record_type.to_string(),
        zone_key(id).to_string(),
        id.name().to_string(),
        data,
        last_synced,
      )
    })
    .transpose()
}

/// Insert or replace an entity, reporting what it replaced.
pub(super) fn upsert(conn: &Connection, entity: &CachedEntity) -> Result<StoreChange, StoreError> {
  let previous = lookup(conn, &entity.record_type, &entity.id)?;
  let data = serde_json::to_vec(&entity.fields)?;
  let last_synced = entity.last_synced.map(|t| t.to_rfc3339());

  conn.execute(
    "INSERT OR REPLACE INTO cached_entity (record_type, zone, name, fields, last_synced)
     VALUES (?, ?, ?, ?, ?)",
    params![
      entity.record_type,
      zone_key(&entity.id),
      entity.id.name(),
      data,
      last_synced
    ],
  )?;

  let kind = if previous.is_some() {
    ChangeKind::Updated
  } else {
    ChangeKind::Inserted
  };
  Ok(StoreChange {
    kind,
    record_type: entity.record_type.clone(),
    id: entity.id.clone(),
    previous,
    current: Some(entity.clone()),
  })
}

/// Remove an entity. Returns `None` when nothing was cached.
pub(super) fn delete(
  conn: &Connection,
  record_type: &str,
  id: &RecordId,
) -> Result<Option<StoreChange>, StoreError> {
  let Some(previous) = lookup(conn, record_type, id)? else {
    return Ok(None);
  };

  conn.execute(
    "DELETE FROM cached_entity WHERE record_type = ? AND zone = ? AND name = ?",
    params![record_type, zone_key(id), id.name()],
  )?;

  Ok(Some(StoreChange {
    kind: ChangeKind::Deleted,
    record_type: record_type.to_string(),
    id: id.clone(),
    previous: Some(previous),
    current: None,
  }))
}

/// All cached entities of one type.
pub(super) fn fetch_type(conn: &Connection, record_type: &str) -> Result<Vec<CachedEntity>, StoreError> {
  let mut stmt = conn.prepare(
    "SELECT zone, name, fields, last_synced FROM cached_entity
     WHERE record_type = ?
     ORDER BY zone, name",
  )?;

  let rows = stmt
    .query_map(params![record_type], |row| {
      Ok((
        row.get::<_, String>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, Vec<u8>>(2)?,
        row.get::<_, Option<String>>(3)?,
      ))
    })?
    .collect::<Result<Vec<_>, _>>()?;

  rows
    .into_iter()
    .map(|(zone, name, data, last_synced)| {
      row_to_entity(record_type.to_string(), zone, name, data, last_synced)
    })
    .collect()
}

pub(super) fn record_types(conn: &Connection) -> Result<Vec<String>, StoreError> {
  let mut stmt = conn.prepare("SELECT DISTINCT record_type FROM cached_entity ORDER BY record_type")?;
  let types = stmt
    .query_map([], |row| row.get(0))?
    .collect::<Result<Vec<String>, _>>()?;
  Ok(types)
}

pub(super) fn counts(conn: &Connection) -> Result<Vec<(String, u64)>, StoreError> {
  let mut stmt = conn.prepare(
    "SELECT record_type, COUNT(*) FROM cached_entity
     GROUP BY record_type
     ORDER BY record_type",
  )?;
  let counts = stmt
    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
    .collect::<Result<Vec<_>, _>>()?;
  Ok(
    counts
      .into_iter()
      .map(|(ty, n)| (ty, u64::try_from(n).unwrap_or_default()))
      .collect(),
  )
}

pub(super) fn record_query(conn: &Connection, state: &QueryState) -> Result<(), StoreError> {
  conn.execute(
    "INSERT OR REPLACE INTO query_state (fingerprint, description, record_type, refreshed_at, row_count)
     VALUES (?, ?, ?, ?, ?)",
    params![
      state.fingerprint,
      state.description,
      state.record_type,
      state.refreshed_at.to_rfc3339(),
      state.row_count as i64
    ],
  )?;
  Ok(())
}

pub(super) fn queries(conn: &Connection) -> Result<Vec<QueryState>, StoreError> {
  let mut stmt = conn.prepare(
    "SELECT fingerprint, description, record_type, refreshed_at, row_count
     FROM query_state
     ORDER BY refreshed_at DESC",
  )?;
  let rows = stmt
    .query_map([], |row| {
      Ok((
        row.get::<_, String>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, String>(2)?,
        row.get::<_, String>(3)?,
        row.get::<_, i64>(4)?,
      ))
    })?
    .collect::<Result<Vec<_>, _>>()?;

  rows
    .into_iter()
    .map(|(fingerprint, description, record_type, refreshed_at, row_count)| {
      Ok(QueryState {
        fingerprint,
        description,
        record_type,
        refreshed_at: parse_datetime(&refreshed_at)?,
        row_count: usize::try_from(row_count).unwrap_or_default(),
      })
    })
    .collect()
}

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StoreError::InvalidRow(format!("bad timestamp '{}': {}", s, e)))
}

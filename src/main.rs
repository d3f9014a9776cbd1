use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::TryStreamExt;
use std::path::PathBuf;

use zonesync::config::Config;
use zonesync::logging;
use zonesync::record::{CachedEntity, Query, RecordId};
use zonesync::remote::{self, HttpBackend};
use zonesync::store::{CacheStore, QueryState};

#[derive(Parser, Debug)]
#[command(name = "zonesync")]
#[command(about = "Inspect and maintain a zonesync record cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/zonesync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache database to use instead of the configured one
  #[arg(long)]
  cache: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Cached record counts and recent query refreshes
  Stats,
  /// List cached records of a type
  List {
    record_type: String,
    #[arg(long)]
    zone: Option<String>,
  },
  /// Print one cached record's fields as JSON
  Show {
    record_type: String,
    name: String,
    #[arg(long)]
    zone: Option<String>,
  },
  /// Remove one record from the cache
  Evict {
    record_type: String,
    name: String,
    #[arg(long)]
    zone: Option<String>,
  },
  /// Remove every cached record, or only those of one type
  Clear { record_type: Option<String> },
  /// Page every record of a type from the server into the cache
  Pull {
    record_type: String,
    #[arg(long)]
    zone: Option<String>,
    /// Records per page (default: cache.page_size)
    #[arg(long)]
    limit: Option<usize>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let path = args.cache.unwrap_or_else(|| config.cache.path());
  let store = CacheStore::open(&path)?;

  match args.command {
    Command::Stats => stats(&store).await,
    Command::List { record_type, zone } => list(&store, &record_type, zone.as_deref()).await,
    Command::Show {
      record_type,
      name,
      zone,
    } => {
      let id = RecordId::with_zone(name, zone);
      let entity = store
        .lookup(&record_type, &id)
        .await?
        .ok_or_else(|| eyre!("{} {} is not cached", record_type, id))?;
      println!("{}", serde_json::to_string_pretty(&entity)?);
      Ok(())
    }
    Command::Evict {
      record_type,
      name,
      zone,
    } => {
      let id = RecordId::with_zone(name, zone);
      store.delete(&record_type, &id).await?;
      println!("Evicted {} {}", record_type, id);
      Ok(())
    }
    Command::Clear { record_type } => {
      let removed = store.clear(record_type).await?;
      println!("Removed {} cached records", removed);
      Ok(())
    }
    Command::Pull {
      record_type,
      zone,
      limit,
    } => pull(&config, &store, &record_type, zone, limit).await,
  }
}

async fn stats(store: &CacheStore) -> Result<()> {
  let counts = store.counts().await?;
  if counts.is_empty() {
    println!("Cache is empty");
  }
  for (record_type, count) in counts {
    println!("{:<24} {}", record_type, count);
  }

  let queries = store.queries().await?;
  if !queries.is_empty() {
    println!();
    for query in queries {
      println!(
        "{}  {} rows  {}",
        query.refreshed_at.format("%Y-%m-%d %H:%M:%S"),
        query.row_count,
        query.description
      );
    }
  }
  Ok(())
}

async fn list(store: &CacheStore, record_type: &str, zone: Option<&str>) -> Result<()> {
  let entities = store.fetch_type(record_type).await?;
  for entity in entities
    .iter()
    .filter(|e| zone.is_none() || e.id.zone() == zone)
  {
    let synced = entity
      .last_synced
      .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
      .unwrap_or_else(|| "never".to_string());
    println!("{:<40} {}  {} fields", entity.id.to_string(), synced, entity.fields.len());
  }
  Ok(())
}

async fn pull(
  config: &Config,
  store: &CacheStore,
  record_type: &str,
  zone: Option<String>,
  limit: Option<usize>,
) -> Result<()> {
  let remote_config = config.remote()?;
  let backend = HttpBackend::new(remote_config, Config::get_api_token()?)?;

  let mut query = Query::new(record_type);
  if let Some(zone) = zone.or_else(|| remote_config.default_zone.clone()) {
    query = query.in_zone(zone);
  }

  let limit = limit.unwrap_or(config.cache.page_size);
  let mut pages = std::pin::pin!(remote::query_pages(&backend, query.clone(), limit));
  let mut total = 0;
  while let Some(page) = pages.try_next().await? {
    let entities: Vec<CachedEntity> = page.records.into_iter().map(CachedEntity::from_remote).collect();
    total += entities.len();
    store.upsert_all(entities).await?;
  }

  store
    .record_query(QueryState {
      fingerprint: query.fingerprint(),
      description: query.description(),
      record_type: record_type.to_string(),
      refreshed_at: Utc::now(),
      row_count: total,
    })
    .await?;
  println!("Pulled {} {} records", total, record_type);
  Ok(())
}

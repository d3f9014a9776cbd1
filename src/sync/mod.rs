//! Record synchronizer: typed fetch, create, edit and delete against the
//! remote backend, mirrored into the local cache.
//!
//! Every operation on one record identifier holds that record's lock for its
//! whole duration, so a fetch racing a delete can never resurrect the cached
//! entry. Remote calls across all records are bounded by a semaphore.

mod locks;
mod result;

pub use result::{CacheResult, CacheSource};

use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, instrument, warn};

use self::locks::RecordLocks;
use crate::config::CacheConfig;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::record::{CachedEntity, Fields, RecordId, RemoteRecord, SavePolicy, SyncRecord};
use crate::remote::{self, ModifyRequest, RemoteBackend};
use crate::store::CacheStore;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// Outcome of merging an edit into the cache.
enum Reconciled {
  Merged,
  NotCached,
  Evicted(crate::error::DecodeError),
}

pub struct RecordSynchronizer<B: RemoteBackend> {
  remote: Arc<B>,
  store: CacheStore,
  locks: Arc<RecordLocks>,
  permits: Arc<Semaphore>,
  /// How long a cached value is served by [`get`](Self::get) without a refetch
  stale_time: Duration,
}

impl<B: RemoteBackend> RecordSynchronizer<B> {
  pub fn new(remote: Arc<B>, store: CacheStore) -> Self {
    Self {
      remote,
      store,
      locks: Arc::default(),
      permits: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT)),
      stale_time: Duration::minutes(5),
    }
  }

  /// Synchronizer with the concurrency bound and stale time from `config`.
  pub fn from_config(remote: Arc<B>, store: CacheStore, config: &CacheConfig) -> Self {
    Self::new(remote, store)
      .with_max_in_flight(config.max_in_flight)
      .with_stale_time(config.stale_after())
  }

  /// Bound the number of concurrent remote calls.
  pub fn with_max_in_flight(mut self, max: usize) -> Self {
    self.permits = Arc::new(Semaphore::new(max.max(1)));
    self
  }

  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  pub fn remote(&self) -> &Arc<B> {
    &self.remote
  }

  async fn permit(&self) -> SyncResult<SemaphorePermit<'_>> {
    self
      .permits
      .acquire()
      .await
      .map_err(|_| SyncError::Remote(RemoteError::Transport("synchronizer shut down".to_string())))
  }

  /// Map a remote failure, evicting the local copy when the record is gone.
  async fn remote_failure(&self, record_type: &str, id: &RecordId, err: RemoteError) -> SyncError {
    if err.is_not_found() {
      warn!(%id, record_type, "record missing remotely, evicting cached copy");
      if let Err(store_err) = self.store.delete(record_type, id).await {
        return store_err.into();
      }
    } else {
      warn!(%id, record_type, error = %err, "remote operation failed");
    }
    err.into()
  }

  /// Fetch one record, cache its decoded form and return it.
  #[instrument(skip_all, fields(record_type = T::record_type(), %id))]
  pub async fn fetch<T: SyncRecord>(&self, id: &RecordId) -> SyncResult<T> {
    let _guard = self.locks.lock(T::record_type(), id).await;
    self.fetch_locked(id).await
  }

  async fn fetch_locked<T: SyncRecord>(&self, id: &RecordId) -> SyncResult<T> {
    let fetched = {
      let _permit = self.permit().await?;
      remote::fetch_record(&*self.remote, id, None).await
    };
    let record = match fetched {
      Ok(record) => record,
      Err(err) => return Err(self.remote_failure(T::record_type(), id, err).await),
    };

    let value = T::from_record(&record.id, &record.fields).map_err(|err| {
      warn!(error = %err, "fetched record failed to decode, not caching");
      SyncError::Decode(err)
    })?;
    self.store.upsert(CachedEntity::from_remote(record)).await?;
    debug!("fetched and cached");
    Ok(value)
  }

  /// Create a record remotely and cache it.
  ///
  /// Without a `name` the server assigns one. The returned value is decoded
  /// from the submitted fields plus the identifier the server reports, since
  /// the save response need not echo field values.
  #[instrument(skip_all, fields(record_type = T::record_type()))]
  pub async fn create<T: SyncRecord>(
    &self,
    zone: Option<&str>,
    name: Option<&str>,
    fields: Fields,
  ) -> SyncResult<T> {
    let requested = RecordId::with_zone(name.unwrap_or_default(), zone.map(String::from));
    let _guard = match name {
      Some(_) => Some(self.locks.lock(T::record_type(), &requested).await),
      None => None,
    };

    let request = ModifyRequest {
      save: vec![RemoteRecord::new(T::record_type(), requested.clone(), fields.clone())],
      policy: SavePolicy::IfUnchanged,
      ..Default::default()
    };
    let saved = {
      let _permit = self.permit().await?;
      self.remote.modify_records(request).await
    };
    let saved = match saved {
      Ok(result) => result.saved.into_iter().next().ok_or_else(|| {
        SyncError::Remote(RemoteError::Malformed("save returned no record".to_string()))
      })?,
      Err(err) if name.is_some() => {
        return Err(self.remote_failure(T::record_type(), &requested, err).await)
      }
      Err(err) => return Err(err.into()),
    };

    // The remote record now exists; a decode failure leaves it uncached.
    let value = T::from_record(&saved.id, &fields).map_err(|err| {
      warn!(id = %saved.id, error = %err, "created record failed to decode, not caching");
      SyncError::Decode(err)
    })?;
    let created = RemoteRecord::new(T::record_type(), saved.id.clone(), fields);
    self.store.upsert(CachedEntity::from_remote(created)).await?;
    info!(id = %saved.id, "created");
    Ok(value)
  }

  /// Apply field `changes` to a record.
  ///
  /// Only the changed keys are fetched, so the save carries the current
  /// change tag and nothing else. If the record is cached the changes are
  /// merged into the cached form; an uncached record stays uncached.
  #[instrument(skip_all, fields(record_type = T::record_type(), %id, changed = changes.len()))]
  pub async fn edit<T: SyncRecord>(
    &self,
    id: &RecordId,
    changes: Fields,
    policy: SavePolicy,
  ) -> SyncResult<()> {
    let record_type = T::record_type();
    let _guard = self.locks.lock(record_type, id).await;

    let keys: Vec<String> = changes.keys().cloned().collect();
    let fetched = {
      let _permit = self.permit().await?;
      remote::fetch_record(&*self.remote, id, Some(&keys)).await
    };
    let mut record = match fetched {
      Ok(record) => record,
      Err(err) => return Err(self.remote_failure(record_type, id, err).await),
    };

    record.fields.extend(changes.clone());
    let saved = {
      let _permit = self.permit().await?;
      self
        .remote
        .modify_records(ModifyRequest {
          save: vec![record],
          policy,
          ..Default::default()
        })
        .await
    };
    if let Err(err) = saved {
      return Err(self.remote_failure(record_type, id, err).await);
    }

    let target = id.clone();
    let reconciled = self
      .store
      .perform(move |txn| {
        let Some(mut cached) = txn.lookup(record_type, &target)? else {
          return Ok(Reconciled::NotCached);
        };
        cached.fields.extend(changes);
        // Decoding only validates; fields the type does not model are kept
        match cached.decode::<T>() {
          Ok(_) => {
            cached.last_synced = Some(Utc::now());
            txn.upsert(&cached)?;
            Ok(Reconciled::Merged)
          }
          Err(err) => {
            txn.delete(record_type, &target)?;
            Ok(Reconciled::Evicted(err))
          }
        }
      })
      .await?;

    match reconciled {
      Reconciled::Merged => {
        info!("edited and merged into cache");
        Ok(())
      }
      Reconciled::NotCached => {
        debug!("edited, record not cached");
        Ok(())
      }
      Reconciled::Evicted(err) => {
        warn!(error = %err, "edited record no longer decodes, evicted");
        Err(SyncError::Decode(err))
      }
    }
  }

  /// Delete a record remotely and evict it locally.
  ///
  /// A record already missing remotely is still evicted, and the caller
  /// gets [`SyncError::NotFound`].
  #[instrument(skip_all, fields(record_type = T::record_type(), %id))]
  pub async fn delete<T: SyncRecord>(&self, id: &RecordId) -> SyncResult<()> {
    let record_type = T::record_type();
    let _guard = self.locks.lock(record_type, id).await;

    let deleted = {
      let _permit = self.permit().await?;
      self
        .remote
        .modify_records(ModifyRequest {
          delete: vec![id.clone()],
          ..Default::default()
        })
        .await
    };
    if let Err(err) = deleted {
      return Err(self.remote_failure(record_type, id, err).await);
    }

    self.store.delete(record_type, id).await?;
    info!("deleted");
    Ok(())
  }

  /// Cached value only, without touching the remote.
  pub async fn cached<T: SyncRecord>(&self, id: &RecordId) -> SyncResult<Option<T>> {
    match self.store.lookup(T::record_type(), id).await? {
      Some(entity) => Ok(Some(entity.decode()?)),
      None => Ok(None),
    }
  }

  /// Cache-first read.
  ///
  /// 1. A cached value synced within the stale window is returned as is
  /// 2. Otherwise the record is fetched (and cached)
  /// 3. If that fetch fails for a reason other than the record being gone,
  ///    the stale cached value is served in offline mode
  #[instrument(skip_all, fields(record_type = T::record_type(), %id))]
  pub async fn get<T: SyncRecord>(&self, id: &RecordId) -> SyncResult<CacheResult<T>> {
    let _guard = self.locks.lock(T::record_type(), id).await;

    let cached = self
      .store
      .lookup(T::record_type(), id)
      .await?
      .and_then(|entity| match entity.decode::<T>() {
        Ok(value) => Some((value, entity.last_synced)),
        Err(err) => {
          debug!(error = %err, "cached entry does not decode, refetching");
          None
        }
      });

    if let Some((value, Some(synced))) = &cached {
      if Utc::now() - *synced <= self.stale_time {
        return Ok(CacheResult::from_cache(value.clone(), *synced));
      }
    }

    match self.fetch_locked::<T>(id).await {
      Ok(value) => Ok(CacheResult::from_network(value)),
      Err(SyncError::Remote(err)) => match cached {
        Some((value, synced)) => {
          warn!(error = %err, "remote unavailable, serving stale cache");
          Ok(CacheResult::offline(value, synced.unwrap_or_else(Utc::now)))
        }
        None => Err(SyncError::Remote(err)),
      },
      Err(err) => Err(err),
    }
  }
}

impl<B: RemoteBackend> Clone for RecordSynchronizer<B> {
  fn clone(&self) -> Self {
    Self {
      remote: Arc::clone(&self.remote),
      store: self.store.clone(),
      locks: Arc::clone(&self.locks),
      permits: Arc::clone(&self.permits),
      stale_time: self.stale_time,
    }
  }
}

//! Local persistent mirror of remote records.
//!
//! All reads and writes run on one dedicated writer thread that owns the
//! SQLite connection, so every read-modify-write sequence submitted through
//! [`CacheStore::perform`] is atomic with respect to other cache writers.
//! Each committed transaction that changed something produces exactly one
//! [`Commit`] notification, delivered in commit order to every subscriber.

mod sqlite;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::record::{CachedEntity, RecordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  Inserted,
  Updated,
  Deleted,
}

/// One entity-level change inside a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
  pub kind: ChangeKind,
  pub record_type: String,
  pub id: RecordId,
  /// State before the commit, if the entity existed.
  pub previous: Option<CachedEntity>,
  /// State after the commit, absent for deletions.
  pub current: Option<CachedEntity>,
}

/// Notification for one committed write transaction.
#[derive(Debug, Clone)]
pub struct Commit {
  /// Monotonic per store, starting at 1.
  pub sequence: u64,
  pub changes: Vec<StoreChange>,
}

/// Bookkeeping for a query's last successful refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
  pub fingerprint: String,
  pub description: String,
  pub record_type: String,
  pub refreshed_at: DateTime<Utc>,
  pub row_count: usize,
}

/// A write transaction on the writer thread.
///
/// Mutations are recorded and published as a single [`Commit`] once the
/// transaction commits.
pub struct WriteTxn<'a> {
  conn: &'a Connection,
  changes: Vec<StoreChange>,
}

impl WriteTxn<'_> {
  pub fn lookup(&self, record_type: &str, id: &RecordId) -> Result<Option<CachedEntity>, StoreError> {
    sqlite::lookup(self.conn, record_type, id)
  }

  pub fn fetch_type(&self, record_type: &str) -> Result<Vec<CachedEntity>, StoreError> {
    sqlite::fetch_type(self.conn, record_type)
  }

  pub fn upsert(&mut self, entity: &CachedEntity) -> Result<(), StoreError> {
    let change = sqlite::upsert(self.conn, entity)?;
    self.changes.push(change);
    Ok(())
  }

  /// Remove an entity; deleting an absent identifier is a no-op.
  pub fn delete(&mut self, record_type: &str, id: &RecordId) -> Result<(), StoreError> {
    if let Some(change) = sqlite::delete(self.conn, record_type, id)? {
      self.changes.push(change);
    }
    Ok(())
  }
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<Arc<Commit>>>>>;

/// State owned by the writer thread.
struct Writer {
  conn: Connection,
  sequence: u64,
  subscribers: Subscribers,
}

impl Writer {
  /// Run `f` in a transaction. Returns its value and the sequence of the
  /// commit it published, if it changed anything.
  fn run<R>(
    &mut self,
    f: impl FnOnce(&mut WriteTxn<'_>) -> Result<R, StoreError>,
  ) -> Result<(R, Option<u64>), StoreError> {
    let tx = self.conn.transaction()?;
    let mut txn = WriteTxn {
      conn: &tx,
      changes: Vec::new(),
    };
    let value = f(&mut txn)?;
    let changes = txn.changes;
    tx.commit()?;

    if changes.is_empty() {
      return Ok((value, None));
    }
    self.sequence += 1;
    self.publish(Commit {
      sequence: self.sequence,
      changes,
    });
    Ok((value, Some(self.sequence)))
  }

  fn publish(&self, commit: Commit) {
    trace!(sequence = commit.sequence, changes = commit.changes.len(), "commit");
    let commit = Arc::new(commit);
    let mut subscribers = self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    subscribers.retain(|tx| tx.send(Arc::clone(&commit)).is_ok());
  }
}

type Job = Box<dyn FnOnce(&mut Writer) + Send>;

/// Handle to the cache store. Cheap to clone; the writer thread stops when
/// the last handle is dropped.
#[derive(Clone)]
pub struct CacheStore {
  jobs: std_mpsc::Sender<Job>,
  subscribers: Subscribers,
}

impl CacheStore {
  /// Open the cache database at `path`, creating it if needed.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    debug!(path = %path.display(), "opening cache store");
    Self::start(sqlite::open(path)?)
  }

  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::start(sqlite::open_in_memory()?)
  }

  fn start(conn: Connection) -> Result<Self, StoreError> {
    let (jobs, rx) = std_mpsc::channel::<Job>();
    let subscribers: Subscribers = Arc::default();
    let mut writer = Writer {
      conn,
      sequence: 0,
      subscribers: Arc::clone(&subscribers),
    };

    std::thread::Builder::new()
      .name("zonesync-cache-writer".to_string())
      .spawn(move || {
        for job in rx {
          job(&mut writer);
        }
        debug!("cache writer stopped");
      })?;

    Ok(Self { jobs, subscribers })
  }

  async fn submit<R, F>(&self, f: F) -> Result<R, StoreError>
  where
    F: FnOnce(&mut Writer) -> Result<R, StoreError> + Send + 'static,
    R: Send + 'static,
  {
    let (tx, rx) = oneshot::channel();
    let job: Job = Box::new(move |writer| {
      // Caller may have gone away; the write still happened
      let _ = tx.send(f(writer));
    });
    self.jobs.send(job).map_err(|_| StoreError::WriterStopped)?;
    rx.await.map_err(|_| StoreError::WriterStopped)?
  }

  /// Run `f` inside one transaction on the writer thread.
  pub async fn perform<R, F>(&self, f: F) -> Result<R, StoreError>
  where
    F: FnOnce(&mut WriteTxn<'_>) -> Result<R, StoreError> + Send + 'static,
    R: Send + 'static,
  {
    let (value, _) = self.submit(move |writer| writer.run(f)).await?;
    Ok(value)
  }

  /// Subscribe to commit notifications from now on.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Arc<Commit>> {
    let (tx, rx) = mpsc::unbounded_channel();
    self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(tx);
    rx
  }

  pub async fn upsert(&self, entity: CachedEntity) -> Result<(), StoreError> {
    self.perform(move |txn| txn.upsert(&entity)).await
  }

  /// Upsert a batch in one transaction (one commit notification).
  ///
  /// Returns the sequence of that commit, or `None` for an empty batch.
  pub async fn upsert_all(&self, entities: Vec<CachedEntity>) -> Result<Option<u64>, StoreError> {
    if entities.is_empty() {
      return Ok(None);
    }
    let ((), sequence) = self
      .submit(move |writer| {
        writer.run(|txn| {
          for entity in &entities {
            txn.upsert(entity)?;
          }
          Ok(())
        })
      })
      .await?;
    Ok(sequence)
  }

  pub async fn lookup(&self, record_type: &str, id: &RecordId) -> Result<Option<CachedEntity>, StoreError> {
    let record_type = record_type.to_string();
    let id = id.clone();
    self.perform(move |txn| txn.lookup(&record_type, &id)).await
  }

  pub async fn delete(&self, record_type: &str, id: &RecordId) -> Result<(), StoreError> {
    let record_type = record_type.to_string();
    let id = id.clone();
    self.perform(move |txn| txn.delete(&record_type, &id)).await
  }

  pub async fn fetch_type(&self, record_type: &str) -> Result<Vec<CachedEntity>, StoreError> {
    let record_type = record_type.to_string();
    self.perform(move |txn| txn.fetch_type(&record_type)).await
  }

  /// Entities of `record_type` with the sequence of the last commit they
  /// reflect. Commits numbered above it arrived after the read.
  pub async fn snapshot(&self, record_type: &str) -> Result<(Vec<CachedEntity>, u64), StoreError> {
    let record_type = record_type.to_string();
    self
      .submit(move |writer| {
        let entities = sqlite::fetch_type(&writer.conn, &record_type)?;
        Ok((entities, writer.sequence))
      })
      .await
  }

  /// Delete every cached entity, or only those of `record_type`.
  /// Returns the number of entities removed.
  pub async fn clear(&self, record_type: Option<String>) -> Result<usize, StoreError> {
    self
      .perform(move |txn| {
        let types = match record_type {
          Some(ty) => vec![ty],
          None => sqlite::record_types(txn.conn)?,
        };
        let mut removed = 0;
        for ty in &types {
          for entity in txn.fetch_type(ty)? {
            txn.delete(ty, &entity.id)?;
            removed += 1;
          }
        }
        Ok(removed)
      })
      .await
  }

  /// Cached entity count per record type.
  pub async fn counts(&self) -> Result<Vec<(String, u64)>, StoreError> {
    self.perform(|txn| sqlite::counts(txn.conn)).await
  }

  pub async fn record_query(&self, state: QueryState) -> Result<(), StoreError> {
    self
      .perform(move |txn| sqlite::record_query(txn.conn, &state))
      .await
  }

  pub async fn queries(&self) -> Result<Vec<QueryState>, StoreError> {
    self.perform(|txn| sqlite::queries(txn.conn)).await
  }
}

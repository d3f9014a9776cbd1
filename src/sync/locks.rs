use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::record::RecordId;

type LockKey = (String, RecordId);

/// One async mutex per record, created on demand.
///
/// Entries are held weakly and pruned once no operation holds or waits on
/// them.
#[derive(Default)]
pub(crate) struct RecordLocks {
  locks: Mutex<HashMap<LockKey, Weak<AsyncMutex<()>>>>,
}

impl RecordLocks {
  pub fn lock_handle(&self, record_type: &str, id: &RecordId) -> Arc<AsyncMutex<()>> {
    let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
    locks.retain(|_, lock| lock.strong_count() > 0);

    let key = (record_type.to_string(), id.clone());
    if let Some(lock) = locks.get(&key).and_then(Weak::upgrade) {
      return lock;
    }
    let lock = Arc::new(AsyncMutex::new(()));
    locks.insert(key, Arc::downgrade(&lock));
    lock
  }

  /// Wait for exclusive access to one record.
  pub async fn lock(&self, record_type: &str, id: &RecordId) -> OwnedMutexGuard<()> {
    self.lock_handle(record_type, id).lock_owned().await
  }

  #[cfg(test)]
  fn len(&self) -> usize {
    self
      .locks
      .lock()
      .unwrap()
      .values()
      .filter(|lock| lock.strong_count() > 0)
      .count()
  }
}

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

type LockTable = Arc<DashMap<Uuid, Arc<Mutex<()>>>>;

/// Serialises load -> mutate -> save per id within this process.
///
/// An entry lives only while someone holds or waits for it.
#[derive(Default, Clone)]
pub struct RoomLocks {
    locks: LockTable,
}

/// Held lock. Dropping it releases the lock and prunes the idle entry.
pub struct RoomGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockTable,
    id: Uuid,
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        // Release first so the guard's own Arc no longer counts.
        self.guard.take();
        // Waiters cloned the Arc under the shard lock, so a count of 1 means idle.
        self.locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl RoomLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, id: Uuid) -> RoomGuard {
        // Clone the Arc out so the shard lock is not held across the await.
        let mutex = self.locks.entry(id).or_default().value().clone();
        RoomGuard {
            guard: Some(mutex.lock_owned().await),
            locks: self.locks.clone(),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

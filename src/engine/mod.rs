//! The sync engine: push, pull, and conflict resolution over a remote
//! service, driven by a single background worker task.

pub mod remote;
pub mod session;
pub mod worker;

pub use remote::{PullBatch, PushOutcome, RemoteChange, RemoteService, SyncCursor};
pub use session::{SessionOutcome, SyncPhase, SyncReport};
pub use worker::{create_command_channel, EngineCommand, EngineState, SyncEngine};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = Arc<DashMap<(String, String), Arc<Mutex<()>>>>;

/// Per-entity async locks shared between the worker and the facade.
///
/// Everything that reads-then-writes one entity's record or queue takes
/// its lock first, so an optimistic write can never interleave with the
/// engine resolving the same entity.
#[derive(Clone, Default)]
pub struct EntityLocks {
    inner: LockMap,
}

/// Holds one entity's lock until dropped.
pub struct EntityGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
    key: (String, String),
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters clone the cell before locking, so a strong count of one
        // means nobody is using this entry. `remove_if` checks it under the
        // shard lock, where new clones cannot sneak in.
        self.locks
            .remove_if(&self.key, |_, cell| Arc::strong_count(cell) == 1);
    }
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, entity_type: &str, entity_id: &str) -> EntityGuard {
        let key = (entity_type.to_string(), entity_id.to_string());
        let cell = self
            .inner
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = cell.lock_owned().await;
        EntityGuard {
            guard: Some(guard),
            locks: self.inner.clone(),
            key,
        }
    }
}

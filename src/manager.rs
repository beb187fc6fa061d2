//! The `OfflineManager` facade.
//!
//! One handle wires the whole pipeline together: local store, mutation
//! queue, conflict resolver, network monitor and the background sync
//! worker. Writes land locally first and are queued for delivery; reads
//! never touch the network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::conflict::{ConflictResolver, ResolutionStrategy};
use crate::engine::{
    create_command_channel, EngineCommand, EngineState, EntityLocks, RemoteService, SyncEngine,
    SyncPhase, SyncReport,
};
use crate::error::{SyncError, SyncResult};
use crate::event::EngineEvent;
use crate::network::NetworkMonitor;
use crate::queue::{Mutation, MutationQueue};
use crate::storage::{LocalStore, Record, StorageEngine};

/// Point-in-time view of the engine for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub phase: SyncPhase,
    pub online: bool,
    pub pending_mutations: usize,
    pub last_report: Option<SyncReport>,
}

/// Client-facing entry point for offline-first storage and sync.
///
/// Every write is applied to the local store and queued durably in one
/// atomic commit, then pushed in the background; the caller never waits
/// on the network. Cloneless by design: share it behind an `Arc`.
pub struct OfflineManager {
    store: LocalStore,
    queue: MutationQueue,
    resolver: Arc<ConflictResolver>,
    network: NetworkMonitor,
    config: EngineConfig,
    events: broadcast::Sender<EngineEvent>,
    command_tx: mpsc::Sender<EngineCommand>,
    engine_state: Arc<RwLock<EngineState>>,
    locks: EntityLocks,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for OfflineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineManager")
            .field("store", &self.store)
            .field("online", &self.network.is_online())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl OfflineManager {
    /// Open (or create) the local database at `path` and start the sync
    /// worker against `remote`. Must be called inside a Tokio runtime; the
    /// worker and the connectivity debouncer are spawned here.
    pub fn open(
        path: impl AsRef<std::path::Path>,
        config: EngineConfig,
        remote: Arc<dyn RemoteService>,
    ) -> SyncResult<Self> {
        let engine = StorageEngine::open(path.as_ref())?;
        let store = LocalStore::new(engine.clone(), config.event_buffer);
        let queue = MutationQueue::open(engine)?;
        let resolver = Arc::new(ConflictResolver::new());
        let network = NetworkMonitor::new(config.debounce_window, true);
        network.start();

        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (command_tx, command_rx) = create_command_channel();
        let locks = EntityLocks::new();

        let sync_engine = SyncEngine::new(
            store.clone(),
            queue.clone(),
            resolver.clone(),
            network.clone(),
            remote,
            locks.clone(),
            config.clone(),
            events.clone(),
            command_rx,
        );
        let engine_state = sync_engine.state();
        let worker = tokio::spawn(sync_engine.run());

        info!("Offline manager opened at {}", path.as_ref().display());
        Ok(Self {
            store,
            queue,
            resolver,
            network,
            config,
            events,
            command_tx,
            engine_state,
            locks,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
        })
    }

    /// Create or update an entity. The record is visible to `read`
    /// immediately; a mutation is queued for the next push.
    pub async fn write(
        &self,
        entity_type: &str,
        entity_id: &str,
        data: Value,
    ) -> SyncResult<Record> {
        self.ensure_open()?;
        validate_identity(entity_type, entity_id)?;
        if !data.is_object() {
            return Err(SyncError::Validation(
                "payload must be a JSON object".to_string(),
            ));
        }
        let size = serde_json::to_vec(&data)?.len();
        if size > self.config.max_payload_bytes {
            return Err(SyncError::QuotaExceeded(format!(
                "payload is {} bytes (limit {})",
                size, self.config.max_payload_bytes
            )));
        }

        let _guard = self.locks.lock(entity_type, entity_id).await;

        let (record, mutation) = match self.store.get(entity_type, entity_id)? {
            Some(mut record) if record.is_live() => {
                record.apply_local(data.clone());
                let mutation = Mutation::update(entity_type, entity_id, data, record.version);
                (record, mutation)
            }
            Some(mut record) => {
                // Recreating over a tombstone. The server still knows the old
                // version, so the create carries it as its baseline.
                record.apply_local(data.clone());
                let mut mutation = Mutation::create(entity_type, entity_id, data);
                mutation.baseline_version = record.version;
                (record, mutation)
            }
            None => {
                let record = Record::new(entity_type, entity_id, data.clone());
                let mutation = Mutation::create(entity_type, entity_id, data);
                (record, mutation)
            }
        };

        self.store.transaction(|tx| {
            tx.put_record(&record)?;
            self.queue.stage_enqueue(tx, &mutation)?;
            Ok(())
        })?;

        debug!(
            "Queued {:?} for {}/{} (mutation {})",
            mutation.operation, entity_type, entity_id, mutation.id
        );
        let _ = self.events.send(EngineEvent::MutationQueued {
            mutation_id: mutation.id,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            operation: mutation.operation,
        });
        Ok(record)
    }

    /// Read an entity from local storage. Tombstoned entities read as
    /// `None`. Always reflects the caller's own writes.
    pub fn read(&self, entity_type: &str, entity_id: &str) -> SyncResult<Option<Record>> {
        self.ensure_open()?;
        Ok(self
            .store
            .get(entity_type, entity_id)?
            .filter(Record::is_live))
    }

    /// All live entities of one type, in id order.
    pub fn query(&self, entity_type: &str) -> SyncResult<Vec<Record>> {
        self.ensure_open()?;
        Ok(self
            .store
            .query_by_type(entity_type)?
            .into_iter()
            .filter(Record::is_live)
            .collect())
    }

    /// Delete an entity. Locally it becomes a tombstone at once; the
    /// deletion is queued for the next push.
    pub async fn delete(&self, entity_type: &str, entity_id: &str) -> SyncResult<()> {
        self.ensure_open()?;
        validate_identity(entity_type, entity_id)?;

        let _guard = self.locks.lock(entity_type, entity_id).await;

        let mut record = self
            .store
            .get(entity_type, entity_id)?
            .filter(Record::is_live)
            .ok_or_else(|| {
                SyncError::Validation(format!(
                    "cannot delete unknown entity {}/{}",
                    entity_type, entity_id
                ))
            })?;
        record.mark_tombstoned();
        let mutation = Mutation::delete(entity_type, entity_id, record.version);

        self.store.transaction(|tx| {
            tx.put_record(&record)?;
            self.queue.stage_enqueue(tx, &mutation)?;
            Ok(())
        })?;

        debug!(
            "Queued delete for {}/{} (mutation {})",
            entity_type, entity_id, mutation.id
        );
        let _ = self.events.send(EngineEvent::MutationQueued {
            mutation_id: mutation.id,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            operation: mutation.operation,
        });
        Ok(())
    }

    /// Request a sync session now. Returns immediately; progress is
    /// reported through [`OfflineManager::subscribe`]. Requests made while
    /// a session runs coalesce into one follow-up session.
    pub fn sync(&self) -> SyncResult<()> {
        self.ensure_open()?;
        match self.command_tx.try_send(EngineCommand::SyncNow) {
            Ok(()) => Ok(()),
            // A full channel already guarantees a pending session.
            Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SyncError::Closed),
        }
    }

    pub fn status(&self) -> SyncResult<EngineStatus> {
        self.ensure_open()?;
        let state = self.engine_state.read().clone();
        Ok(EngineStatus {
            phase: state.phase,
            online: self.network.is_online(),
            pending_mutations: self.queue.pending_count()?,
            last_report: state.last_report,
        })
    }

    /// Set the conflict strategy for an entity type. Types without a
    /// registration use latest-wins.
    pub fn register_strategy(&self, entity_type: impl Into<String>, strategy: ResolutionStrategy) {
        self.resolver.register(entity_type, strategy);
    }

    /// Engine event feed. Slow subscribers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Connectivity handle; the platform reports raw state through it.
    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Stop the sync worker and refuse further operations. Queued
    /// mutations stay durable and push on the next open. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.command_tx.send(EngineCommand::Shutdown).await;
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Sync worker ended abnormally: {}", e);
            }
        }
        info!("Offline manager shut down");
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        Ok(())
    }
}

/// Entity identifiers end up inside storage keys, so they must be
/// non-empty and free of control bytes (the key separator is one).
fn validate_identity(entity_type: &str, entity_id: &str) -> SyncResult<()> {
    for (label, value) in [("entity type", entity_type), ("entity id", entity_id)] {
        if value.is_empty() {
            return Err(SyncError::Validation(format!("{} must not be empty", label)));
        }
        if value.bytes().any(|b| b < 0x20) {
            return Err(SyncError::Validation(format!(
                "{} contains control characters",
                label
            )));
        }
    }
    Ok(())
}

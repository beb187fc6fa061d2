//! Common test utilities for sync tests
//!
//! Provides:
//! - `MockRemote`: an in-memory server with versioned entities, a change
//!   feed, mutation-id deduplication, and scriptable push failures
//! - Helpers for opening managers against it and driving sync sessions

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::broadcast;
use uuid::Uuid;

use offsync::engine::{PullBatch, PushOutcome, RemoteChange, RemoteService, SyncCursor};
use offsync::{
    EngineConfig, EngineEvent, Mutation, MutationOperation, OfflineManager, RetryPolicy,
    SyncError, SyncReport, SyncResult,
};

/// Scripted behavior for the next push of an entity type.
#[derive(Debug, Clone)]
pub enum PushScript {
    /// Fail before applying anything.
    RejectTransient(String),
    /// Permanently reject before applying anything.
    RejectValidation(String),
    /// Apply the mutation, then fail as if the ack was lost on the wire.
    AcceptThenError,
}

#[derive(Debug, Clone)]
struct ServerEntity {
    data: Value,
    version: u64,
    updated_at: DateTime<Utc>,
    deleted: bool,
}

#[derive(Default)]
struct ServerState {
    entities: HashMap<(String, String), ServerEntity>,
    /// Mutation id -> version assigned when it was first applied.
    seen: HashMap<Uuid, u64>,
    feed: Vec<RemoteChange>,
    scripts: HashMap<String, VecDeque<PushScript>>,
    /// One scripted outcome per upcoming pull; `None` lets the pull through.
    pull_plan: VecDeque<Option<String>>,
    push_log: Vec<(String, String)>,
}

/// In-memory stand-in for a sync backend: per-entity versions, baseline
/// conflict detection, an append-only change feed with index cursors, and
/// at-least-once dedupe by mutation id.
pub struct MockRemote {
    state: Mutex<ServerState>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState::default()),
        })
    }

    /// Install server-side state and a matching feed entry, as if another
    /// client had written it.
    pub fn seed(&self, entity_type: &str, id: &str, data: Value, version: u64) {
        self.seed_at(entity_type, id, data, version, Utc::now());
    }

    pub fn seed_at(
        &self,
        entity_type: &str,
        id: &str,
        data: Value,
        version: u64,
        updated_at: DateTime<Utc>,
    ) {
        let mut state = self.state.lock();
        state.entities.insert(
            (entity_type.to_string(), id.to_string()),
            ServerEntity {
                data: data.clone(),
                version,
                updated_at,
                deleted: false,
            },
        );
        state.feed.push(RemoteChange {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
            data,
            version,
            updated_at,
            deleted: false,
        });
    }

    /// Record a server-side deletion, as if another client had deleted it.
    pub fn seed_deleted(&self, entity_type: &str, id: &str, version: u64) {
        let mut state = self.state.lock();
        let updated_at = Utc::now();
        state.entities.insert(
            (entity_type.to_string(), id.to_string()),
            ServerEntity {
                data: Value::Null,
                version,
                updated_at,
                deleted: true,
            },
        );
        state.feed.push(RemoteChange {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
            data: Value::Null,
            version,
            updated_at,
            deleted: true,
        });
    }

    /// Queue a scripted outcome for the next push of `entity_type`.
    pub fn script_push(&self, entity_type: &str, script: PushScript) {
        self.state
            .lock()
            .scripts
            .entry(entity_type.to_string())
            .or_default()
            .push_back(script);
    }

    /// Make the next pull request fail with a transient error.
    pub fn script_pull_failure(&self, message: &str) {
        self.state
            .lock()
            .pull_plan
            .push_back(Some(message.to_string()));
    }

    /// Let the next pull through, so a scripted failure lands on a later
    /// page.
    pub fn script_pull_delivery(&self) {
        self.state.lock().pull_plan.push_back(None);
    }

    pub fn version_of(&self, entity_type: &str, id: &str) -> Option<u64> {
        self.state
            .lock()
            .entities
            .get(&(entity_type.to_string(), id.to_string()))
            .map(|e| e.version)
    }

    pub fn data_of(&self, entity_type: &str, id: &str) -> Option<Value> {
        self.state
            .lock()
            .entities
            .get(&(entity_type.to_string(), id.to_string()))
            .filter(|e| !e.deleted)
            .map(|e| e.data.clone())
    }

    pub fn is_deleted(&self, entity_type: &str, id: &str) -> bool {
        self.state
            .lock()
            .entities
            .get(&(entity_type.to_string(), id.to_string()))
            .map(|e| e.deleted)
            .unwrap_or(false)
    }

    /// Every push arrival as `(entity_type, entity_id)`, in order.
    pub fn push_log(&self) -> Vec<(String, String)> {
        self.state.lock().push_log.clone()
    }

    pub fn feed_len(&self) -> usize {
        self.state.lock().feed.len()
    }
}

#[async_trait]
impl RemoteService for MockRemote {
    async fn push(&self, mutation: &Mutation) -> SyncResult<PushOutcome> {
        let mut state = self.state.lock();
        state
            .push_log
            .push((mutation.entity_type.clone(), mutation.entity_id.clone()));

        let mut ack_lost = false;
        if let Some(scripts) = state.scripts.get_mut(&mutation.entity_type) {
            match scripts.pop_front() {
                Some(PushScript::RejectTransient(msg)) => return Err(SyncError::Transient(msg)),
                Some(PushScript::RejectValidation(msg)) => return Err(SyncError::Validation(msg)),
                Some(PushScript::AcceptThenError) => ack_lost = true,
                None => {}
            }
        }

        // At-least-once delivery: a replayed mutation acks with the version
        // it was assigned the first time, without reapplying.
        if let Some(&version) = state.seen.get(&mutation.id) {
            return Ok(PushOutcome::Accepted {
                server_version: version,
            });
        }

        let key = (mutation.entity_type.clone(), mutation.entity_id.clone());
        let current_version = state.entities.get(&key).map(|e| e.version).unwrap_or(0);
        if mutation.baseline_version != current_version {
            let remote = match state.entities.get(&key) {
                Some(e) => RemoteChange {
                    entity_type: key.0.clone(),
                    id: key.1.clone(),
                    data: e.data.clone(),
                    version: e.version,
                    updated_at: e.updated_at,
                    deleted: e.deleted,
                },
                None => {
                    return Err(SyncError::Validation(format!(
                        "unknown entity {}/{}",
                        key.0, key.1
                    )))
                }
            };
            return Ok(PushOutcome::Conflict { remote });
        }

        let version = current_version + 1;
        let updated_at = Utc::now();
        let deleted = mutation.operation == MutationOperation::Delete;
        let data = if deleted {
            Value::Null
        } else {
            mutation.payload.clone()
        };
        state.entities.insert(
            key.clone(),
            ServerEntity {
                data: data.clone(),
                version,
                updated_at,
                deleted,
            },
        );
        state.feed.push(RemoteChange {
            entity_type: key.0,
            id: key.1,
            data,
            version,
            updated_at,
            deleted,
        });
        state.seen.insert(mutation.id, version);

        if ack_lost {
            return Err(SyncError::Transient("ack lost".to_string()));
        }
        Ok(PushOutcome::Accepted {
            server_version: version,
        })
    }

    async fn pull(&self, cursor: Option<SyncCursor>, limit: usize) -> SyncResult<PullBatch> {
        let mut state = self.state.lock();
        if let Some(Some(message)) = state.pull_plan.pop_front() {
            return Err(SyncError::Transient(message));
        }
        let offset: usize = cursor
            .as_ref()
            .and_then(|c| c.as_str().parse().ok())
            .unwrap_or(0)
            .min(state.feed.len());
        let end = (offset + limit).min(state.feed.len());
        let changes = state.feed[offset..end].to_vec();
        Ok(PullBatch {
            changes,
            next_cursor: SyncCursor::new(end.to_string()),
            has_more: end < state.feed.len(),
        })
    }
}

/// Retry policy with no delays, so failed mutations are due again at once.
pub fn immediate_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::ZERO,
        multiplier: 2,
        max_delay: Duration::ZERO,
        max_retries,
        jitter: false,
    }
}

/// Config for manually driven tests: no timers, no reconnect triggers,
/// short debounce.
pub fn manual_config() -> EngineConfig {
    EngineConfig::default()
        .manual_sync_only()
        .with_debounce_window(Duration::from_millis(25))
        .with_retry(immediate_retry(8))
}

pub fn open_manager(remote: Arc<MockRemote>) -> (OfflineManager, TempDir) {
    open_manager_with(remote, manual_config())
}

pub fn open_manager_with(
    remote: Arc<MockRemote>,
    config: EngineConfig,
) -> (OfflineManager, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let manager =
        OfflineManager::open(dir.path(), config, remote).expect("Failed to open manager");
    (manager, dir)
}

/// Trigger a session and wait for it to complete. Panics if it fails.
pub async fn run_sync(
    manager: &OfflineManager,
    events: &mut broadcast::Receiver<EngineEvent>,
) -> SyncReport {
    manager.sync().expect("sync trigger failed");
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(EngineEvent::SyncCompleted { report })) => return report,
            Ok(Ok(EngineEvent::SyncFailed { error, .. })) => {
                panic!("sync session failed: {}", error)
            }
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => panic!("event channel closed: {}", e),
            Err(_) => panic!("sync session timed out"),
        }
    }
}

/// Like `run_sync`, but also hand back every event seen before completion.
pub async fn run_sync_collecting(
    manager: &OfflineManager,
    events: &mut broadcast::Receiver<EngineEvent>,
) -> (SyncReport, Vec<EngineEvent>) {
    manager.sync().expect("sync trigger failed");
    let mut seen = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(EngineEvent::SyncCompleted { report })) => return (report, seen),
            Ok(Ok(EngineEvent::SyncFailed { error, .. })) => {
                panic!("sync session failed: {}", error)
            }
            Ok(Ok(event)) => seen.push(event),
            Ok(Err(e)) => panic!("event channel closed: {}", e),
            Err(_) => panic!("sync session timed out"),
        }
    }
}

/// Trigger a session and wait for it to fail, returning the error text.
pub async fn run_sync_expect_failure(
    manager: &OfflineManager,
    events: &mut broadcast::Receiver<EngineEvent>,
) -> String {
    manager.sync().expect("sync trigger failed");
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(EngineEvent::SyncFailed { error, .. })) => return error,
            Ok(Ok(EngineEvent::SyncCompleted { .. })) => {
                panic!("session completed but a failure was expected")
            }
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => panic!("event channel closed: {}", e),
            Err(_) => panic!("sync session timed out"),
        }
    }
}

//! Remote service seam.
//!
//! The engine talks to whatever backend the application injects through
//! [`RemoteService`]; nothing here knows about transports or wire formats.
//! Implementations must deduplicate pushes by mutation id (delivery is
//! at-least-once) and assign a monotonically increasing version per entity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncResult;
use crate::queue::Mutation;
use crate::storage::Record;

/// Opaque pull checkpoint issued by the remote. Persisted between sessions;
/// the engine never inspects its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor(String);

impl SyncCursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server's verdict on one pushed mutation.
#[derive(Debug, Clone)]
pub enum PushOutcome {
    /// Applied; the entity now has this version.
    Accepted { server_version: u64 },
    /// The mutation's baseline is stale. The server does not overwrite;
    /// it hands back its current state for resolution.
    Conflict { remote: RemoteChange },
}

/// One entity state from the server's change feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteChange {
    pub entity_type: String,
    pub id: String,
    pub data: Value,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
}

impl RemoteChange {
    /// Materialize as a clean (not dirty) local record.
    pub fn into_record(self) -> Record {
        let mut record = Record::new(self.entity_type, self.id, self.data);
        record.version = self.version;
        record.updated_at = self.updated_at;
        record.dirty = false;
        record.tombstoned = self.deleted;
        record
    }
}

/// One page of the server's change feed.
#[derive(Debug, Clone)]
pub struct PullBatch {
    pub changes: Vec<RemoteChange>,
    pub next_cursor: SyncCursor,
    pub has_more: bool,
}

/// Backend the engine syncs against. Injected at construction; the engine
/// owns retries, backoff and conflict handling on top of it.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Apply one mutation. A version mismatch surfaces as
    /// [`PushOutcome::Conflict`], never as an error.
    async fn push(&self, mutation: &Mutation) -> SyncResult<PushOutcome>;

    /// Fetch changes recorded after `cursor`; `None` starts from the
    /// beginning of the feed.
    async fn pull(&self, cursor: Option<SyncCursor>, limit: usize) -> SyncResult<PullBatch>;
}

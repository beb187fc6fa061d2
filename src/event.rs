//! Events broadcast to facade subscribers.
//!
//! Every observable state change in the pipeline is published here:
//! queue activity, sync session boundaries, and conflict outcomes.
//! Subscribers that fall behind lose the oldest events, never the newest.

use serde::Serialize;
use uuid::Uuid;

use crate::conflict::ResolutionAction;
use crate::engine::SyncReport;
use crate::queue::MutationOperation;

/// What subscribers see. Carries ids and summaries, not record payloads;
/// consumers read current state through the store.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A local write was applied optimistically and queued for push.
    MutationQueued {
        mutation_id: Uuid,
        entity_type: String,
        entity_id: String,
        operation: MutationOperation,
    },
    /// The remote accepted a mutation.
    MutationSynced {
        mutation_id: Uuid,
        entity_type: String,
        entity_id: String,
        server_version: u64,
    },
    /// A mutation was dropped: superseded by a resolution, rejected by the
    /// remote, or out of retries.
    MutationDiscarded {
        mutation_id: Uuid,
        entity_type: String,
        entity_id: String,
        reason: String,
    },
    /// A divergence was settled; the store already holds the outcome.
    ConflictResolved {
        entity_type: String,
        entity_id: String,
        action: ResolutionAction,
        strategy: &'static str,
    },
    SyncStarted {
        session_id: Uuid,
    },
    SyncCompleted {
        report: SyncReport,
    },
    SyncFailed {
        session_id: Uuid,
        error: String,
    },
}

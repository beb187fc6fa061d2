//! Session bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where the engine currently is in its cycle. `Error` means the most
/// recent session failed and the engine is backing off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    #[default]
    Idle,
    Pushing,
    Pulling,
    Resolving,
    Error,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Pushing => "pushing",
            SyncPhase::Pulling => "pulling",
            SyncPhase::Resolving => "resolving",
            SyncPhase::Error => "error",
        };
        f.write_str(name)
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    /// Everything pushed and pulled.
    Clean,
    /// Some entity types stayed deferred for the next cycle; the rest
    /// committed normally.
    Degraded,
    /// The session aborted. Durable state is consistent and resumable.
    Failed,
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionOutcome::Clean => "clean",
            SessionOutcome::Degraded => "degraded",
            SessionOutcome::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Summary of one sync session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Mutations accepted by the remote.
    pub pushed: u64,
    /// Remote changes applied locally, conflicting ones included.
    pub pulled: u64,
    /// Conflicts resolved, push and pull phases combined.
    pub conflicts: u64,
    /// Mutations discarded: superseded, rejected, or out of retries.
    pub discarded: u64,
    /// One entry per deferred entity type or fatal failure.
    pub errors: Vec<String>,
    pub outcome: SessionOutcome,
}

impl SyncReport {
    pub(crate) fn begin() -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            pushed: 0,
            pulled: 0,
            conflicts: 0,
            discarded: 0,
            errors: Vec::new(),
            outcome: SessionOutcome::Clean,
        }
    }

    pub(crate) fn finish(&mut self, outcome: SessionOutcome) {
        self.finished_at = Utc::now();
        self.outcome = outcome;
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

impl std::fmt::Display for SyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Sync session {} {}: {} pushed, {} pulled, {} conflicts, {} discarded in {}ms",
            self.session_id,
            self.outcome,
            self.pushed,
            self.pulled,
            self.conflicts,
            self.discarded,
            self.duration().num_milliseconds()
        )
    }
}

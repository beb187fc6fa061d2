use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MutationOperation {
    Create,
    Update,
    Delete,
}

/// Lifecycle of a queued mutation. `Synced` and `Discarded` are terminal;
/// `Failed` means "failed, scheduled for retry".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Pending,
    InFlight,
    Failed,
    Synced,
    Discarded,
}

impl MutationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MutationStatus::Synced | MutationStatus::Discarded)
    }
}

/// One durable local change awaiting delivery to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutation {
    /// Client-generated id; the server deduplicates deliveries with it.
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: MutationOperation,
    pub payload: Value,
    /// Version of the record this mutation was created against. The server
    /// compares it to its own version to detect concurrent edits.
    pub baseline_version: u64,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub status: MutationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Earliest time the next push attempt may run; the retry schedule
    /// that owns every non-terminal failed mutation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

impl Mutation {
    fn new(
        operation: MutationOperation,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
        baseline_version: u64,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            payload,
            baseline_version,
            created_at: Utc::now(),
            retry_count: 0,
            status: MutationStatus::Pending,
            last_error: None,
            not_before: None,
        }
    }

    pub fn create(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::new(MutationOperation::Create, entity_type, entity_id, payload, 0)
    }

    pub fn update(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
        baseline_version: u64,
    ) -> Self {
        Self::new(
            MutationOperation::Update,
            entity_type,
            entity_id,
            payload,
            baseline_version,
        )
    }

    pub fn delete(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        baseline_version: u64,
    ) -> Self {
        Self::new(
            MutationOperation::Delete,
            entity_type,
            entity_id,
            Value::Null,
            baseline_version,
        )
    }

    /// Whether the retry schedule allows an attempt at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.not_before {
            Some(t) => t <= now,
            None => true,
        }
    }

    /// Eligible for a push attempt: not terminal, not already in flight,
    /// and past its backoff deadline.
    pub fn is_pushable(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            MutationStatus::Pending | MutationStatus::Failed
        ) && self.is_due(now)
    }
}

//! Conflict resolution strategies for offline sync.
//!
//! When the same entity diverges locally and remotely, the registered
//! strategy for its entity type decides which state survives. Every
//! strategy is deterministic: the same pair of records always produces
//! the same outcome, so two clients observing the same conflict converge.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::queue::Mutation;
use crate::storage::Record;

/// Caller-supplied merge function. Must be pure and total: no IO, no
/// panics, defined for every pair of records. A panicking merge is caught
/// and logged, and the case falls back to [`ResolutionStrategy::LatestWins`].
pub type MergeFn = dyn Fn(&Record, &Record) -> Record + Send + Sync;

/// How conflicts for one entity type are settled.
#[derive(Clone)]
pub enum ResolutionStrategy {
    /// Newest `updated_at` wins; exact ties go to the lexicographically
    /// larger record id. The default for unregistered types.
    LatestWins,
    /// Local state survives and is re-pushed against the server version.
    LocalWins,
    /// Remote state overwrites local; pending local mutations for the
    /// entity are discarded as superseded.
    RemoteWins,
    /// Field-level merge via a caller-supplied function.
    Merge(Arc<MergeFn>),
}

impl ResolutionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ResolutionStrategy::LatestWins => "latest_wins",
            ResolutionStrategy::LocalWins => "local_wins",
            ResolutionStrategy::RemoteWins => "remote_wins",
            ResolutionStrategy::Merge(_) => "merge",
        }
    }
}

impl std::fmt::Debug for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A detected divergence between local and remote state of one entity.
#[derive(Debug, Clone)]
pub struct ConflictCase {
    pub local: Record,
    pub remote: Record,
    /// Local mutations still queued for this entity when the conflict was
    /// detected.
    pub pending: Vec<Mutation>,
}

impl ConflictCase {
    pub fn entity_type(&self) -> &str {
        &self.local.entity_type
    }

    pub fn entity_id(&self) -> &str {
        &self.local.id
    }
}

/// What the engine must do with the winning record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionAction {
    /// Keep local data; it stays dirty and is re-pushed against the
    /// server's version.
    KeepLocal,
    /// Adopt the remote record; pending local mutations are superseded.
    TakeRemote,
    /// Store the merged record; it becomes the new dirty local state.
    Merged,
}

/// Outcome of resolving one [`ConflictCase`].
#[derive(Debug, Clone)]
pub struct Resolution {
    pub record: Record,
    pub action: ResolutionAction,
    /// Name of the strategy that produced this outcome.
    pub strategy: &'static str,
}

/// Registry mapping entity types to their resolution strategy.
///
/// Exactly one strategy per type; `register` replaces. Types without a
/// registration resolve with `LatestWins`.
pub struct ConflictResolver {
    strategies: RwLock<HashMap<String, ResolutionStrategy>>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("registered", &self.strategies.read().len())
            .finish()
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            strategies: RwLock::new(HashMap::new()),
        }
    }

    /// Set the strategy for an entity type, replacing any previous one.
    pub fn register(&self, entity_type: impl Into<String>, strategy: ResolutionStrategy) {
        let entity_type = entity_type.into();
        tracing::debug!(
            "Registering '{}' strategy for entity type '{}'",
            strategy.name(),
            entity_type
        );
        self.strategies.write().insert(entity_type, strategy);
    }

    /// The strategy that applies to `entity_type`.
    pub fn strategy_for(&self, entity_type: &str) -> ResolutionStrategy {
        self.strategies
            .read()
            .get(entity_type)
            .cloned()
            .unwrap_or(ResolutionStrategy::LatestWins)
    }

    /// Resolve a conflict with the strategy registered for its entity type.
    pub fn resolve(&self, case: &ConflictCase) -> Resolution {
        let strategy = self.strategy_for(case.entity_type());
        match &strategy {
            ResolutionStrategy::LatestWins => latest_wins(case),
            ResolutionStrategy::LocalWins => keep_local(case, "local_wins"),
            ResolutionStrategy::RemoteWins => take_remote(case, "remote_wins"),
            ResolutionStrategy::Merge(merge_fn) => {
                match catch_unwind(AssertUnwindSafe(|| merge_fn(&case.local, &case.remote))) {
                    Ok(merged) => {
                        let mut record = merged;
                        // The merge function owns the payload; identity and
                        // sync bookkeeping stay with the engine.
                        record.entity_type = case.local.entity_type.clone();
                        record.id = case.local.id.clone();
                        record.version = case.remote.version;
                        record.dirty = true;
                        Resolution {
                            record,
                            action: ResolutionAction::Merged,
                            strategy: "merge",
                        }
                    }
                    Err(_) => {
                        tracing::warn!(
                            "Merge function panicked for {}/{}; falling back to latest_wins",
                            case.entity_type(),
                            case.entity_id()
                        );
                        latest_wins(case)
                    }
                }
            }
        }
    }
}

/// Newest timestamp wins; an exact tie goes to the lexicographically larger
/// record id, and a full tie to the remote (the server is the arbiter).
fn latest_wins(case: &ConflictCase) -> Resolution {
    let local_newer = match case.local.updated_at.cmp(&case.remote.updated_at) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => case.local.id > case.remote.id,
    };
    if local_newer {
        keep_local(case, "latest_wins")
    } else {
        take_remote(case, "latest_wins")
    }
}

fn keep_local(case: &ConflictCase, strategy: &'static str) -> Resolution {
    let mut record = case.local.clone();
    // Rebase onto the server's version so the re-push carries a current
    // baseline instead of the stale one that caused the conflict.
    record.version = case.remote.version;
    record.dirty = true;
    Resolution {
        record,
        action: ResolutionAction::KeepLocal,
        strategy,
    }
}

fn take_remote(case: &ConflictCase, strategy: &'static str) -> Resolution {
    let mut record = case.remote.clone();
    record.dirty = false;
    Resolution {
        record,
        action: ResolutionAction::TakeRemote,
        strategy,
    }
}

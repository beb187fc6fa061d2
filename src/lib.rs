pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod event;
pub mod manager;
pub mod network;
pub mod queue;
pub mod storage;

pub use config::{EngineConfig, RetryPolicy};
pub use conflict::{ConflictCase, ConflictResolver, Resolution, ResolutionAction, ResolutionStrategy};
pub use engine::{
    PullBatch, PushOutcome, RemoteChange, RemoteService, SessionOutcome, SyncCursor, SyncPhase,
    SyncReport,
};
pub use error::{SyncError, SyncResult};
pub use event::EngineEvent;
pub use manager::{EngineStatus, OfflineManager};
pub use network::{NetworkEvent, NetworkMonitor};
pub use queue::{Mutation, MutationOperation, MutationQueue, MutationStatus};
pub use storage::{LocalStore, Record, StorageEngine};

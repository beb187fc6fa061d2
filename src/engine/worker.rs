//! Background sync worker.
//!
//! One task owns the whole session lifecycle: it listens for manual
//! triggers, reconnect events and the periodic timer, and runs sessions
//! one at a time: a push phase, then a pull that settles each page's
//! divergences before checkpointing that page's cursor. Triggers that
//! arrive while a session runs collapse into a single follow-up run.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::conflict::{ConflictCase, ConflictResolver, Resolution, ResolutionAction};
use crate::error::{SyncError, SyncResult};
use crate::event::EngineEvent;
use crate::network::{NetworkEvent, NetworkMonitor};
use crate::queue::{Mutation, MutationQueue};
use crate::storage::{LocalStore, META_CF};

use super::remote::{PushOutcome, RemoteChange, RemoteService, SyncCursor};
use super::session::{SessionOutcome, SyncPhase, SyncReport};
use super::EntityLocks;

const CURSOR_KEY: &[u8] = b"pull_cursor";

/// Control messages for the engine worker.
#[derive(Debug)]
pub enum EngineCommand {
    /// Run a session now, or fold into the one already running.
    SyncNow,
    /// Stop the worker.
    Shutdown,
}

/// Snapshot of worker state shared with the facade.
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    pub phase: SyncPhase,
    pub last_report: Option<SyncReport>,
}

#[derive(PartialEq)]
enum Trigger {
    Manual,
    Automatic,
}

/// Per-type outcome collected during the push phase. Types fail
/// independently; one deferred type never blocks the others.
struct TypePush {
    entity_type: String,
    pushed: u64,
    conflicts: u64,
    discarded: u64,
    deferred: Vec<String>,
    fatal: Option<SyncError>,
}

impl TypePush {
    fn new(entity_type: String) -> Self {
        Self {
            entity_type,
            pushed: 0,
            conflicts: 0,
            discarded: 0,
            deferred: Vec::new(),
            fatal: None,
        }
    }
}

/// The sync state machine. Constructed by the facade, consumed by `run`
/// on a dedicated task.
pub struct SyncEngine {
    store: LocalStore,
    queue: MutationQueue,
    resolver: Arc<ConflictResolver>,
    network: NetworkMonitor,
    remote: Arc<dyn RemoteService>,
    locks: EntityLocks,
    config: EngineConfig,
    events: broadcast::Sender<EngineEvent>,
    state: Arc<RwLock<EngineState>>,
    command_rx: mpsc::Receiver<EngineCommand>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: LocalStore,
        queue: MutationQueue,
        resolver: Arc<ConflictResolver>,
        network: NetworkMonitor,
        remote: Arc<dyn RemoteService>,
        locks: EntityLocks,
        config: EngineConfig,
        events: broadcast::Sender<EngineEvent>,
        command_rx: mpsc::Receiver<EngineCommand>,
    ) -> Self {
        Self {
            store,
            queue,
            resolver,
            network,
            remote,
            locks,
            config,
            events,
            state: Arc::new(RwLock::new(EngineState::default())),
            command_rx,
        }
    }

    /// Shared state handle for status surfaces. Grab before calling `run`.
    pub fn state(&self) -> Arc<RwLock<EngineState>> {
        self.state.clone()
    }

    /// Worker loop. Runs until a `Shutdown` command arrives or every
    /// command sender is dropped.
    pub async fn run(mut self) {
        info!("Sync engine worker started");

        let mut network_rx = self.network.subscribe();
        let mut network_live = true;
        // The first tick fires at once, so enabled auto-sync starts with a
        // catch-up session.
        let mut ticker = tokio::time::interval(self.config.auto_sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut failure_streak: u32 = 0;
        let mut hold_until: Option<tokio::time::Instant> = None;

        'main: loop {
            let trigger = tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(EngineCommand::SyncNow) => Trigger::Manual,
                    Some(EngineCommand::Shutdown) | None => break 'main,
                },
                event = network_rx.recv(), if network_live => match event {
                    Ok(NetworkEvent::Online) if self.config.sync_on_reconnect => {
                        Trigger::Automatic
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        network_live = false;
                        continue;
                    }
                },
                _ = ticker.tick(), if self.config.auto_sync_enabled => Trigger::Automatic,
            };

            if trigger == Trigger::Automatic {
                if let Some(until) = hold_until {
                    if tokio::time::Instant::now() < until {
                        debug!("Skipping automatic sync during failure backoff");
                        continue;
                    }
                }
            }

            loop {
                self.run_session(&mut failure_streak).await;

                // Fold triggers that queued up during the session into one rerun.
                let mut rerun = false;
                loop {
                    match self.command_rx.try_recv() {
                        Ok(EngineCommand::SyncNow) => rerun = true,
                        Ok(EngineCommand::Shutdown) => break 'main,
                        Err(_) => break,
                    }
                }
                if !rerun {
                    break;
                }
            }

            hold_until = if failure_streak > 0 {
                Some(tokio::time::Instant::now() + self.config.retry.delay_for(failure_streak - 1))
            } else {
                None
            };
        }

        info!("Sync engine worker shutting down");
    }

    async fn run_session(&mut self, failure_streak: &mut u32) {
        if !self.network.is_online() {
            debug!("Sync requested while offline; waiting for reconnect");
            return;
        }

        let mut report = SyncReport::begin();
        self.set_phase(SyncPhase::Pushing);
        let _ = self.events.send(EngineEvent::SyncStarted {
            session_id: report.session_id,
        });
        debug!("Sync session {} started", report.session_id);

        match self.run_phases(&mut report).await {
            Ok(()) => {
                let outcome = if report.errors.is_empty() {
                    SessionOutcome::Clean
                } else {
                    SessionOutcome::Degraded
                };
                report.finish(outcome);
                *failure_streak = 0;
                self.set_phase(SyncPhase::Idle);
                info!("{}", report);
                self.publish_report(report.clone());
                let _ = self.events.send(EngineEvent::SyncCompleted { report });
            }
            Err(e) => {
                report.errors.push(e.to_string());
                report.finish(SessionOutcome::Failed);
                *failure_streak += 1;
                // Error phase holds until the next session starts.
                self.set_phase(SyncPhase::Error);
                warn!(
                    "Sync session {} failed ({} consecutive): {}",
                    report.session_id, failure_streak, e
                );
                let session_id = report.session_id;
                self.publish_report(report);
                let _ = self.events.send(EngineEvent::SyncFailed {
                    session_id,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn run_phases(&self, report: &mut SyncReport) -> SyncResult<()> {
        self.push_phase(report).await?;

        self.set_phase(SyncPhase::Pulling);
        self.pull_phase(report).await?;

        match self.store.purge_tombstones(self.config.tombstone_retention) {
            Ok(0) => {}
            Ok(n) => debug!("Session cleanup purged {} tombstones", n),
            Err(e) => warn!("Tombstone purge failed: {}", e),
        }
        Ok(())
    }

    // ---------- Push ----------

    async fn push_phase(&self, report: &mut SyncReport) -> SyncResult<()> {
        let heads = self.queue.due_heads(Utc::now())?;
        if heads.is_empty() {
            return Ok(());
        }

        let mut by_type: HashMap<String, Vec<Mutation>> = HashMap::new();
        for head in heads {
            by_type
                .entry(head.entity_type.clone())
                .or_default()
                .push(head);
        }
        debug!("Pushing mutations across {} entity types", by_type.len());

        let pushes = by_type
            .into_iter()
            .map(|(entity_type, heads)| self.push_type(entity_type, heads));
        for outcome in join_all(pushes).await {
            report.pushed += outcome.pushed;
            report.conflicts += outcome.conflicts;
            report.discarded += outcome.discarded;
            if let Some(fatal) = outcome.fatal {
                return Err(fatal);
            }
            if !outcome.deferred.is_empty() {
                let summary = outcome.deferred.join("; ");
                warn!(
                    "Entity type '{}' deferred to next session: {}",
                    outcome.entity_type, summary
                );
                report.errors.push(format!("{}: {}", outcome.entity_type, summary));
            }
        }
        Ok(())
    }

    async fn push_type(&self, entity_type: String, heads: Vec<Mutation>) -> TypePush {
        let mut out = TypePush::new(entity_type);
        for head in heads {
            match self
                .push_entity(&head.entity_type, &head.entity_id, &mut out)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_fatal_to_session() => {
                    out.fatal = Some(e);
                    break;
                }
                Err(e) => out.deferred.push(format!("{}: {}", head.entity_id, e)),
            }
        }
        out
    }

    /// Drain one entity's queue, strictly in order. Only the head is ever
    /// in flight; the next mutation goes out after the head settles.
    async fn push_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        out: &mut TypePush,
    ) -> SyncResult<()> {
        let mut conflict_retry_spent = false;
        loop {
            let Some(head) = self.queue.peek_next(entity_type, entity_id)? else {
                return Ok(());
            };
            if !head.is_pushable(Utc::now()) {
                return Ok(());
            }

            let mutation = self.queue.mark_in_flight(&head.id)?;
            let result = self
                .with_timeout(self.remote.push(&mutation))
                .await;

            match result {
                Ok(PushOutcome::Accepted { server_version }) => {
                    self.finish_accepted(&mutation, server_version).await?;
                    out.pushed += 1;
                    conflict_retry_spent = false;
                }
                Ok(PushOutcome::Conflict { remote }) => {
                    out.conflicts += 1;
                    let action = self.resolve_push_conflict(&mutation, remote, out).await?;
                    match action {
                        ResolutionAction::TakeRemote => return Ok(()),
                        _ if conflict_retry_spent => {
                            debug!(
                                "Repeated conflict for {}/{} in one session; deferring",
                                entity_type, entity_id
                            );
                            return Ok(());
                        }
                        _ => conflict_retry_spent = true,
                    }
                }
                Err(e @ (SyncError::Validation(_) | SyncError::QuotaExceeded(_))) => {
                    // Permanent rejection: retrying cannot succeed.
                    let discarded = self.queue.discard(&mutation.id, &e.to_string())?;
                    warn!("Remote rejected mutation {}: {}", discarded.id, e);
                    self.emit_discarded(&discarded, &e.to_string());
                    out.discarded += 1;
                }
                Err(e) if !e.is_fatal_to_session() => {
                    let failed = self.queue.fail(&mutation.id, &e.to_string(), &self.config.retry)?;
                    if failed.status.is_terminal() {
                        self.emit_discarded(&failed, &e.to_string());
                        out.discarded += 1;
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Commit a server ack: queue retirement, record version bump, and the
    /// rebase of any remaining pending mutations, all in one batch.
    async fn finish_accepted(&self, mutation: &Mutation, server_version: u64) -> SyncResult<()> {
        let entity_type = &mutation.entity_type;
        let entity_id = &mutation.entity_id;
        let _guard = self.locks.lock(entity_type, entity_id).await;

        let remaining = self
            .queue
            .pending_for(entity_type, entity_id)?
            .into_iter()
            .filter(|m| m.id != mutation.id)
            .count();

        self.store.transaction(|tx| {
            // Rebase before the ack: the batch rewrites every active entry,
            // then deletes the acked head, in that order.
            self.queue
                .stage_rebase_entity(tx, entity_type, entity_id, server_version)?;
            self.queue.stage_ack(tx, &mutation.id)?;
            if let Some(mut record) = self.store.get(entity_type, entity_id)? {
                record.version = server_version;
                if remaining == 0 {
                    record.dirty = false;
                }
                tx.put_record(&record)?;
            }
            Ok(())
        })?;

        debug!(
            "Synced mutation {} for {}/{} at server version {}",
            mutation.id, entity_type, entity_id, server_version
        );
        let _ = self.events.send(EngineEvent::MutationSynced {
            mutation_id: mutation.id,
            entity_type: entity_type.clone(),
            entity_id: entity_id.clone(),
            server_version,
        });
        Ok(())
    }

    async fn resolve_push_conflict(
        &self,
        mutation: &Mutation,
        remote: RemoteChange,
        out: &mut TypePush,
    ) -> SyncResult<ResolutionAction> {
        let entity_type = &mutation.entity_type;
        let entity_id = &mutation.entity_id;
        let _guard = self.locks.lock(entity_type, entity_id).await;

        let remote_record = remote.into_record();
        let Some(local) = self.store.get(entity_type, entity_id)? else {
            // The local record vanished while its mutation was queued.
            // Adopt the remote state and drop the stale queue.
            let mut discarded = Vec::new();
            self.store.transaction(|tx| {
                tx.put_record(&remote_record)?;
                discarded =
                    self.queue
                        .stage_discard_entity(tx, entity_type, entity_id, "superseded")?;
                Ok(())
            })?;
            for m in &discarded {
                self.emit_discarded(m, "superseded");
            }
            out.discarded += discarded.len() as u64;
            return Ok(ResolutionAction::TakeRemote);
        };

        let pending = self.queue.pending_for(entity_type, entity_id)?;
        let case = ConflictCase {
            local,
            remote: remote_record,
            pending,
        };
        let resolution = self.resolver.resolve(&case);
        let discarded = self.apply_resolution(&case, &resolution)?;
        out.discarded += discarded as u64;
        Ok(resolution.action)
    }

    // ---------- Pull ----------

    async fn pull_phase(&self, report: &mut SyncReport) -> SyncResult<()> {
        let mut cursor = self.load_cursor()?;

        loop {
            let batch = self
                .with_timeout(self.remote.pull(cursor.clone(), self.config.pull_batch_size))
                .await?;
            let changes = batch.changes;
            let mut cases = Vec::new();
            for change in changes {
                if let Some(case) = self.apply_remote_change(change, report).await? {
                    cases.push(case);
                }
            }
            if !cases.is_empty() {
                debug!("Pull page found {} diverged entities", cases.len());
                self.set_phase(SyncPhase::Resolving);
                self.resolve_cases(cases, report).await?;
                self.set_phase(SyncPhase::Pulling);
            }
            // The durable cursor only advances once the page is applied and
            // its divergences are settled; a crash replays the whole page.
            self.save_cursor(&batch.next_cursor)?;
            cursor = Some(batch.next_cursor);
            if !batch.has_more {
                break;
            }
        }
        Ok(())
    }

    /// Apply one remote change. Clean local state fast-forwards; dirty
    /// local state becomes a conflict case for the resolving phase.
    async fn apply_remote_change(
        &self,
        change: RemoteChange,
        report: &mut SyncReport,
    ) -> SyncResult<Option<ConflictCase>> {
        let _guard = self.locks.lock(&change.entity_type, &change.id).await;

        let Some(local) = self.store.get(&change.entity_type, &change.id)? else {
            // A deletion of something we never had needs no tombstone.
            if !change.deleted {
                self.store.put(&change.into_record())?;
                report.pulled += 1;
            }
            return Ok(None);
        };

        if change.version <= local.version {
            return Ok(None);
        }

        if local.dirty || self.queue.has_pending(&change.entity_type, &change.id)? {
            report.pulled += 1;
            let pending = self.queue.pending_for(&change.entity_type, &change.id)?;
            return Ok(Some(ConflictCase {
                local,
                remote: change.into_record(),
                pending,
            }));
        }

        self.store.put(&change.into_record())?;
        report.pulled += 1;
        Ok(None)
    }

    // ---------- Resolve ----------

    /// Settle diverged entities found while applying one pull page.
    async fn resolve_cases(
        &self,
        cases: Vec<ConflictCase>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        for stale in cases {
            let entity_type = stale.entity_type().to_string();
            let entity_id = stale.entity_id().to_string();
            let _guard = self.locks.lock(&entity_type, &entity_id).await;

            // Rebuild the case under the lock; the facade may have written
            // since the pull saw it.
            let Some(local) = self.store.get(&entity_type, &entity_id)? else {
                self.store.put(&stale.remote)?;
                continue;
            };
            let pending = self.queue.pending_for(&entity_type, &entity_id)?;
            if !local.dirty && pending.is_empty() {
                if stale.remote.version > local.version {
                    self.store.put(&stale.remote)?;
                }
                continue;
            }

            let case = ConflictCase {
                local,
                remote: stale.remote,
                pending,
            };
            let resolution = self.resolver.resolve(&case);
            report.conflicts += 1;
            report.discarded += self.apply_resolution(&case, &resolution)? as u64;
        }
        Ok(())
    }

    /// Write a resolution back: record and queue adjustments commit in one
    /// atomic batch. The caller holds the entity lock. Returns how many
    /// pending mutations were discarded.
    fn apply_resolution(&self, case: &ConflictCase, resolution: &Resolution) -> SyncResult<usize> {
        let entity_type = case.entity_type();
        let entity_id = case.entity_id();
        let mut discarded = Vec::new();

        match resolution.action {
            ResolutionAction::TakeRemote => {
                self.store.transaction(|tx| {
                    tx.put_record(&resolution.record)?;
                    discarded =
                        self.queue
                            .stage_discard_entity(tx, entity_type, entity_id, "superseded")?;
                    Ok(())
                })?;
            }
            ResolutionAction::KeepLocal => {
                self.store.transaction(|tx| {
                    tx.put_record(&resolution.record)?;
                    self.queue
                        .stage_rebase_entity(tx, entity_type, entity_id, case.remote.version)?;
                    Ok(())
                })?;
            }
            ResolutionAction::Merged => {
                // The queued history is absorbed by one mutation carrying
                // the merged payload against the remote baseline.
                let replacement = if case.remote.tombstoned {
                    let mut m = Mutation::create(entity_type, entity_id, resolution.record.data.clone());
                    m.baseline_version = case.remote.version;
                    m
                } else {
                    Mutation::update(
                        entity_type,
                        entity_id,
                        resolution.record.data.clone(),
                        case.remote.version,
                    )
                };
                self.store.transaction(|tx| {
                    tx.put_record(&resolution.record)?;
                    discarded =
                        self.queue
                            .stage_discard_entity(tx, entity_type, entity_id, "superseded")?;
                    self.queue.stage_enqueue(tx, &replacement)?;
                    Ok(())
                })?;
            }
        }

        for m in &discarded {
            self.emit_discarded(m, "superseded");
        }
        debug!(
            "Resolved conflict for {}/{} via {} ({:?})",
            entity_type, entity_id, resolution.strategy, resolution.action
        );
        let _ = self.events.send(EngineEvent::ConflictResolved {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            action: resolution.action,
            strategy: resolution.strategy,
        });
        Ok(discarded.len())
    }

    // ---------- Cursor checkpoint ----------

    fn load_cursor(&self) -> SyncResult<Option<SyncCursor>> {
        let Some(bytes) = self.store.engine().get(META_CF, CURSOR_KEY)? else {
            return Ok(None);
        };
        match bincode::deserialize(&bytes) {
            Ok(cursor) => Ok(Some(cursor)),
            Err(e) => {
                // Restarting the feed is safe: applying a change twice is a
                // no-op thanks to the version guard.
                warn!("Pull cursor checkpoint unreadable ({}); starting over", e);
                Ok(None)
            }
        }
    }

    fn save_cursor(&self, cursor: &SyncCursor) -> SyncResult<()> {
        let bytes = bincode::serialize(cursor)
            .map_err(|e| SyncError::Storage(format!("cursor checkpoint encode: {}", e)))?;
        self.store.engine().put(META_CF, CURSOR_KEY, &bytes)
    }

    // ---------- Plumbing ----------

    async fn with_timeout<T>(
        &self,
        fut: impl Future<Output = SyncResult<T>>,
    ) -> SyncResult<T> {
        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Transient("request timed out".to_string())),
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.state.write().phase = phase;
    }

    fn publish_report(&self, report: SyncReport) {
        self.state.write().last_report = Some(report);
    }

    fn emit_discarded(&self, mutation: &Mutation, reason: &str) {
        let _ = self.events.send(EngineEvent::MutationDiscarded {
            mutation_id: mutation.id,
            entity_type: mutation.entity_type.clone(),
            entity_id: mutation.entity_id.clone(),
            reason: reason.to_string(),
        });
    }
}

/// Create a command channel pair for engine control.
pub fn create_command_channel() -> (mpsc::Sender<EngineCommand>, mpsc::Receiver<EngineCommand>) {
    mpsc::channel(100)
}

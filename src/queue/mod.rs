//! Durable FIFO queue of pending mutations.
//!
//! Entries live in the `queue` column family under keys of the form
//! `m␟{entity_type}␟{entity_id}␟{sequence}` with a zero-padded global
//! sequence, so a prefix scan yields each entity's mutations in enqueue
//! order. A secondary `i␟{uuid}` index maps mutation ids to their active
//! entry; terminal mutations move to `h␟{uuid}` history entries.

pub mod mutation;

pub use mutation::{Mutation, MutationOperation, MutationStatus};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::WriteBatch;
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::{SyncError, SyncResult};
use crate::storage::record::KEY_SEP;
use crate::storage::{StorageEngine, StoreTransaction, META_CF, QUEUE_CF};

const SEQ_KEY: &[u8] = b"queue_sequence";
const ACTIVE_TAG: u8 = b'm';
const INDEX_TAG: u8 = b'i';
const HISTORY_TAG: u8 = b'h';
const ACTIVE_SCAN_PREFIX: &[u8] = &[ACTIVE_TAG, KEY_SEP];

fn entity_prefix(entity_type: &str, entity_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(entity_type.len() + entity_id.len() + 4);
    key.push(ACTIVE_TAG);
    key.push(KEY_SEP);
    key.extend_from_slice(entity_type.as_bytes());
    key.push(KEY_SEP);
    key.extend_from_slice(entity_id.as_bytes());
    key.push(KEY_SEP);
    key
}

fn active_key(entity_type: &str, entity_id: &str, seq: u64) -> Vec<u8> {
    let mut key = entity_prefix(entity_type, entity_id);
    key.extend_from_slice(format!("{:020}", seq).as_bytes());
    key
}

/// Sequence number encoded in the last 20 bytes of an active key.
fn key_sequence(key: &[u8]) -> Option<u64> {
    if key.len() < 20 {
        return None;
    }
    std::str::from_utf8(&key[key.len() - 20..]).ok()?.parse().ok()
}

fn index_key(id: &Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(18);
    key.push(INDEX_TAG);
    key.push(KEY_SEP);
    key.extend_from_slice(id.as_bytes());
    key
}

fn history_key(id: &Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(18);
    key.push(HISTORY_TAG);
    key.push(KEY_SEP);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Durable, restart-safe mutation queue.
#[derive(Clone)]
pub struct MutationQueue {
    engine: StorageEngine,
    sequence: Arc<Mutex<u64>>,
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue")
            .field("sequence", &*self.sequence.lock())
            .finish()
    }
}

impl MutationQueue {
    /// Load the queue from storage. Any mutation left `InFlight` by a crash
    /// reverts to `Pending`; its push may have landed, but the server
    /// deduplicates by mutation id, so re-pushing is safe. The sequence
    /// counter resumes from the persisted value or the highest live key,
    /// whichever is larger.
    pub fn open(engine: StorageEngine) -> SyncResult<Self> {
        let sequence = match engine.get(META_CF, SEQ_KEY)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_slice().try_into().unwrap_or([0u8; 8]);
                u64::from_be_bytes(arr)
            }
            None => 0,
        };

        let queue = Self {
            engine,
            sequence: Arc::new(Mutex::new(sequence)),
        };
        queue.recover()?;
        Ok(queue)
    }

    fn recover(&self) -> SyncResult<()> {
        let cf = self.engine.cf(QUEUE_CF)?;
        let mut batch = WriteBatch::default();
        let mut recovered = 0;
        let mut max_seq = 0u64;
        for (key, value) in self.engine.scan_prefix(QUEUE_CF, ACTIVE_SCAN_PREFIX)? {
            if let Some(seq) = key_sequence(&key) {
                max_seq = max_seq.max(seq);
            }
            let mut mutation: Mutation = serde_json::from_slice(&value)?;
            if mutation.status == MutationStatus::InFlight {
                mutation.status = MutationStatus::Pending;
                batch.put_cf(cf, key, serde_json::to_vec(&mutation)?);
                recovered += 1;
            }
        }

        // Write batches from concurrent callers can commit in either order,
        // so the persisted counter may trail the highest key on disk. Never
        // resume below a live key: reusing its sequence would overwrite it.
        {
            let mut seq = self.sequence.lock();
            if max_seq > *seq {
                tracing::warn!(
                    "Sequence counter behind live queue keys ({} < {}), resuming from keys",
                    *seq,
                    max_seq
                );
                *seq = max_seq;
            }
        }

        if recovered > 0 {
            self.engine.commit(batch)?;
            tracing::debug!("Recovered {} in-flight mutations to pending", recovered);
        }
        Ok(())
    }

    /// Append a mutation durably. Returns its queue sequence number.
    pub fn enqueue(&self, mutation: &Mutation) -> SyncResult<u64> {
        let cf = self.engine.cf(QUEUE_CF)?;
        let meta = self.engine.cf(META_CF)?;

        let mut seq = self.sequence.lock();
        *seq += 1;
        let key = active_key(&mutation.entity_type, &mutation.entity_id, *seq);

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, &key, serde_json::to_vec(mutation)?);
        batch.put_cf(cf, index_key(&mutation.id), &key);
        batch.put_cf(meta, SEQ_KEY, seq.to_be_bytes());
        self.engine.commit(batch)?;
        Ok(*seq)
    }

    /// Stage an enqueue into a store transaction so the optimistic record
    /// write and the queue entry commit in one atomic batch.
    pub fn stage_enqueue(
        &self,
        tx: &mut StoreTransaction,
        mutation: &Mutation,
    ) -> SyncResult<u64> {
        let mut seq = self.sequence.lock();
        *seq += 1;
        let key = active_key(&mutation.entity_type, &mutation.entity_id, *seq);
        tx.put_raw(QUEUE_CF, &key, &serde_json::to_vec(mutation)?)?;
        tx.put_raw(QUEUE_CF, &index_key(&mutation.id), &key)?;
        tx.put_raw(META_CF, SEQ_KEY, &seq.to_be_bytes())?;
        Ok(*seq)
    }

    /// Head of one entity's queue, whatever its status.
    pub fn peek_next(&self, entity_type: &str, entity_id: &str) -> SyncResult<Option<Mutation>> {
        let prefix = entity_prefix(entity_type, entity_id);
        match self.engine.scan_prefix(QUEUE_CF, &prefix)?.into_iter().next() {
            Some((_, value)) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Every queued mutation for one entity, in enqueue order.
    pub fn pending_for(&self, entity_type: &str, entity_id: &str) -> SyncResult<Vec<Mutation>> {
        let prefix = entity_prefix(entity_type, entity_id);
        let mut out = Vec::new();
        for (_, value) in self.engine.scan_prefix(QUEUE_CF, &prefix)? {
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    pub fn has_pending(&self, entity_type: &str, entity_id: &str) -> SyncResult<bool> {
        Ok(self.peek_next(entity_type, entity_id)?.is_some())
    }

    /// The head mutation of every entity whose head may be pushed at `now`.
    /// Keys sort by (type, id, sequence), so the first entry seen per entity
    /// is its head.
    pub fn due_heads(&self, now: DateTime<Utc>) -> SyncResult<Vec<Mutation>> {
        let mut heads = Vec::new();
        let mut current: Option<(String, String)> = None;
        for (_, value) in self.engine.scan_prefix(QUEUE_CF, ACTIVE_SCAN_PREFIX)? {
            let mutation: Mutation = serde_json::from_slice(&value)?;
            let entity = (mutation.entity_type.clone(), mutation.entity_id.clone());
            if current.as_ref() == Some(&entity) {
                continue;
            }
            current = Some(entity);
            if mutation.is_pushable(now) {
                heads.push(mutation);
            }
        }
        Ok(heads)
    }

    /// Durably mark a mutation as handed to the transport.
    pub fn mark_in_flight(&self, id: &Uuid) -> SyncResult<Mutation> {
        let (key, mut mutation) = self.load_active(id)?;
        mutation.status = MutationStatus::InFlight;
        self.engine
            .put(QUEUE_CF, &key, &serde_json::to_vec(&mutation)?)?;
        Ok(mutation)
    }

    /// Server accepted the mutation: terminal `Synced`, removed from the
    /// active queue.
    pub fn ack(&self, id: &Uuid) -> SyncResult<Mutation> {
        let (key, mut mutation) = self.load_active(id)?;
        mutation.status = MutationStatus::Synced;
        mutation.last_error = None;
        mutation.not_before = None;
        self.retire(&key, &mutation)?;
        Ok(mutation)
    }

    /// Stage an ack into a store transaction, so queue retirement and the
    /// record's version bump commit in one atomic batch.
    pub fn stage_ack(&self, tx: &mut StoreTransaction, id: &Uuid) -> SyncResult<Mutation> {
        let (key, mut mutation) = self.load_active(id)?;
        mutation.status = MutationStatus::Synced;
        mutation.last_error = None;
        mutation.not_before = None;
        tx.delete_raw(QUEUE_CF, &key)?;
        tx.delete_raw(QUEUE_CF, &index_key(&mutation.id))?;
        tx.put_raw(
            QUEUE_CF,
            &history_key(&mutation.id),
            &serde_json::to_vec(&mutation)?,
        )?;
        Ok(mutation)
    }

    /// A push attempt failed. Reschedules with backoff until the policy's
    /// retry budget runs out, then discards.
    pub fn fail(&self, id: &Uuid, error: &str, policy: &RetryPolicy) -> SyncResult<Mutation> {
        let (key, mut mutation) = self.load_active(id)?;
        mutation.retry_count += 1;
        mutation.last_error = Some(error.to_string());

        if mutation.retry_count >= policy.max_retries {
            mutation.status = MutationStatus::Discarded;
            mutation.not_before = None;
            self.retire(&key, &mutation)?;
            tracing::warn!(
                "Mutation {} discarded after {} failed attempts: {}",
                id,
                mutation.retry_count,
                error
            );
        } else {
            mutation.status = MutationStatus::Failed;
            let delay = chrono::Duration::from_std(policy.delay_for(mutation.retry_count))
                .unwrap_or_else(|_| chrono::Duration::zero());
            mutation.not_before = Utc::now().checked_add_signed(delay);
            self.engine
                .put(QUEUE_CF, &key, &serde_json::to_vec(&mutation)?)?;
        }
        Ok(mutation)
    }

    /// Immediately retire a mutation as `Discarded` (superseded by a remote
    /// state, or rejected as invalid).
    pub fn discard(&self, id: &Uuid, reason: &str) -> SyncResult<Mutation> {
        let (key, mut mutation) = self.load_active(id)?;
        mutation.status = MutationStatus::Discarded;
        mutation.last_error = Some(reason.to_string());
        self.retire(&key, &mutation)?;
        Ok(mutation)
    }

    /// Stage the discard of every pending mutation for one entity into a
    /// store transaction. Used when a resolution supersedes local history.
    pub fn stage_discard_entity(
        &self,
        tx: &mut StoreTransaction,
        entity_type: &str,
        entity_id: &str,
        reason: &str,
    ) -> SyncResult<Vec<Mutation>> {
        let prefix = entity_prefix(entity_type, entity_id);
        let mut discarded = Vec::new();
        for (key, value) in self.engine.scan_prefix(QUEUE_CF, &prefix)? {
            let mut mutation: Mutation = serde_json::from_slice(&value)?;
            mutation.status = MutationStatus::Discarded;
            mutation.last_error = Some(reason.to_string());
            tx.delete_raw(QUEUE_CF, &key)?;
            tx.delete_raw(QUEUE_CF, &index_key(&mutation.id))?;
            tx.put_raw(
                QUEUE_CF,
                &history_key(&mutation.id),
                &serde_json::to_vec(&mutation)?,
            )?;
            discarded.push(mutation);
        }
        Ok(discarded)
    }

    /// Stage a rebase of every active mutation for one entity onto a new
    /// server baseline. Clears any stale `InFlight` marker so the head is
    /// eligible for the next push. Returns the number rebased.
    pub fn stage_rebase_entity(
        &self,
        tx: &mut StoreTransaction,
        entity_type: &str,
        entity_id: &str,
        new_baseline: u64,
    ) -> SyncResult<usize> {
        let prefix = entity_prefix(entity_type, entity_id);
        let mut rebased = 0;
        for (key, value) in self.engine.scan_prefix(QUEUE_CF, &prefix)? {
            let mut mutation: Mutation = serde_json::from_slice(&value)?;
            mutation.baseline_version = new_baseline;
            if mutation.status == MutationStatus::InFlight {
                mutation.status = MutationStatus::Pending;
            }
            tx.put_raw(QUEUE_CF, &key, &serde_json::to_vec(&mutation)?)?;
            rebased += 1;
        }
        Ok(rebased)
    }

    /// Rewrite an active mutation in place (rebase after a resolved push
    /// conflict). Status and queue position are preserved by the caller.
    pub fn update(&self, mutation: &Mutation) -> SyncResult<()> {
        let (key, _) = self.load_active(&mutation.id)?;
        self.engine
            .put(QUEUE_CF, &key, &serde_json::to_vec(mutation)?)
    }

    /// Look up a mutation, active or terminal.
    pub fn get(&self, id: &Uuid) -> SyncResult<Option<Mutation>> {
        if let Some(key) = self.engine.get(QUEUE_CF, &index_key(id))? {
            if let Some(value) = self.engine.get(QUEUE_CF, &key)? {
                return Ok(Some(serde_json::from_slice(&value)?));
            }
        }
        match self.engine.get(QUEUE_CF, &history_key(id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Number of non-terminal mutations across all entities.
    pub fn pending_count(&self) -> SyncResult<usize> {
        Ok(self.engine.scan_prefix(QUEUE_CF, ACTIVE_SCAN_PREFIX)?.len())
    }

    fn load_active(&self, id: &Uuid) -> SyncResult<(Vec<u8>, Mutation)> {
        let key = self
            .engine
            .get(QUEUE_CF, &index_key(id))?
            .ok_or_else(|| SyncError::Validation(format!("mutation {} is not active", id)))?;
        let value = self.engine.get(QUEUE_CF, &key)?.ok_or_else(|| {
            SyncError::Storage(format!("queue index points at missing entry for {}", id))
        })?;
        Ok((key, serde_json::from_slice(&value)?))
    }

    fn retire(&self, active_key: &[u8], mutation: &Mutation) -> SyncResult<()> {
        let cf = self.engine.cf(QUEUE_CF)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf, active_key);
        batch.delete_cf(cf, index_key(&mutation.id));
        batch.put_cf(cf, history_key(&mutation.id), serde_json::to_vec(mutation)?);
        self.engine.commit(batch)
    }
}

use std::sync::Arc;
use std::time::Duration;

use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::engine::{StorageEngine, RECORDS_CF};
use super::record::Record;
use crate::error::{SyncError, SyncResult};

/// What happened to a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ChangeKind {
    #[serde(rename = "upsert")]
    Upsert,
    #[serde(rename = "tombstone")]
    Tombstone,
    #[serde(rename = "purge")]
    Purge,
}

/// Emitted on the store's broadcast channel after every committed write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreChange {
    pub kind: ChangeKind,
    pub entity_type: String,
    pub id: String,
    /// The record as written; `None` for purges.
    pub record: Option<Record>,
}

/// Counts reported by [`LocalStore::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub total: usize,
    pub live: usize,
    pub tombstoned: usize,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} records ({} live, {} tombstoned)",
            self.total, self.live, self.tombstoned
        )
    }
}

/// Durable record store over the `records` column family.
///
/// All writes go through atomic batches; multi-record updates use
/// [`LocalStore::transaction`] so either every staged write commits or none
/// do. Committed writes are published to change subscribers.
#[derive(Clone)]
pub struct LocalStore {
    engine: StorageEngine,
    change_sender: Arc<broadcast::Sender<StoreChange>>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("engine", &self.engine)
            .finish()
    }
}

impl LocalStore {
    pub fn new(engine: StorageEngine, event_buffer: usize) -> Self {
        let (change_sender, _) = broadcast::channel(event_buffer.max(1));
        Self {
            engine,
            change_sender: Arc::new(change_sender),
        }
    }

    /// Fetch a record, tombstoned or not. Callers that only want live data
    /// filter with [`Record::is_live`].
    pub fn get(&self, entity_type: &str, id: &str) -> SyncResult<Option<Record>> {
        let key = Record::key_for(entity_type, id);
        match self.engine.get(RECORDS_CF, &key)? {
            Some(bytes) => Ok(Some(Record::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Upsert a record and notify subscribers.
    pub fn put(&self, record: &Record) -> SyncResult<()> {
        self.engine
            .put(RECORDS_CF, &record.storage_key(), &record.to_bytes()?)?;
        self.emit(change_for(record));
        Ok(())
    }

    /// Record a deletion as a tombstone. The record stays in storage for the
    /// sync pipeline; readers see it as gone.
    pub fn delete(&self, entity_type: &str, id: &str) -> SyncResult<()> {
        let mut record = self.get(entity_type, id)?.ok_or_else(|| {
            SyncError::Validation(format!("cannot delete unknown entity {}/{}", entity_type, id))
        })?;
        record.mark_tombstoned();
        self.put(&record)
    }

    /// All records of one entity type, in id order. Includes tombstones.
    pub fn query_by_type(&self, entity_type: &str) -> SyncResult<Vec<Record>> {
        let prefix = Record::type_prefix(entity_type);
        let mut records = Vec::new();
        for (_, value) in self.engine.scan_prefix(RECORDS_CF, &prefix)? {
            records.push(Record::from_bytes(&value)?);
        }
        Ok(records)
    }

    /// Run `f` against a transaction; every staged write commits atomically,
    /// or none commit when `f` returns an error.
    pub fn transaction<F>(&self, f: F) -> SyncResult<()>
    where
        F: FnOnce(&mut StoreTransaction) -> SyncResult<()>,
    {
        let mut tx = StoreTransaction {
            engine: &self.engine,
            batch: WriteBatch::default(),
            changes: Vec::new(),
        };
        f(&mut tx)?;
        let StoreTransaction { batch, changes, .. } = tx;
        self.engine.commit(batch)?;
        for change in changes {
            self.emit(change);
        }
        Ok(())
    }

    /// Remove tombstones whose deletion was confirmed (not dirty) and whose
    /// last update is older than `retention`. Returns how many were purged.
    pub fn purge_tombstones(&self, retention: Duration) -> SyncResult<usize> {
        // An out-of-range retention purges nothing.
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| chrono::Utc::now().checked_sub_signed(r))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let mut purged = Vec::new();
        for (key, value) in self.engine.scan_prefix(RECORDS_CF, b"")? {
            let record = Record::from_bytes(&value)?;
            if record.tombstoned && !record.dirty && record.updated_at < cutoff {
                purged.push((key, record));
            }
        }

        if purged.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::default();
        let cf = self.engine.cf(RECORDS_CF)?;
        for (key, _) in &purged {
            batch.delete_cf(cf, key);
        }
        self.engine.commit(batch)?;

        let count = purged.len();
        for (_, record) in purged {
            self.emit(StoreChange {
                kind: ChangeKind::Purge,
                entity_type: record.entity_type,
                id: record.id,
                record: None,
            });
        }
        tracing::debug!("Purged {} expired tombstones", count);
        Ok(count)
    }

    pub fn stats(&self) -> SyncResult<StoreStats> {
        let mut stats = StoreStats::default();
        for (_, value) in self.engine.scan_prefix(RECORDS_CF, b"")? {
            let record = Record::from_bytes(&value)?;
            stats.total += 1;
            if record.tombstoned {
                stats.tombstoned += 1;
            } else {
                stats.live += 1;
            }
        }
        Ok(stats)
    }

    /// Subscribe to committed record changes.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.change_sender.subscribe()
    }

    pub fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    fn emit(&self, change: StoreChange) {
        // No receivers is fine.
        let _ = self.change_sender.send(change);
    }
}

fn change_for(record: &Record) -> StoreChange {
    StoreChange {
        kind: if record.tombstoned {
            ChangeKind::Tombstone
        } else {
            ChangeKind::Upsert
        },
        entity_type: record.entity_type.clone(),
        id: record.id.clone(),
        record: Some(record.clone()),
    }
}

/// Staging handle passed to [`LocalStore::transaction`] closures.
///
/// Record writes are tracked for change notification; raw writes let other
/// components (the mutation queue) join the same atomic commit.
pub struct StoreTransaction<'a> {
    engine: &'a StorageEngine,
    batch: WriteBatch,
    changes: Vec<StoreChange>,
}

impl StoreTransaction<'_> {
    pub fn put_record(&mut self, record: &Record) -> SyncResult<()> {
        let cf = self.engine.cf(RECORDS_CF)?;
        self.batch
            .put_cf(cf, record.storage_key(), record.to_bytes()?);
        self.changes.push(change_for(record));
        Ok(())
    }

    /// Stage a write in an arbitrary column family.
    pub fn put_raw(&mut self, cf_name: &str, key: &[u8], value: &[u8]) -> SyncResult<()> {
        let cf = self.engine.cf(cf_name)?;
        self.batch.put_cf(cf, key, value);
        Ok(())
    }

    /// Stage a delete in an arbitrary column family.
    pub fn delete_raw(&mut self, cf_name: &str, key: &[u8]) -> SyncResult<()> {
        let cf = self.engine.cf(cf_name)?;
        self.batch.delete_cf(cf, key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path()).unwrap();
        (LocalStore::new(engine, 100), dir)
    }

    #[test]
    fn test_put_get_round_trip() {
        let (store, _dir) = create_test_store();
        let record = Record::new("note", "n1", json!({"title": "hello"}));
        store.put(&record).unwrap();

        let loaded = store.get("note", "n1").unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.get("note", "missing").unwrap().is_none());
    }

    #[test]
    fn test_delete_writes_tombstone() {
        let (store, _dir) = create_test_store();
        store.put(&Record::new("note", "n1", json!({}))).unwrap();
        store.delete("note", "n1").unwrap();

        let loaded = store.get("note", "n1").unwrap().unwrap();
        assert!(loaded.tombstoned);
        assert!(loaded.dirty);
    }

    #[test]
    fn test_delete_unknown_is_validation_error() {
        let (store, _dir) = create_test_store();
        let err = store.delete("note", "ghost").unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_query_by_type_scopes_to_prefix() {
        let (store, _dir) = create_test_store();
        store.put(&Record::new("note", "n1", json!({}))).unwrap();
        store.put(&Record::new("note", "n2", json!({}))).unwrap();
        store.put(&Record::new("notebook", "b1", json!({}))).unwrap();

        let notes = store.query_by_type("note").unwrap();
        assert_eq!(notes.len(), 2);
        assert!(notes.iter().all(|r| r.entity_type == "note"));
    }

    #[test]
    fn test_transaction_commits_all_writes() {
        let (store, _dir) = create_test_store();
        store
            .transaction(|tx| {
                tx.put_record(&Record::new("note", "n1", json!({"v": 1})))?;
                tx.put_record(&Record::new("note", "n2", json!({"v": 2})))?;
                Ok(())
            })
            .unwrap();

        assert!(store.get("note", "n1").unwrap().is_some());
        assert!(store.get("note", "n2").unwrap().is_some());
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let (store, _dir) = create_test_store();
        let result = store.transaction(|tx| {
            tx.put_record(&Record::new("note", "n1", json!({})))?;
            Err(SyncError::Validation("abort".to_string()))
        });

        assert!(result.is_err());
        assert!(store.get("note", "n1").unwrap().is_none());
    }

    #[test]
    fn test_change_feed_publishes_committed_writes() {
        let (store, _dir) = create_test_store();
        let mut changes = store.subscribe_changes();

        store.put(&Record::new("note", "n1", json!({}))).unwrap();
        let change = changes.try_recv().unwrap();
        assert_eq!(change.kind, ChangeKind::Upsert);
        assert_eq!(change.id, "n1");

        store.delete("note", "n1").unwrap();
        let change = changes.try_recv().unwrap();
        assert_eq!(change.kind, ChangeKind::Tombstone);
    }

    #[test]
    fn test_purge_only_takes_confirmed_expired_tombstones() {
        let (store, _dir) = create_test_store();

        // Confirmed and old: purged.
        let mut old_confirmed = Record::new("note", "old", json!({}));
        old_confirmed.mark_tombstoned();
        old_confirmed.dirty = false;
        old_confirmed.updated_at = chrono::Utc::now() - chrono::Duration::days(40);
        store.put(&old_confirmed).unwrap();

        // Old but still dirty (delete not yet synced): kept.
        let mut old_dirty = Record::new("note", "dirty", json!({}));
        old_dirty.mark_tombstoned();
        old_dirty.updated_at = chrono::Utc::now() - chrono::Duration::days(40);
        store.put(&old_dirty).unwrap();

        // Confirmed but recent: kept.
        let mut recent = Record::new("note", "recent", json!({}));
        recent.mark_tombstoned();
        recent.dirty = false;
        store.put(&recent).unwrap();

        let purged = store.purge_tombstones(Duration::from_secs(30 * 24 * 3600)).unwrap();
        assert_eq!(purged, 1);
        assert!(store.get("note", "old").unwrap().is_none());
        assert!(store.get("note", "dirty").unwrap().is_some());
        assert!(store.get("note", "recent").unwrap().is_some());
    }

    #[test]
    fn test_stats_counts() {
        let (store, _dir) = create_test_store();
        store.put(&Record::new("note", "n1", json!({}))).unwrap();
        store.put(&Record::new("note", "n2", json!({}))).unwrap();
        store.delete("note", "n2").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.live, 1);
        assert_eq!(stats.tombstoned, 1);
        assert_eq!(stats.to_string(), "2 records (1 live, 1 tombstoned)");
    }
}

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, DB};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{SyncError, SyncResult};

/// Column family holding entity records.
pub const RECORDS_CF: &str = "records";
/// Column family holding queued mutations.
pub const QUEUE_CF: &str = "queue";
/// Column family holding engine metadata (pull cursor, sequence counter).
pub const META_CF: &str = "_meta";

/// RocksDB-backed storage shared by the record store and the mutation queue.
///
/// Both live in column families of the same database so that an optimistic
/// write and its queued mutation commit in a single atomic [`WriteBatch`].
pub struct StorageEngine {
    db: Arc<DB>,
    path: PathBuf,
}

impl Clone for StorageEngine {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            path: self.path.clone(),
        }
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("path", &self.path)
            .finish()
    }
}

impl StorageEngine {
    /// Open (or create) the database at `data_dir` with all column families.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> SyncResult<Self> {
        let path = data_dir.as_ref().to_path_buf();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // Bound WAL growth; this is client-side storage, not a server.
        opts.set_max_total_wal_size(50 * 1024 * 1024);
        opts.set_keep_log_file_num(5);

        let mut cf_names = match DB::list_cf(&opts, &path) {
            Ok(cfs) => cfs,
            Err(_) => vec!["default".to_string()],
        };
        for required in [RECORDS_CF, QUEUE_CF, META_CF] {
            if !cf_names.iter().any(|n| n == required) {
                cf_names.push(required.to_string());
            }
        }

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = cf_names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)
            .map_err(|e| SyncError::Storage(format!("failed to open database: {}", e)))?;

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    /// Resolve a column family handle.
    pub fn cf(&self, name: &str) -> SyncResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| SyncError::Storage(format!("column family '{}' missing", name)))
    }

    pub fn get(&self, cf_name: &str, key: &[u8]) -> SyncResult<Option<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    pub fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> SyncResult<()> {
        let cf = self.cf(cf_name)?;
        Ok(self.db.put_cf(cf, key, value)?)
    }

    pub fn delete(&self, cf_name: &str, key: &[u8]) -> SyncResult<()> {
        let cf = self.cf(cf_name)?;
        Ok(self.db.delete_cf(cf, key)?)
    }

    /// Commit a batch atomically: all writes land or none do.
    pub fn commit(&self, batch: WriteBatch) -> SyncResult<()> {
        Ok(self.db.write(batch)?)
    }

    /// Collect all `(key, value)` pairs under `prefix`, in key order.
    pub fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> SyncResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(cf_name)?;
        let mut out = Vec::new();
        for item in self.db.prefix_iterator_cf(cf, prefix) {
            let (key, value) = item?;
            // prefix_iterator only positions the cursor; it does not stop
            // at the end of the prefix range.
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

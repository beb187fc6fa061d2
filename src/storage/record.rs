use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncResult;

/// Byte separating entity type from entity id in storage keys. A unit
/// separator cannot collide with validated type/id strings, so prefix
/// scans stay unambiguous ("note" never shadows "notebook").
pub const KEY_SEP: u8 = 0x1f;

/// One locally stored entity.
///
/// `version` is the last server-assigned version (0 until the first
/// successful sync). `dirty` marks local changes not yet acknowledged by
/// the server; `tombstoned` marks a deletion awaiting sync and then
/// retention-based purge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub entity_type: String,
    pub id: String,
    pub data: Value,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub dirty: bool,
    pub tombstoned: bool,
}

impl Record {
    /// A brand-new local record that has never been synced.
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>, data: Value) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            data,
            version: 0,
            updated_at: Utc::now(),
            dirty: true,
            tombstoned: false,
        }
    }

    /// Apply a local edit: replaces the payload and marks the record dirty.
    pub fn apply_local(&mut self, data: Value) {
        self.data = data;
        self.updated_at = Utc::now();
        self.dirty = true;
        self.tombstoned = false;
    }

    /// Mark the record deleted locally. The tombstone stays visible to the
    /// sync pipeline (not to readers) until the deletion is confirmed.
    pub fn mark_tombstoned(&mut self) {
        self.tombstoned = true;
        self.dirty = true;
        self.updated_at = Utc::now();
    }

    /// Record the server's acknowledgement of the local state.
    pub fn mark_synced(&mut self, server_version: u64) {
        self.version = server_version;
        self.dirty = false;
    }

    /// Visible to readers: not deleted.
    pub fn is_live(&self) -> bool {
        !self.tombstoned
    }

    /// Storage key for this record.
    pub fn storage_key(&self) -> Vec<u8> {
        Self::key_for(&self.entity_type, &self.id)
    }

    /// `{entity_type}␟{id}`, so records of one type share a key prefix.
    pub fn key_for(entity_type: &str, id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(entity_type.len() + 1 + id.len());
        key.extend_from_slice(entity_type.as_bytes());
        key.push(KEY_SEP);
        key.extend_from_slice(id.as_bytes());
        key
    }

    /// Prefix covering every record of `entity_type`.
    pub fn type_prefix(entity_type: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(entity_type.len() + 1);
        prefix.extend_from_slice(entity_type.as_bytes());
        prefix.push(KEY_SEP);
        prefix
    }

    pub fn to_bytes(&self) -> SyncResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

use thiserror::Error;

/// Errors surfaced by the sync engine, grouped by how callers should react:
/// transient errors are retried with backoff, conflicts are resolved rather
/// than reported, validation and quota errors are fatal to the triggering
/// write only, and storage errors abort the current operation or session.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transient network error: {0}")]
    Transient(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Engine closed")]
    Closed,
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Retryable under the engine's backoff policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    /// Errors that end the whole sync session instead of a single mutation.
    /// The mutation queue is preserved either way.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, SyncError::Storage(_) | SyncError::Closed)
    }
}

impl serde::Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<rocksdb::Error> for SyncError {
    fn from(err: rocksdb::Error) -> Self {
        SyncError::Storage(err.into())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Storage(format!("serialization: {}", err))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SyncError::Transient("connection refused".to_string());
        assert_eq!(err.to_string(), "Transient network error: connection refused");

        let err = SyncError::Conflict("version mismatch on notes/n1".to_string());
        assert_eq!(err.to_string(), "Conflict: version mismatch on notes/n1");

        let err = SyncError::Validation("entity id must not be empty".to_string());
        assert_eq!(err.to_string(), "Validation failed: entity id must not be empty");

        let err = SyncError::Storage("column family missing".to_string());
        assert_eq!(err.to_string(), "Storage error: column family missing");

        let err = SyncError::QuotaExceeded("payload is 2097152 bytes".to_string());
        assert_eq!(err.to_string(), "Quota exceeded: payload is 2097152 bytes");

        assert_eq!(SyncError::Closed.to_string(), "Engine closed");
    }

    #[test]
    fn test_error_classification() {
        assert!(SyncError::Transient("timeout".to_string()).is_transient());
        assert!(!SyncError::Validation("bad".to_string()).is_transient());
        assert!(!SyncError::Conflict("v2 != v3".to_string()).is_transient());

        assert!(SyncError::Storage("disk full".to_string()).is_fatal_to_session());
        assert!(SyncError::Closed.is_fatal_to_session());
        assert!(!SyncError::Transient("timeout".to_string()).is_fatal_to_session());
        assert!(!SyncError::QuotaExceeded("too big".to_string()).is_fatal_to_session());
    }

    #[test]
    fn test_io_error_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err: SyncError = io.into();
        assert!(err.is_transient());
    }

    #[test]
    fn test_serialize_as_string() {
        let err = SyncError::Conflict("stale baseline".to_string());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"Conflict: stale baseline\"");
    }

    #[test]
    fn test_sync_result_type() {
        let ok_result: SyncResult<u64> = Ok(7);
        assert_eq!(ok_result.unwrap(), 7);

        let err_result: SyncResult<u64> = Err(SyncError::Closed);
        assert!(err_result.is_err());
    }
}

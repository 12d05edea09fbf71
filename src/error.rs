//! Error types for cache operations
//!
//! Only two failure classes reach callers: storage I/O on the local root and
//! synchronization failures against the shared backend. Corrupted or missing
//! state never surfaces as an error; it is resolved by a full local resync.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for synchronized cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Publishing or reading shared state failed
    #[error("Cache sync error: {0}")]
    SyncError(String),

    /// Local storage read/write failure
    #[error("Storage error at {path:?}: {source}")]
    StorageError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to open or acquire an advisory file lock
    #[error("Lock error at {path:?}: {source}")]
    LockError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error reported by a shared state backend implementation
    #[error("Backend error: {0}")]
    BackendError(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Wrap an I/O error with the path it occurred on
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::StorageError {
            path: path.into(),
            source,
        }
    }

    /// Whether this error came from the shared backend side of the protocol
    pub fn is_sync_failure(&self) -> bool {
        matches!(self, CacheError::SyncError(_) | CacheError::BackendError(_))
    }
}

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CacheError::SyncError("increment failed".to_string());
        assert_eq!(error.to_string(), "Cache sync error: increment failed");

        let storage = CacheError::storage(
            "/tmp/cache/state.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(storage.to_string().contains("state.json"));
        assert!(storage.to_string().contains("denied"));
    }

    #[test]
    fn test_error_conversion() {
        let error: CacheError = "test error".into();
        assert!(matches!(error, CacheError::Other(_)));

        let error: CacheError = "test error".to_string().into();
        assert!(matches!(error, CacheError::Other(_)));

        let json_err = serde_json::from_str::<u64>("not json").unwrap_err();
        let error: CacheError = json_err.into();
        assert!(matches!(error, CacheError::SerializationError(_)));
    }

    #[test]
    fn test_sync_failure_classification() {
        assert!(CacheError::SyncError("x".into()).is_sync_failure());
        assert!(CacheError::BackendError("x".into()).is_sync_failure());
        assert!(!CacheError::ConfigError("x".into()).is_sync_failure());
    }
}

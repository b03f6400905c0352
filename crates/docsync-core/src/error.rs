//! Sync error taxonomy

use thiserror::Error;

use crate::document::DocumentError;
use crate::storage::StorageError;

/// Errors produced by the synchronization engine
#[derive(Error, Debug)]
pub enum SyncError {
    /// The peer was stopped on purpose. Never logged, never retried.
    #[error("Sync manually stopped")]
    ManualStop,

    /// The storage subscription reported a disconnect
    #[error("Storage connection lost: {0}")]
    ConnectionLost(String),

    /// A wait was cancelled through its token
    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl SyncError {
    /// Failures expected to clear up on their own, logged as warnings
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::ConnectionLost(_) => true,
            SyncError::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::ConnectionLost("gone".into()).is_transient());
        assert!(SyncError::Storage(StorageError::Offline).is_transient());
        assert!(!SyncError::Storage(StorageError::Task("panicked".into())).is_transient());
        assert!(!SyncError::ManualStop.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::ConnectionLost("socket closed".to_string());
        assert!(err.to_string().contains("socket closed"));

        let err = SyncError::from(StorageError::Offline);
        assert!(err.to_string().contains("offline"));
    }
}

//! Storage errors
//!
//! Filesystem failures carry the path they happened on. [`StorageError::is_transient`]
//! tells the retry loop whether the next attempt is likely to get through.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Cannot create storage directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No permission to access '{path}'")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The final rename of an atomic write
    #[error("Cannot move '{from}' into place at '{to}': {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Stored bytes could not be parsed; the file was set aside
    #[error("Document at '{path}' is corrupted ({details}), moved to '{backup_path}'")]
    CorruptDocument {
        path: PathBuf,
        backup_path: PathBuf,
        details: String,
    },

    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    /// A blocking storage task panicked or was cancelled
    #[error("Storage task failed: {0}")]
    Task(String),

    #[error("Storage is offline")]
    Offline,
}

impl StorageError {
    /// Wrap a write-side I/O error, singling out permission problems
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        if error.kind() == io::ErrorKind::PermissionDenied {
            StorageError::PermissionDenied {
                path,
                source: error,
            }
        } else {
            StorageError::Write {
                path,
                source: error,
            }
        }
    }

    /// Whether the same operation may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Offline => true,
            StorageError::Read { source, .. } | StorageError::Write { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_classification() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StorageError::from_io(denied, PathBuf::from("/docs/a.automerge"));
        assert!(matches!(err, StorageError::PermissionDenied { .. }));
        assert!(!err.is_transient());

        let other = io::Error::new(io::ErrorKind::Other, "boom");
        let err = StorageError::from_io(other, PathBuf::from("/docs/a.automerge"));
        assert!(matches!(err, StorageError::Write { .. }));
        assert!(err.to_string().contains("/docs/a.automerge"));
    }

    #[test]
    fn test_transient_errors() {
        assert!(StorageError::Offline.is_transient());

        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow disk");
        assert!(StorageError::from_io(timeout, PathBuf::from("/x")).is_transient());

        let corrupt = StorageError::CorruptDocument {
            path: PathBuf::from("/data/doc.automerge"),
            backup_path: PathBuf::from("/data/doc.automerge.corrupt"),
            details: "invalid header".to_string(),
        };
        assert!(!corrupt.is_transient());
        assert!(corrupt.to_string().contains("doc.automerge.corrupt"));
    }
}

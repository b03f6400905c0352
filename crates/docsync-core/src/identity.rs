//! Root document identity
//!
//! A document tree is named by the ID of its root document. The ID is stored
//! in the data directory on first run; the documents themselves live in the
//! local store and are filled in by syncing.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::document_id::DocumentId;
use crate::storage::fs::atomic_write;

/// Tracks which root document this data directory belongs to
pub struct Identity {
    config: Config,
}

/// Result of initialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitResult {
    /// The root document ID
    pub root_id: DocumentId,
    /// Whether the ID was created by this call
    pub is_new: bool,
}

impl Identity {
    /// Create a new identity manager with default configuration
    pub fn new() -> Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        Ok(Self::with_config(config))
    }

    /// Create a new identity manager with specific configuration
    pub fn with_config(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the data directory path (for display purposes)
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Get the config file path (for display purposes)
    pub fn config_path(&self) -> PathBuf {
        Config::config_file_path()
    }

    /// Check if a root document ID has been stored
    pub fn is_initialized(&self) -> bool {
        self.config.root_doc_id_path().exists()
    }

    /// Get the root document ID if initialized
    pub fn root_id(&self) -> Result<Option<DocumentId>> {
        let path = self.config.root_doc_id_path();
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read root document ID: {:?}", path))?;
        let id = content
            .trim()
            .parse()
            .with_context(|| format!("Invalid root document ID in {:?}", path))?;
        Ok(Some(id))
    }

    /// Get the root document ID, failing with a hint if not initialized
    pub fn require_root_id(&self) -> Result<DocumentId> {
        self.root_id()?
            .context("Not initialized. Run `docsync init` first.")
    }

    /// Create a root document ID unless one exists
    pub fn initialize(&self) -> Result<InitResult> {
        if let Some(root_id) = self.root_id()? {
            return Ok(InitResult {
                root_id,
                is_new: false,
            });
        }

        let root_id = DocumentId::new();
        self.save_root_id(&root_id)?;
        Ok(InitResult {
            root_id,
            is_new: true,
        })
    }

    /// Adopt an existing root document ID
    ///
    /// The documents are pulled from a remote on the next sync. Fails if the
    /// data directory already belongs to a different root.
    pub fn join(&self, root_id: DocumentId) -> Result<InitResult> {
        match self.root_id()? {
            Some(existing) if existing == root_id => Ok(InitResult {
                root_id,
                is_new: false,
            }),
            Some(existing) => anyhow::bail!(
                "Already initialized with root document {}. Use a different data directory to join {}.",
                existing,
                root_id
            ),
            None => {
                self.save_root_id(&root_id)?;
                Ok(InitResult {
                    root_id,
                    is_new: true,
                })
            }
        }
    }

    fn save_root_id(&self, root_id: &DocumentId) -> Result<()> {
        let path = self.config.root_doc_id_path();
        atomic_write(&path, root_id.to_string().as_bytes())
            .with_context(|| format!("Failed to save root document ID: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> Config {
        Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn test_not_initialized_initially() {
        let temp_dir = TempDir::new().unwrap();
        let identity = Identity::with_config(test_config(&temp_dir));

        assert!(!identity.is_initialized());
        assert!(identity.root_id().unwrap().is_none());
        assert!(identity.require_root_id().is_err());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let identity = Identity::with_config(test_config(&temp_dir));

        let first = identity.initialize().unwrap();
        assert!(first.is_new);
        assert!(identity.is_initialized());

        let second = identity.initialize().unwrap();
        assert!(!second.is_new);
        assert_eq!(second.root_id, first.root_id);
        assert_eq!(identity.require_root_id().unwrap(), first.root_id);
    }

    #[test]
    fn test_join() {
        let temp_dir = TempDir::new().unwrap();
        let identity = Identity::with_config(test_config(&temp_dir));
        let root_id = DocumentId::new();

        assert!(identity.join(root_id).unwrap().is_new);
        assert!(!identity.join(root_id).unwrap().is_new);
        assert!(identity.join(DocumentId::new()).is_err());
        assert_eq!(identity.root_id().unwrap(), Some(root_id));
    }

    #[test]
    fn test_invalid_root_id_file() {
        let temp_dir = TempDir::new().unwrap();
        let identity = Identity::with_config(test_config(&temp_dir));
        fs::write(identity.config().root_doc_id_path(), "not-an-id").unwrap();

        assert!(identity.root_id().is_err());
    }
}

//! Directory-backed storage
//!
//! Each document is stored as `<guid>.automerge` in one directory. Writes are
//! atomic (write to temp file, fsync, then rename) so a crash never leaves a
//! partially-written document behind.
//!
//! The directory has no other writers while a peer runs, so subscriptions
//! never receive updates and never disconnect.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use automerge::AutoCommit;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::adapter::{DisconnectCallback, PullResult, StorageAdapter, UpdateCallback};
use super::error::{StorageError, StorageResult};
use crate::document::StateVector;
use crate::document_id::DocumentId;
use crate::observer::Subscription;

const EXTENSION: &str = "automerge";

/// Summary of what a storage directory holds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsStorageStats {
    pub document_count: usize,
    pub total_size: u64,
}

impl FsStorageStats {
    /// Total size formatted for display
    pub fn total_size_human(&self) -> String {
        const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
        let mut size = self.total_size as f64;
        let mut unit = 0;
        while size >= 1024.0 && unit < UNITS.len() - 1 {
            size /= 1024.0;
            unit += 1;
        }
        if unit == 0 {
            format!("{} {}", self.total_size, UNITS[0])
        } else {
            format!("{:.1} {}", size, UNITS[unit])
        }
    }
}

/// Storage adapter over a directory of Automerge files
///
/// Clones share the directory and its write lock. Adapter calls run their
/// file I/O on tokio's blocking pool.
#[derive(Clone)]
pub struct FsStorage {
    name: String,
    dir: PathBuf,
    /// Serializes read-modify-write cycles on push
    write_lock: Arc<Mutex<()>>,
}

impl FsStorage {
    /// Open (creating if needed) a storage directory
    pub fn open(name: &str, dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StorageError::CreateDirectory {
            path: dir.clone(),
            source,
        })?;

        Ok(Self {
            name: name.to_string(),
            dir,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, doc_id: &DocumentId) -> PathBuf {
        self.dir.join(doc_id.file_name())
    }

    pub fn exists(&self, doc_id: &DocumentId) -> bool {
        self.path_for(doc_id).exists()
    }

    /// Load a stored document
    ///
    /// Returns `None` if the file doesn't exist. A file that can't be parsed
    /// is renamed to `<file>.corrupt` and reported as
    /// [`StorageError::CorruptDocument`].
    pub fn load(&self, doc_id: &DocumentId) -> StorageResult<Option<AutoCommit>> {
        let path = self.path_for(doc_id);
        if !path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&path).map_err(|source| StorageError::Read {
            path: path.clone(),
            source,
        })?;

        match AutoCommit::load(&bytes) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) => {
                let backup_path = path.with_extension(format!("{}.corrupt", EXTENSION));
                warn!("Moving corrupt document {:?} to {:?}", path, backup_path);
                fs::rename(&path, &backup_path)
                    .map_err(|source| StorageError::from_io(source, path.clone()))?;
                Err(StorageError::CorruptDocument {
                    path,
                    backup_path,
                    details: e.to_string(),
                })
            }
        }
    }

    fn save(&self, doc_id: &DocumentId, doc: &mut AutoCommit) -> StorageResult<()> {
        atomic_write(&self.path_for(doc_id), &doc.save())
    }

    fn read_delta(
        &self,
        doc_id: &DocumentId,
        state: &StateVector,
    ) -> StorageResult<Option<PullResult>> {
        Ok(self.load(doc_id)?.map(|mut doc| PullResult {
            data: doc.save_after(state.heads()),
            state: StateVector::new(doc.get_heads()),
        }))
    }

    fn merge(&self, doc_id: &DocumentId, data: &[u8]) -> StorageResult<()> {
        let _guard = self.write_lock.lock();

        let mut doc = self.load(doc_id)?.unwrap_or_default();
        let before = doc.get_heads();
        doc.load_incremental(data)?;
        if doc.get_heads() != before {
            debug!(doc = %doc_id, bytes = data.len(), "Persisting update");
            self.save(doc_id, &mut doc)?;
        }
        Ok(())
    }

    /// IDs of every stored document
    pub fn list_docs(&self) -> StorageResult<Vec<DocumentId>> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StorageError::Read {
            path: self.dir.clone(),
            source,
        })?;

        let mut ids: Vec<DocumentId> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == EXTENSION))
            .filter_map(|path| path.file_stem()?.to_str()?.parse().ok())
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn stats(&self) -> StorageResult<FsStorageStats> {
        let ids = self.list_docs()?;
        let total_size = ids
            .iter()
            .filter_map(|id| fs::metadata(self.path_for(id)).ok())
            .map(|meta| meta.len())
            .sum();

        Ok(FsStorageStats {
            document_count: ids.len(),
            total_size,
        })
    }
}

#[async_trait]
impl StorageAdapter for FsStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pull(
        &self,
        doc_id: &DocumentId,
        state: &StateVector,
    ) -> StorageResult<Option<PullResult>> {
        let storage = self.clone();
        let doc_id = *doc_id;
        let state = state.clone();
        blocking(move || storage.read_delta(&doc_id, &state)).await
    }

    async fn push(&self, doc_id: &DocumentId, data: &[u8]) -> StorageResult<()> {
        let storage = self.clone();
        let doc_id = *doc_id;
        let data = data.to_vec();
        blocking(move || storage.merge(&doc_id, &data)).await
    }

    async fn subscribe(
        &self,
        _on_update: UpdateCallback,
        _on_disconnect: DisconnectCallback,
    ) -> StorageResult<Subscription> {
        Ok(Subscription::noop())
    }
}

async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file =
        File::create(&temp_path).map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.write_all(data)
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.sync_all()
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;

    fs::rename(&temp_path, path).map_err(|source| StorageError::Rename {
        from: temp_path.clone(),
        to: path.to_path_buf(),
        source,
    })?;

    Ok(())
}

//! Command handlers

pub mod config;
pub mod doc;
pub mod init;
pub mod status;
pub mod subdoc;
pub mod sync;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use docsync_core::{Config, Doc, DocumentId, FsStorage, Identity, SyncPeer};

/// A root document loaded from local storage and kept in sync with it
pub struct LocalSession {
    pub root: Doc,
    peer: SyncPeer,
}

impl LocalSession {
    /// Load the tree of the initialized root document
    pub async fn open(config: &Config) -> Result<Self> {
        let identity = Identity::with_config(config.clone());
        let root_id = identity.require_root_id()?;
        let storage = FsStorage::open("local", config.storage_dir())
            .context("Failed to open local storage")?;

        let root = Doc::with_guid(root_id);
        let peer = SyncPeer::with_config(root.clone(), Arc::new(storage), config.peer_config());
        peer.wait_for_synced(None)
            .await
            .context("Failed to load documents")?;
        debug!(root = %root_id, docs = peer.status().loaded_docs, "Loaded local documents");

        Ok(Self { root, peer })
    }

    /// The root document, or a sub-document anywhere below it
    pub fn find(&self, id: Option<&str>) -> Result<Doc> {
        let Some(id) = id else {
            return Ok(self.root.clone());
        };
        let id: DocumentId = id
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid document ID: {}", e))?;
        find_in_tree(&self.root, &id)
            .with_context(|| format!("No document {} in this tree", id))
    }

    /// Persist pending changes and stop
    pub async fn close(self) -> Result<()> {
        self.peer
            .wait_for_synced(None)
            .await
            .context("Failed to save changes")?;
        self.peer.shutdown().await;
        Ok(())
    }
}

fn find_in_tree(root: &Doc, id: &DocumentId) -> Option<Doc> {
    let mut seen = HashSet::new();
    let mut stack = vec![root.clone()];
    while let Some(doc) = stack.pop() {
        if doc.guid() == *id {
            return Some(doc);
        }
        if seen.insert(doc.guid()) {
            stack.extend(doc.subdocs());
        }
    }
    None
}

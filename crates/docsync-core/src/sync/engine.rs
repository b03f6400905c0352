//! Sync engine
//!
//! Runs one local peer and any number of remote peers against the same root
//! document. Remote peers start once the local peer has loaded, so whatever
//! was stored offline is in the tree before remote traffic arrives. Updates a
//! remote peer applies are forwarded by every other peer's listeners, which
//! is what makes local storage, the in-memory tree and all remotes converge.

use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::peer::{PeerConfig, SyncPeer};
use super::status::{SyncStatus, SyncStep};
use crate::document::Doc;
use crate::error::{SyncError, SyncResult};
use crate::observer::Subscription;
use crate::storage::StorageAdapter;

/// Overall engine progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEngineStep {
    Stopped,
    Syncing,
    Synced,
}

/// Aggregated status of every peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncEngineStatus {
    pub step: SyncEngineStep,
    pub local: SyncStatus,
    /// One entry per remote, in construction order. Remotes that have not
    /// started yet report [`SyncStatus::initial`].
    pub remotes: Vec<SyncStatus>,
    /// Whether any remote is waiting to retry
    pub retrying: bool,
}

impl SyncEngineStatus {
    fn compute(stopped: bool, local: SyncStatus, remotes: Vec<SyncStatus>) -> Self {
        let retrying = remotes.iter().any(|r| r.step == SyncStep::Retrying);
        let step = if stopped {
            SyncEngineStep::Stopped
        } else if local.reached(SyncStep::Synced)
            && remotes.iter().all(|r| r.reached(SyncStep::Synced))
        {
            SyncEngineStep::Synced
        } else {
            SyncEngineStep::Syncing
        };

        Self {
            step,
            local,
            remotes,
            retrying,
        }
    }
}

struct EngineShared {
    root: Doc,
    config: PeerConfig,
    local: SyncPeer,
    remote_storages: Vec<Arc<dyn StorageAdapter>>,
    remotes: Mutex<Vec<SyncPeer>>,
    subscriptions: Mutex<Vec<Subscription>>,
    cancel: CancellationToken,
    status: watch::Sender<SyncEngineStatus>,
}

impl EngineShared {
    fn refresh(&self) {
        let local = self.local.status();
        let mut remotes: Vec<SyncStatus> = self.remotes.lock().iter().map(SyncPeer::status).collect();
        remotes.resize(self.remote_storages.len(), SyncStatus::initial());

        let next = SyncEngineStatus::compute(self.cancel.is_cancelled(), local, remotes);
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                debug!(step = ?next.step, retrying = next.retrying, "Engine status changed");
                *current = next;
                true
            }
        });
    }

    fn watch_peer(self: &Arc<Self>, peer: &SyncPeer) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let subscription = peer.on_status_change(move |_| {
            if let Some(engine) = weak.upgrade() {
                engine.refresh();
            }
        });
        self.subscriptions.lock().push(subscription);
    }

    fn start_remotes(self: &Arc<Self>) {
        for storage in &self.remote_storages {
            if self.cancel.is_cancelled() {
                return;
            }
            let peer = SyncPeer::with_config(self.root.clone(), storage.clone(), self.config.clone());
            if !self.adopt_remote(peer) {
                return;
            }
            self.refresh();
        }
    }

    /// Register a started remote peer, or stop it if the engine was stopped
    /// in the meantime
    fn adopt_remote(self: &Arc<Self>, peer: SyncPeer) -> bool {
        let mut remotes = self.remotes.lock();
        // `stop` cancels before it walks `remotes`, so checking under the
        // lock leaves no gap
        if self.cancel.is_cancelled() {
            drop(remotes);
            peer.stop();
            return false;
        }
        self.watch_peer(&peer);
        remotes.push(peer);
        true
    }
}

/// Local-first sync across one local and several remote storages
pub struct SyncEngine {
    shared: Arc<EngineShared>,
    starter: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Start syncing `root`
    ///
    /// Must be called within a Tokio runtime. Every storage needs a distinct
    /// name.
    pub fn new(
        root: Doc,
        local: Arc<dyn StorageAdapter>,
        remotes: Vec<Arc<dyn StorageAdapter>>,
        config: PeerConfig,
    ) -> Self {
        info!(
            root = %root.guid(),
            local = local.name(),
            remotes = remotes.len(),
            "Starting sync engine"
        );

        let local = SyncPeer::with_config(root.clone(), local, config.clone());
        let initial = SyncEngineStatus::compute(
            false,
            local.status(),
            vec![SyncStatus::initial(); remotes.len()],
        );
        let (status, _) = watch::channel(initial);

        let shared = Arc::new(EngineShared {
            root,
            config,
            local,
            remote_storages: remotes,
            remotes: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            status,
        });
        shared.watch_peer(&shared.local);
        shared.refresh();

        let starter = {
            let shared = shared.clone();
            tokio::spawn(async move {
                if shared.local.wait_for_loaded(Some(&shared.cancel)).await.is_ok() {
                    debug!("Local peer loaded, starting remote peers");
                    shared.start_remotes();
                }
            })
        };

        Self {
            shared,
            starter: Mutex::new(Some(starter)),
        }
    }

    pub fn root(&self) -> &Doc {
        &self.shared.root
    }

    pub fn local(&self) -> &SyncPeer {
        &self.shared.local
    }

    pub fn status(&self) -> SyncEngineStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncEngineStatus> {
        self.shared.status.subscribe()
    }

    /// Wait until the local peer has connected every document
    pub async fn wait_for_loaded(&self, cancel: Option<&CancellationToken>) -> SyncResult<()> {
        self.shared.local.wait_for_loaded(cancel).await
    }

    /// Wait until every peer is synced
    pub async fn wait_for_synced(&self, cancel: Option<&CancellationToken>) -> SyncResult<()> {
        let mut rx = self.shared.status.subscribe();
        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);

        tokio::select! {
            result = rx.wait_for(|status| status.step == SyncEngineStep::Synced) => {
                result.map(|_| ()).map_err(|_| SyncError::ManualStop)
            }
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            _ = self.shared.cancel.cancelled() => Err(SyncError::ManualStop),
        }
    }

    /// Stop every peer. Idempotent.
    pub fn stop(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        info!("Stopping sync engine");
        self.shared.cancel.cancel();
        self.shared.local.stop();
        for remote in self.shared.remotes.lock().iter() {
            remote.stop();
        }
        self.shared.refresh();
    }

    /// Stop and wait for every peer to tear down
    pub async fn shutdown(&self) {
        self.stop();
        let starter = self.starter.lock().take();
        if let Some(starter) = starter {
            let _ = starter.await;
        }

        let remotes: Vec<SyncPeer> = self.shared.remotes.lock().drain(..).collect();
        join_all(remotes.iter().map(|remote| remote.shutdown())).await;
        self.shared.local.shutdown().await;
        self.shared.subscriptions.lock().clear();
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Sync peer
//!
//! A [`SyncPeer`] keeps a tree of documents consistent with one storage
//! adapter. Construction spawns a retry loop; each iteration is one attempt:
//!
//! 1. Subscribe to storage. A disconnect cancels the attempt.
//! 2. Connect the root document: pull, apply, push back what storage lacks,
//!    then attach an update listener.
//! 3. Queue every sub-document for connection and keep listening for
//!    sub-documents being added or removed.
//! 4. Run the sub-document loader, pull applier and push sender until the
//!    attempt is cancelled or one of them fails.
//!
//! Everything an attempt owns lives in one [`Attempt`] value that is torn
//! down before the next attempt starts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::status::{PeerCounters, SyncStatus, SyncStep};
use crate::document::{is_empty_update, Doc, Origin, SubdocsEvent, UpdateEvent};
use crate::document_id::DocumentId;
use crate::error::{SyncError, SyncResult};
use crate::observer::{Observer, Subscription};
use crate::queue::AsyncQueue;
use crate::storage::{DisconnectCallback, PullResult, StorageAdapter, StorageResult, UpdateCallback};

/// Default pause between failed attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Peer tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Pause between a failed attempt and the next one
    pub retry_delay: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// An update waiting to be applied (pull side) or sent (push side)
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingUpdate {
    pub doc_id: DocumentId,
    pub data: Vec<u8>,
}

/// A sub-document waiting to be connected
#[derive(Debug, Clone)]
struct PendingSubdoc {
    parent: Doc,
    doc: Doc,
}

/// A document attached to this attempt's listeners
struct ConnectedDoc {
    doc: Doc,
    _on_update: Subscription,
    _on_subdocs: Subscription,
}

/// State shared between a peer handle, its task and its attempts
struct PeerShared {
    name: String,
    root: Doc,
    storage: Arc<dyn StorageAdapter>,
    config: PeerConfig,
    /// Cancelled by `stop()`; every attempt token is a child of it
    cancel: CancellationToken,
    status: watch::Sender<SyncStatus>,
    status_changed: Observer<SyncStatus>,
}

impl PeerShared {
    fn new(root: Doc, storage: Arc<dyn StorageAdapter>, config: PeerConfig) -> Self {
        let (status, _) = watch::channel(SyncStatus::initial());
        Self {
            name: storage.name().to_string(),
            root,
            storage,
            config,
            cancel: CancellationToken::new(),
            status,
            status_changed: Observer::new(),
        }
    }

    fn origin(&self) -> Origin {
        Origin::Peer(self.name.clone())
    }

    /// Publish a status if it differs from the current one
    fn publish(&self, next: SyncStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });

        if changed {
            debug!(peer = %self.name, status = %next, "Status changed");
            self.status_changed.emit(&next);
        }
    }
}

/// Handle to a running sync peer
///
/// Dropping the handle stops the peer.
pub struct SyncPeer {
    shared: Arc<PeerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncPeer {
    /// Start syncing `root` and its sub-documents with `storage`
    ///
    /// Must be called within a Tokio runtime. The storage name doubles as the
    /// origin tag of updates this peer applies, so peers sharing a document
    /// tree need distinct storage names.
    pub fn new(root: Doc, storage: Arc<dyn StorageAdapter>) -> Self {
        Self::with_config(root, storage, PeerConfig::default())
    }

    pub fn with_config(root: Doc, storage: Arc<dyn StorageAdapter>, config: PeerConfig) -> Self {
        let shared = Arc::new(PeerShared::new(root, storage, config));
        let task = tokio::spawn(retry_loop(shared.clone()));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn root(&self) -> &Doc {
        &self.shared.root
    }

    /// Current status snapshot
    pub fn status(&self) -> SyncStatus {
        *self.shared.status.borrow()
    }

    /// Watch status changes; intermediate values may be coalesced
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status.subscribe()
    }

    /// Be told about every status transition, synchronously
    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.shared.status_changed.subscribe(callback)
    }

    /// Stop syncing. Idempotent; the peer cannot be restarted.
    pub fn stop(&self) {
        if !self.shared.cancel.is_cancelled() {
            info!(peer = %self.shared.name, "Stopping sync peer");
            self.shared.cancel.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Stop and wait until the current attempt has been torn down
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(peer = %self.shared.name, error = %e, "Sync task panicked");
            }
        }
    }

    /// Wait until every queued update has been exchanged
    ///
    /// Fails with [`SyncError::Cancelled`] if `cancel` fires first and with
    /// [`SyncError::ManualStop`] if the peer is stopped first.
    pub async fn wait_for_synced(&self, cancel: Option<&CancellationToken>) -> SyncResult<()> {
        self.wait_for(SyncStep::Synced, cancel).await
    }

    /// Wait until every known document has been connected
    pub async fn wait_for_loaded(&self, cancel: Option<&CancellationToken>) -> SyncResult<()> {
        self.wait_for(SyncStep::Loaded, cancel).await
    }

    async fn wait_for(&self, step: SyncStep, cancel: Option<&CancellationToken>) -> SyncResult<()> {
        if self.status().reached(step) {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let _subscription = self.on_status_change(move |status| {
            if status.reached(step) {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
            }
        });

        // A transition may have landed between the first check and subscribing
        if self.status().reached(step) {
            return Ok(());
        }

        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);
        tokio::select! {
            _ = rx => Ok(()),
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            _ = self.shared.cancel.cancelled() => Err(SyncError::ManualStop),
        }
    }
}

impl Drop for SyncPeer {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Run attempts until the peer is stopped
async fn retry_loop(shared: Arc<PeerShared>) {
    info!(peer = %shared.name, root = %shared.root.guid(), "Sync peer started");

    while !shared.cancel.is_cancelled() {
        let attempt = Arc::new(Attempt::new(shared.clone()));
        let result = attempt.run().await;
        attempt.teardown();

        match result {
            Err(SyncError::ManualStop) => break,
            Err(e) if e.is_transient() => {
                warn!(peer = %shared.name, error = %e, "Sync attempt ended")
            }
            Err(e) => error!(peer = %shared.name, error = %e, "Sync attempt failed"),
            Ok(()) => {}
        }

        shared.publish(SyncStatus::retrying());
        info!(
            peer = %shared.name,
            delay_secs = shared.config.retry_delay.as_secs_f32(),
            "Retrying sync"
        );

        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(shared.config.retry_delay) => {}
        }
    }

    shared.publish(SyncStatus::stopped());
    info!(peer = %shared.name, "Sync peer stopped");
}

/// Everything one sync attempt owns
struct Attempt {
    peer: Arc<PeerShared>,
    cancel: CancellationToken,
    disconnect_reason: Mutex<Option<String>>,
    storage_subscription: Mutex<Option<Subscription>>,
    connected: Mutex<HashMap<DocumentId, ConnectedDoc>>,
    subdoc_queue: AsyncQueue<PendingSubdoc>,
    pull_queue: AsyncQueue<PendingUpdate>,
    push_queue: AsyncQueue<PendingUpdate>,
    subdoc_loading: AtomicBool,
    pushing: AtomicBool,
}

impl Attempt {
    fn new(peer: Arc<PeerShared>) -> Self {
        let cancel = peer.cancel.child_token();
        Self {
            peer,
            cancel,
            disconnect_reason: Mutex::new(None),
            storage_subscription: Mutex::new(None),
            connected: Mutex::new(HashMap::new()),
            subdoc_queue: AsyncQueue::new(),
            pull_queue: AsyncQueue::new(),
            push_queue: AsyncQueue::new(),
            subdoc_loading: AtomicBool::new(false),
            pushing: AtomicBool::new(false),
        }
    }

    /// Run until cancelled or failed, translating cancellation into its cause
    async fn run(self: &Arc<Self>) -> SyncResult<()> {
        match self.sync().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.cause(e)),
        }
    }

    async fn sync(self: &Arc<Self>) -> SyncResult<()> {
        let subscription = self.subscribe_storage().await?;
        *self.storage_subscription.lock() = Some(subscription);

        self.connect(self.peer.root.clone(), None).await?;

        tokio::try_join!(self.subdoc_loop(), self.pull_loop(), self.push_loop())?;
        Ok(())
    }

    fn cause(&self, error: SyncError) -> SyncError {
        if self.peer.cancel.is_cancelled() {
            return SyncError::ManualStop;
        }
        if let Some(reason) = self.disconnect_reason.lock().clone() {
            return SyncError::ConnectionLost(reason);
        }
        error
    }

    /// Await a storage call unless the attempt is cancelled first
    async fn guarded<T, F>(&self, call: F) -> SyncResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            result = call => Ok(result?),
        }
    }

    async fn subscribe_storage(self: &Arc<Self>) -> SyncResult<Subscription> {
        let weak = Arc::downgrade(self);
        let on_update: UpdateCallback = Arc::new(move |doc_id, data| {
            if let Some(attempt) = weak.upgrade() {
                attempt.pull_queue.push(PendingUpdate { doc_id, data });
                attempt.report();
            }
        });

        let weak = Arc::downgrade(self);
        let on_disconnect: DisconnectCallback = Arc::new(move |reason| {
            if let Some(attempt) = weak.upgrade() {
                attempt.disconnected(reason);
            }
        });

        self.guarded(self.peer.storage.subscribe(on_update, on_disconnect))
            .await
    }

    fn disconnected(&self, reason: String) {
        warn!(peer = %self.peer.name, reason = %reason, "Storage disconnected");
        *self.disconnect_reason.lock() = Some(reason);
        self.cancel.cancel();
        self.peer.publish(SyncStatus::retrying());
    }

    // ==================== Connecting documents ====================

    /// Bring one document in sync with storage and start tracking it
    ///
    /// `parent` is set for sub-documents; one that left its parent while its
    /// pull was in flight is dropped instead of connected.
    async fn connect(self: &Arc<Self>, doc: Doc, parent: Option<Doc>) -> SyncResult<()> {
        let guid = doc.guid();
        if self.is_connected(&guid) {
            return Ok(());
        }

        let state = doc.encode_state_vector();
        let pulled = self.guarded(self.peer.storage.pull(&guid, &state)).await?;

        if let Some(parent) = &parent {
            if !parent.has_subdoc(&guid) || !self.is_connected(&parent.guid()) {
                debug!(peer = %self.peer.name, doc = %guid, "Sub-document removed while loading");
                return Ok(());
            }
        }

        let baseline = match pulled {
            Some(PullResult { data, state }) => {
                doc.apply_update(&data, Origin::Load)?;
                Some(state)
            }
            None => None,
        };
        self.push_queue.push(PendingUpdate {
            doc_id: guid,
            data: doc.encode_state_as_update(baseline.as_ref()),
        });

        let on_update = self.listen_for_updates(&doc);
        let on_subdocs = self.listen_for_subdocs(&doc);
        self.connected.lock().insert(
            guid,
            ConnectedDoc {
                doc: doc.clone(),
                _on_update: on_update,
                _on_subdocs: on_subdocs,
            },
        );
        doc.mark_synced();

        let pending: Vec<PendingSubdoc> = doc
            .subdocs()
            .into_iter()
            .map(|child| PendingSubdoc {
                parent: doc.clone(),
                doc: child,
            })
            .collect();
        self.subdoc_queue.extend(pending);

        debug!(peer = %self.peer.name, doc = %guid, "Connected document");
        self.report();
        Ok(())
    }

    fn listen_for_updates(self: &Arc<Self>, doc: &Doc) -> Subscription {
        let weak: Weak<Self> = Arc::downgrade(self);
        let own_origin = self.peer.origin();
        doc.on_update(move |event: &UpdateEvent| {
            if event.origin == own_origin {
                return;
            }
            if let Some(attempt) = weak.upgrade() {
                attempt.push_queue.push(PendingUpdate {
                    doc_id: event.doc.guid(),
                    data: event.data.clone(),
                });
                attempt.report();
            }
        })
    }

    fn listen_for_subdocs(self: &Arc<Self>, doc: &Doc) -> Subscription {
        let weak: Weak<Self> = Arc::downgrade(self);
        doc.on_subdocs(move |event: &SubdocsEvent| {
            if let Some(attempt) = weak.upgrade() {
                attempt.subdocs_changed(event);
            }
        })
    }

    fn subdocs_changed(&self, event: &SubdocsEvent) {
        for removed in &event.removed {
            self.detach(&removed.guid());
        }
        self.subdoc_queue
            .extend(event.added.iter().map(|child| PendingSubdoc {
                parent: event.parent.clone(),
                doc: child.clone(),
            }));
        self.report();
    }

    /// Stop tracking a document and everything below it
    fn detach(&self, guid: &DocumentId) {
        let purged = self.subdoc_queue.remove(|pending| pending.doc.guid() == *guid);
        let entry = self.connected.lock().remove(guid);

        if let Some(entry) = entry {
            debug!(peer = %self.peer.name, doc = %guid, "Detached document");
            let children = entry.doc.subdocs();
            drop(entry);
            for child in children {
                self.detach(&child.guid());
            }
        } else if purged > 0 {
            debug!(peer = %self.peer.name, doc = %guid, "Dropped queued sub-document");
        }
    }

    fn is_connected(&self, guid: &DocumentId) -> bool {
        self.connected.lock().contains_key(guid)
    }

    /// Handle for a document in the tree, connected or still loading
    fn find_doc(&self, guid: &DocumentId) -> Option<Doc> {
        if *guid == self.peer.root.guid() {
            return Some(self.peer.root.clone());
        }
        let connected = self.connected.lock();
        if let Some(entry) = connected.get(guid) {
            return Some(entry.doc.clone());
        }
        connected.values().find_map(|entry| entry.doc.subdoc(guid))
    }

    // ==================== Loops ====================

    async fn subdoc_loop(self: &Arc<Self>) -> SyncResult<()> {
        loop {
            let pending = self.subdoc_queue.next(&self.cancel).await?;
            self.subdoc_loading.store(true, Ordering::SeqCst);
            self.report();

            let result = self.connect(pending.doc, Some(pending.parent)).await;

            self.subdoc_loading.store(false, Ordering::SeqCst);
            self.report();
            result?;
        }
    }

    async fn pull_loop(&self) -> SyncResult<()> {
        loop {
            let update = self.pull_queue.next(&self.cancel).await?;
            if !is_empty_update(&update.data) {
                match self.find_doc(&update.doc_id) {
                    Some(doc) => doc.apply_update(&update.data, self.peer.origin())?,
                    None => {
                        debug!(peer = %self.peer.name, doc = %update.doc_id, "Ignoring update for unknown document")
                    }
                }
            }
            self.report();
        }
    }

    async fn push_loop(&self) -> SyncResult<()> {
        loop {
            let update = self.push_queue.next(&self.cancel).await?;
            if is_empty_update(&update.data) {
                self.report();
                continue;
            }

            self.pushing.store(true, Ordering::SeqCst);
            self.report();

            let result = self
                .guarded(self.peer.storage.push(&update.doc_id, &update.data))
                .await;

            self.pushing.store(false, Ordering::SeqCst);
            self.report();
            result?;
        }
    }

    // ==================== Status ====================

    fn counters(&self) -> PeerCounters {
        PeerCounters {
            connected_docs: self.connected.lock().len(),
            subdoc_queue: self.subdoc_queue.len(),
            pull_queue: self.pull_queue.len(),
            push_queue: self.push_queue.len(),
            subdoc_loading: self.subdoc_loading.load(Ordering::SeqCst),
            pushing: self.pushing.load(Ordering::SeqCst),
        }
    }

    /// Recompute and publish status; a cancelled attempt reports nothing
    fn report(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.peer.publish(SyncStatus::derive(&self.counters()));
    }

    /// Release listeners, queues and flags
    fn teardown(&self) {
        self.cancel.cancel();

        let subscription = self.storage_subscription.lock().take();
        drop(subscription);

        let connected: Vec<ConnectedDoc> =
            self.connected.lock().drain().map(|(_, entry)| entry).collect();
        drop(connected);

        self.subdoc_queue.clear();
        self.pull_queue.clear();
        self.push_queue.clear();
        self.subdoc_loading.store(false, Ordering::SeqCst);
        self.pushing.store(false, Ordering::SeqCst);
    }
}

//! In-memory storage backend
//!
//! One [`MemoryStorage`] plays the role of a shared server: it keeps one
//! Automerge document per id and hands out [`MemoryStorageClient`] adapters.
//! A push from one client is merged and broadcast to every other subscribed
//! client. Connection loss and outages can be simulated, which makes this the
//! backend for peer tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use automerge::AutoCommit;
use parking_lot::Mutex;
use tracing::debug;

use super::adapter::{DisconnectCallback, PullResult, StorageAdapter, UpdateCallback};
use super::error::{StorageError, StorageResult};
use crate::document::StateVector;
use crate::document_id::DocumentId;
use crate::observer::Subscription;

struct Subscriber {
    id: u64,
    client_id: u64,
    on_update: UpdateCallback,
    on_disconnect: DisconnectCallback,
}

#[derive(Default)]
struct Shared {
    docs: Mutex<HashMap<DocumentId, AutoCommit>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    offline: AtomicBool,
}

/// Shared in-memory backend
#[derive(Clone, Default)]
pub struct MemoryStorage {
    shared: Arc<Shared>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client adapter for one peer
    pub fn client(&self, name: &str) -> MemoryStorageClient {
        MemoryStorageClient {
            name: name.to_string(),
            client_id: self.shared.next_id.fetch_add(1, Ordering::SeqCst),
            storage: self.clone(),
            pulls: AtomicUsize::new(0),
            pushes: AtomicUsize::new(0),
        }
    }

    /// Make every operation fail with [`StorageError::Offline`]
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::SeqCst);
    }

    /// Drop every subscription, invoking its disconnect callback
    pub fn disconnect_all(&self, reason: &str) {
        let dropped: Vec<Subscriber> = self.shared.subscribers.lock().drain(..).collect();
        debug!(count = dropped.len(), reason, "Disconnecting memory storage subscribers");
        for subscriber in dropped {
            (subscriber.on_disconnect)(reason.to_string());
        }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }

    pub fn contains(&self, doc_id: &DocumentId) -> bool {
        self.shared.docs.lock().contains_key(doc_id)
    }

    /// Full state of a stored document
    pub fn snapshot(&self, doc_id: &DocumentId) -> Option<Vec<u8>> {
        self.shared
            .docs
            .lock()
            .get_mut(doc_id)
            .map(|doc| doc.save_after(&[]))
    }

    /// Write an update as an outside client would; every subscriber is told
    pub fn write(&self, doc_id: &DocumentId, data: &[u8]) -> StorageResult<()> {
        self.merge(doc_id, data, None)
    }

    fn check_online(&self) -> StorageResult<()> {
        if self.shared.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Offline);
        }
        Ok(())
    }

    fn merge(&self, doc_id: &DocumentId, data: &[u8], from: Option<u64>) -> StorageResult<()> {
        let changed = {
            let mut docs = self.shared.docs.lock();
            let doc = docs.entry(*doc_id).or_insert_with(AutoCommit::new);
            let before = doc.get_heads();
            doc.load_incremental(data)?;
            doc.get_heads() != before
        };

        if changed {
            let targets: Vec<UpdateCallback> = self
                .shared
                .subscribers
                .lock()
                .iter()
                .filter(|s| Some(s.client_id) != from)
                .map(|s| s.on_update.clone())
                .collect();
            for on_update in targets {
                on_update(*doc_id, data.to_vec());
            }
        }
        Ok(())
    }
}

/// One peer's connection to a [`MemoryStorage`]
pub struct MemoryStorageClient {
    name: String,
    client_id: u64,
    storage: MemoryStorage,
    pulls: AtomicUsize,
    pushes: AtomicUsize,
}

impl MemoryStorageClient {
    /// Pulls served so far
    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// Pushes received so far
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorageClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pull(
        &self,
        doc_id: &DocumentId,
        state: &StateVector,
    ) -> StorageResult<Option<PullResult>> {
        self.storage.check_online()?;
        self.pulls.fetch_add(1, Ordering::SeqCst);

        let mut docs = self.storage.shared.docs.lock();
        Ok(docs.get_mut(doc_id).map(|doc| PullResult {
            data: doc.save_after(state.heads()),
            state: StateVector::new(doc.get_heads()),
        }))
    }

    async fn push(&self, doc_id: &DocumentId, data: &[u8]) -> StorageResult<()> {
        self.storage.check_online()?;
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.storage.merge(doc_id, data, Some(self.client_id))
    }

    async fn subscribe(
        &self,
        on_update: UpdateCallback,
        on_disconnect: DisconnectCallback,
    ) -> StorageResult<Subscription> {
        self.storage.check_online()?;

        let id = self.storage.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.storage.shared.subscribers.lock().push(Subscriber {
            id,
            client_id: self.client_id,
            on_update,
            on_disconnect,
        });

        let shared = Arc::downgrade(&self.storage.shared);
        Ok(Subscription::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.subscribers.lock().retain(|s| s.id != id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Doc, Origin};
    use automerge::{transaction::Transactable, ROOT};

    fn doc_with(key: &str, value: &str) -> Doc {
        let doc = Doc::new();
        doc.change(|d| d.put(ROOT, key, value)).unwrap();
        doc
    }

    #[tokio::test]
    async fn test_pull_unknown_document() {
        let storage = MemoryStorage::new();
        let client = storage.client("a");

        let result = client
            .pull(&DocumentId::new(), &StateVector::default())
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(client.pull_count(), 1);
    }

    #[tokio::test]
    async fn test_push_then_pull_delta() {
        let storage = MemoryStorage::new();
        let client = storage.client("a");
        let doc = doc_with("k", "v");

        client
            .push(&doc.guid(), &doc.encode_state_as_update(None))
            .await
            .unwrap();

        let fresh = client
            .pull(&doc.guid(), &StateVector::default())
            .await
            .unwrap()
            .unwrap();
        assert!(!fresh.data.is_empty());
        assert_eq!(fresh.state, doc.encode_state_vector());

        let current = client
            .pull(&doc.guid(), &doc.encode_state_vector())
            .await
            .unwrap()
            .unwrap();
        assert!(current.data.is_empty());
    }

    #[tokio::test]
    async fn test_push_broadcasts_to_other_clients_only() {
        let storage = MemoryStorage::new();
        let a = storage.client("a");
        let b = storage.client("b");

        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let sa = seen_a.clone();
        let sb = seen_b.clone();
        let _sub_a = a
            .subscribe(
                Arc::new(move |id, _| sa.lock().push(id)),
                Arc::new(|_| {}),
            )
            .await
            .unwrap();
        let _sub_b = b
            .subscribe(
                Arc::new(move |id, _| sb.lock().push(id)),
                Arc::new(|_| {}),
            )
            .await
            .unwrap();

        let doc = doc_with("k", "v");
        a.push(&doc.guid(), &doc.encode_state_as_update(None))
            .await
            .unwrap();

        assert!(seen_a.lock().is_empty());
        assert_eq!(*seen_b.lock(), vec![doc.guid()]);
    }

    #[tokio::test]
    async fn test_duplicate_push_is_not_broadcast() {
        let storage = MemoryStorage::new();
        let a = storage.client("a");
        let b = storage.client("b");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = b
            .subscribe(
                Arc::new(move |_, _| {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
                Arc::new(|_| {}),
            )
            .await
            .unwrap();

        let doc = doc_with("k", "v");
        let update = doc.encode_state_as_update(None);
        a.push(&doc.guid(), &update).await.unwrap();
        a.push(&doc.guid(), &update).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(a.push_count(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let storage = MemoryStorage::new();
        let client = storage.client("a");
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let r = reasons.clone();
        let _sub = client
            .subscribe(Arc::new(|_, _| {}), Arc::new(move |why| r.lock().push(why)))
            .await
            .unwrap();
        assert_eq!(storage.subscriber_count(), 1);

        storage.disconnect_all("server restart");

        assert_eq!(*reasons.lock(), vec!["server restart".to_string()]);
        assert_eq!(storage.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_offline() {
        let storage = MemoryStorage::new();
        let client = storage.client("a");
        storage.set_offline(true);

        let result = client.pull(&DocumentId::new(), &StateVector::default()).await;
        assert!(matches!(result, Err(StorageError::Offline)));
        let result = client.subscribe(Arc::new(|_, _| {}), Arc::new(|_| {})).await;
        assert!(matches!(result, Err(StorageError::Offline)));

        storage.set_offline(false);
        assert!(client
            .pull(&DocumentId::new(), &StateVector::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let storage = MemoryStorage::new();
        let client = storage.client("a");
        let sub = client
            .subscribe(Arc::new(|_, _| {}), Arc::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(storage.subscriber_count(), 1);
        drop(sub);
        assert_eq!(storage.subscriber_count(), 0);
    }

    #[test]
    fn test_outside_write_reaches_snapshot() {
        let storage = MemoryStorage::new();
        let doc = doc_with("k", "v");
        storage
            .write(&doc.guid(), &doc.encode_state_as_update(None))
            .unwrap();

        assert!(storage.contains(&doc.guid()));
        let replica = Doc::with_guid(doc.guid());
        replica
            .apply_update(&storage.snapshot(&doc.guid()).unwrap(), Origin::Load)
            .unwrap();
        assert_eq!(replica.encode_state_vector(), doc.encode_state_vector());
    }
}

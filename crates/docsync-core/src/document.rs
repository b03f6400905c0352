//! Automerge-backed document tree
//!
//! A [`Doc`] is a shared handle to one Automerge document plus the set of
//! sub-documents nested under it. Sub-document membership is stored in the
//! document itself (one `subdoc:<guid>` root key per child), so it replicates
//! and merges like any other field. Handles for children discovered through a
//! remote update are created on demand.
//!
//! Every change that alters the document state is reported to update
//! listeners together with its [`Origin`], which is how a sync peer tells its
//! own writes apart from the ones it must forward.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use automerge::{
    transaction::Transactable, AutoCommit, AutomergeError, ChangeHash, ReadDoc, ROOT,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;

use crate::document_id::DocumentId;
use crate::observer::{Observer, Subscription};

/// Errors that can occur during document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] AutomergeError),

    #[error("Invalid state vector: {0} bytes is not a multiple of 32")]
    InvalidStateVector(usize),
}

/// Root key prefix marking sub-document membership
pub const SUBDOC_PREFIX: &str = "subdoc:";

/// Canonical two-byte empty update
pub const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// Whether an update carries nothing worth applying or sending
pub fn is_empty_update(data: &[u8]) -> bool {
    data.is_empty() || data == EMPTY_UPDATE
}

/// Source of a document mutation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Edit made by the application
    Local,
    /// State loaded during a peer's initial pull
    Load,
    /// Update applied by the named sync peer
    Peer(String),
}

/// Compact summary of what a document has seen: its current heads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateVector(Vec<ChangeHash>);

impl StateVector {
    pub fn new(mut heads: Vec<ChangeHash>) -> Self {
        heads.sort();
        Self(heads)
    }

    pub fn heads(&self) -> &[ChangeHash] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Concatenated 32-byte hashes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|h| h.0).collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DocumentError> {
        if bytes.len() % 32 != 0 {
            return Err(DocumentError::InvalidStateVector(bytes.len()));
        }

        let heads = bytes
            .chunks_exact(32)
            .map(|chunk| {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(chunk);
                ChangeHash(hash)
            })
            .collect();

        Ok(Self::new(heads))
    }
}

/// Emitted after a change to a document's state
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub doc: Doc,
    pub data: Vec<u8>,
    pub origin: Origin,
}

/// Emitted when a document's sub-document set changes
#[derive(Debug, Clone)]
pub struct SubdocsEvent {
    pub parent: Doc,
    pub added: Vec<Doc>,
    pub removed: Vec<Doc>,
}

#[derive(Default)]
struct Tree {
    /// Current membership
    members: BTreeSet<DocumentId>,
    /// Every handle this document has handed out, so re-adding a child
    /// yields the same handle
    handles: HashMap<DocumentId, Doc>,
}

struct DocInner {
    guid: DocumentId,
    state: Mutex<AutoCommit>,
    tree: Mutex<Tree>,
    on_update: Observer<UpdateEvent>,
    on_subdocs: Observer<SubdocsEvent>,
    synced: watch::Sender<bool>,
}

/// Shared handle to a CRDT document
///
/// Cloning is cheap; clones refer to the same document. Equality is handle
/// identity.
#[derive(Clone)]
pub struct Doc {
    inner: Arc<DocInner>,
}

impl Doc {
    /// Create a new empty document with a random ID
    pub fn new() -> Self {
        Self::with_guid(DocumentId::new())
    }

    /// Create a new empty document with a specific ID
    pub fn with_guid(guid: DocumentId) -> Self {
        Self::from_automerge(guid, AutoCommit::new())
    }

    /// Load a document from a full save or concatenated updates
    pub fn load(guid: DocumentId, bytes: &[u8]) -> Result<Self, DocumentError> {
        let doc = Self::from_automerge(guid, AutoCommit::load(bytes)?);
        // Nobody can be listening yet, so the event is discarded
        let _ = doc.reconcile_subdocs(&doc.inner.state.lock());
        Ok(doc)
    }

    fn from_automerge(guid: DocumentId, state: AutoCommit) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            inner: Arc::new(DocInner {
                guid,
                state: Mutex::new(state),
                tree: Mutex::new(Tree::default()),
                on_update: Observer::new(),
                on_subdocs: Observer::new(),
                synced,
            }),
        }
    }

    pub fn guid(&self) -> DocumentId {
        self.inner.guid
    }

    /// Apply a local edit
    pub fn change<F, R>(&self, f: F) -> Result<R, DocumentError>
    where
        F: FnOnce(&mut AutoCommit) -> Result<R, AutomergeError>,
    {
        self.change_with_origin(Origin::Local, f)
    }

    /// Apply an edit tagged with `origin`
    ///
    /// If `f` fails, its partial operations are rolled back.
    pub fn change_with_origin<F, R>(&self, origin: Origin, f: F) -> Result<R, DocumentError>
    where
        F: FnOnce(&mut AutoCommit) -> Result<R, AutomergeError>,
    {
        let (result, update, subdocs) = {
            let mut state = self.inner.state.lock();
            let before = state.get_heads();
            match f(&mut *state) {
                Ok(result) => {
                    let update = state.save_after(&before);
                    let subdocs = if update.is_empty() {
                        None
                    } else {
                        self.reconcile_subdocs(&state)
                    };
                    (result, update, subdocs)
                }
                Err(e) => {
                    state.rollback();
                    return Err(e.into());
                }
            }
        };

        if !update.is_empty() {
            self.after_update(update, origin, subdocs);
        }
        Ok(result)
    }

    /// Read the document state
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&AutoCommit) -> R,
    {
        f(&*self.inner.state.lock())
    }

    /// Merge an update
    ///
    /// Applying an update that is already known is a no-op and notifies
    /// nobody.
    pub fn apply_update(&self, data: &[u8], origin: Origin) -> Result<(), DocumentError> {
        if is_empty_update(data) {
            return Ok(());
        }

        let (changed, subdocs) = {
            let mut state = self.inner.state.lock();
            let before = state.get_heads();
            state.load_incremental(data)?;
            if state.get_heads() == before {
                (false, None)
            } else {
                (true, self.reconcile_subdocs(&state))
            }
        };

        if changed {
            self.after_update(data.to_vec(), origin, subdocs);
        }
        Ok(())
    }

    pub fn encode_state_vector(&self) -> StateVector {
        StateVector::new(self.inner.state.lock().get_heads())
    }

    /// Encode everything not covered by `since` (the full state for `None`)
    pub fn encode_state_as_update(&self, since: Option<&StateVector>) -> Vec<u8> {
        let heads = since.map(StateVector::heads).unwrap_or_default();
        self.inner.state.lock().save_after(heads)
    }

    /// Compact full save
    pub fn save(&self) -> Vec<u8> {
        self.inner.state.lock().save()
    }

    // ==================== Listeners ====================

    pub fn on_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        self.inner.on_update.subscribe(callback)
    }

    pub fn on_subdocs<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SubdocsEvent) + Send + Sync + 'static,
    {
        self.inner.on_subdocs.subscribe(callback)
    }

    /// Number of attached update listeners
    pub fn update_listener_count(&self) -> usize {
        self.inner.on_update.len()
    }

    // ==================== Sync signal ====================

    /// Mark the document as having completed its initial sync
    pub fn mark_synced(&self) {
        self.inner.synced.send_replace(true);
    }

    pub fn is_synced(&self) -> bool {
        *self.inner.synced.borrow()
    }

    /// Wait until [`Doc::mark_synced`] has been called
    pub async fn wait_synced(&self) {
        let mut rx = self.inner.synced.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|synced| *synced).await;
    }

    // ==================== Sub-documents ====================

    /// Current sub-documents, ordered by guid
    pub fn subdocs(&self) -> Vec<Doc> {
        let tree = self.inner.tree.lock();
        tree.members
            .iter()
            .filter_map(|id| tree.handles.get(id).cloned())
            .collect()
    }

    pub fn subdoc(&self, guid: &DocumentId) -> Option<Doc> {
        let tree = self.inner.tree.lock();
        if tree.members.contains(guid) {
            tree.handles.get(guid).cloned()
        } else {
            None
        }
    }

    pub fn has_subdoc(&self, guid: &DocumentId) -> bool {
        self.inner.tree.lock().members.contains(guid)
    }

    /// Create a new empty document and nest it under this one
    pub fn create_subdoc(&self) -> Result<Doc, DocumentError> {
        let child = Doc::new();
        self.add_subdoc(&child)?;
        Ok(child)
    }

    /// Nest an existing document under this one
    pub fn add_subdoc(&self, child: &Doc) -> Result<(), DocumentError> {
        self.inner
            .tree
            .lock()
            .handles
            .entry(child.guid())
            .or_insert_with(|| child.clone());

        let key = subdoc_key(&child.guid());
        self.change(|doc| doc.put(ROOT, key, true))
    }

    pub fn remove_subdoc(&self, guid: &DocumentId) -> Result<(), DocumentError> {
        if !self.has_subdoc(guid) {
            return Ok(());
        }
        let key = subdoc_key(guid);
        self.change(|doc| doc.delete(ROOT, key))
    }

    // ==================== Private helpers ====================

    fn after_update(&self, data: Vec<u8>, origin: Origin, subdocs: Option<SubdocsEvent>) {
        self.inner.on_update.emit(&UpdateEvent {
            doc: self.clone(),
            data,
            origin,
        });
        if let Some(event) = subdocs {
            self.inner.on_subdocs.emit(&event);
        }
    }

    /// Reconcile tracked membership with the `subdoc:` keys of `state`
    ///
    /// Must be called with the state lock held, so concurrent updates
    /// reconcile in the order they were applied.
    fn reconcile_subdocs(&self, state: &AutoCommit) -> Option<SubdocsEvent> {
        let keys: BTreeSet<DocumentId> = state
            .keys(ROOT)
            .filter_map(|key| key.strip_prefix(SUBDOC_PREFIX)?.parse().ok())
            .collect();

        let mut tree = self.inner.tree.lock();
        let added_ids: Vec<DocumentId> = keys.difference(&tree.members).copied().collect();
        let removed_ids: Vec<DocumentId> = tree.members.difference(&keys).copied().collect();
        if added_ids.is_empty() && removed_ids.is_empty() {
            return None;
        }

        let added: Vec<Doc> = added_ids
            .into_iter()
            .map(|id| {
                tree.handles
                    .entry(id)
                    .or_insert_with(|| Doc::with_guid(id))
                    .clone()
            })
            .collect();
        let removed: Vec<Doc> = removed_ids
            .iter()
            .filter_map(|id| tree.handles.get(id).cloned())
            .collect();

        tree.members = keys;
        Some(SubdocsEvent {
            parent: self.clone(),
            added,
            removed,
        })
    }
}

fn subdoc_key(guid: &DocumentId) -> String {
    format!("{}{}", SUBDOC_PREFIX, guid)
}

impl Default for Doc {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Doc {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Doc {}

impl fmt::Debug for Doc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Doc").field("guid", &self.inner.guid).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn get_str(doc: &Doc, key: &str) -> Option<String> {
        doc.read(|d| {
            d.get(ROOT, key)
                .ok()
                .flatten()
                .and_then(|(v, _)| v.to_str().map(|s| s.to_string()))
        })
    }

    fn put(doc: &Doc, key: &str, value: &str) {
        doc.change(|d| d.put(ROOT, key, value)).unwrap();
    }

    #[test]
    fn test_apply_update_is_idempotent() {
        let a = Doc::new();
        put(&a, "title", "hello");
        let update = a.encode_state_as_update(None);

        let b = Doc::with_guid(a.guid());
        b.apply_update(&update, Origin::Load).unwrap();
        let once = b.encode_state_vector();
        b.apply_update(&update, Origin::Load).unwrap();

        assert_eq!(b.encode_state_vector(), once);
        assert_eq!(get_str(&b, "title").as_deref(), Some("hello"));
    }

    #[test]
    fn test_duplicate_apply_does_not_notify() {
        let a = Doc::new();
        put(&a, "k", "v");
        let update = a.encode_state_as_update(None);

        let b = Doc::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let _sub = b.on_update(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        b.apply_update(&update, Origin::Load).unwrap();
        b.apply_update(&update, Origin::Load).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_updates_commute() {
        let a = Doc::new();
        put(&a, "x", "from-a");
        let b = Doc::new();
        put(&b, "y", "from-b");
        let ua = a.encode_state_as_update(None);
        let ub = b.encode_state_as_update(None);

        let left = Doc::new();
        left.apply_update(&ua, Origin::Load).unwrap();
        left.apply_update(&ub, Origin::Load).unwrap();
        let right = Doc::new();
        right.apply_update(&ub, Origin::Load).unwrap();
        right.apply_update(&ua, Origin::Load).unwrap();

        assert_eq!(left.encode_state_vector(), right.encode_state_vector());
        assert_eq!(get_str(&left, "y"), get_str(&right, "y"));
    }

    #[test]
    fn test_delta_since_state_vector() {
        let doc = Doc::new();
        put(&doc, "a", "1");
        let sv = doc.encode_state_vector();
        put(&doc, "b", "2");

        let delta = doc.encode_state_as_update(Some(&sv));
        assert!(!delta.is_empty());

        let replica = Doc::new();
        replica
            .apply_update(&doc.encode_state_as_update(None), Origin::Load)
            .unwrap();
        assert!(replica
            .encode_state_as_update(Some(&replica.encode_state_vector()))
            .is_empty());
    }

    #[test]
    fn test_listener_sees_origin() {
        let doc = Doc::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = doc.on_update(move |event| s.lock().push(event.origin.clone()));

        put(&doc, "k", "v");
        let other = Doc::new();
        put(&other, "j", "w");
        doc.apply_update(
            &other.encode_state_as_update(None),
            Origin::Peer("storage".into()),
        )
        .unwrap();

        assert_eq!(
            *seen.lock(),
            vec![Origin::Local, Origin::Peer("storage".into())]
        );
    }

    #[test]
    fn test_empty_updates_are_ignored() {
        let doc = Doc::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let _sub = doc.on_update(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        doc.apply_update(&[], Origin::Load).unwrap();
        doc.apply_update(&EMPTY_UPDATE, Origin::Load).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(is_empty_update(&[0, 0]));
        assert!(!is_empty_update(&[0, 1]));
    }

    #[test]
    fn test_failed_change_rolls_back() {
        let doc = Doc::new();
        let before = doc.encode_state_vector();
        let result: Result<(), DocumentError> = doc.change(|d| {
            d.put(ROOT, "partial", "yes")?;
            Err(AutomergeError::Fail)
        });

        assert!(result.is_err());
        assert_eq!(doc.encode_state_vector(), before);
        assert!(get_str(&doc, "partial").is_none());
    }

    #[test]
    fn test_state_vector_bytes() {
        let doc = Doc::new();
        put(&doc, "a", "1");
        let sv = doc.encode_state_vector();
        assert_eq!(StateVector::from_bytes(&sv.to_bytes()).unwrap(), sv);
        assert!(matches!(
            StateVector::from_bytes(&[1, 2, 3]),
            Err(DocumentError::InvalidStateVector(3))
        ));
    }

    #[test]
    fn test_add_and_remove_subdocs_emit_events() {
        let root = Doc::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        let _sub = root.on_subdocs(move |event| {
            e.lock().push((event.added.len(), event.removed.len()));
        });

        let child = root.create_subdoc().unwrap();
        assert!(root.has_subdoc(&child.guid()));
        assert_eq!(root.subdoc(&child.guid()), Some(child.clone()));

        root.remove_subdoc(&child.guid()).unwrap();
        assert!(!root.has_subdoc(&child.guid()));
        assert_eq!(*events.lock(), vec![(1, 0), (0, 1)]);
    }

    #[test]
    fn test_subdocs_replicate_through_updates() {
        let root = Doc::new();
        let child = root.create_subdoc().unwrap();

        let replica = Doc::with_guid(root.guid());
        let added = Arc::new(Mutex::new(Vec::new()));
        let a = added.clone();
        let _sub = replica.on_subdocs(move |event| {
            a.lock().extend(event.added.iter().map(Doc::guid));
        });

        replica
            .apply_update(&root.encode_state_as_update(None), Origin::Load)
            .unwrap();

        assert_eq!(*added.lock(), vec![child.guid()]);
        assert_eq!(replica.subdocs().len(), 1);
    }

    #[test]
    fn test_save_and_load_keeps_subdocs() {
        let root = Doc::new();
        let child = root.create_subdoc().unwrap();
        put(&root, "name", "workspace");

        let loaded = Doc::load(root.guid(), &root.save()).unwrap();
        assert_eq!(loaded.guid(), root.guid());
        assert!(loaded.has_subdoc(&child.guid()));
        assert_eq!(get_str(&loaded, "name").as_deref(), Some("workspace"));
    }

    #[test]
    fn test_concurrent_subdoc_updates_keep_membership() {
        const WRITERS: usize = 8;

        for _ in 0..50 {
            let root = Doc::new();
            let announced = Arc::new(AtomicUsize::new(0));
            let _sub = root.on_subdocs({
                let announced = Arc::clone(&announced);
                move |event| {
                    announced.fetch_add(event.added.len(), Ordering::SeqCst);
                }
            });

            let updates: Vec<Vec<u8>> = (0..WRITERS)
                .map(|_| {
                    let remote = Doc::with_guid(root.guid());
                    remote.create_subdoc().unwrap();
                    remote.encode_state_as_update(None)
                })
                .collect();

            let barrier = std::sync::Barrier::new(WRITERS);
            std::thread::scope(|scope| {
                for update in &updates {
                    let root = root.clone();
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        root.apply_update(update, Origin::Peer("remote".into()))
                            .unwrap();
                    });
                }
            });

            let keys = root.read(|d| {
                d.keys(ROOT)
                    .filter(|key| key.starts_with(SUBDOC_PREFIX))
                    .count()
            });
            assert_eq!(keys, WRITERS);
            assert_eq!(root.subdocs().len(), WRITERS);
            assert_eq!(announced.load(Ordering::SeqCst), WRITERS);
        }
    }

    #[tokio::test]
    async fn test_wait_synced() {
        let doc = Doc::new();
        assert!(!doc.is_synced());

        let waiter = {
            let doc = doc.clone();
            tokio::spawn(async move { doc.wait_synced().await })
        };
        doc.mark_synced();
        waiter.await.unwrap();
        assert!(doc.is_synced());
    }
}

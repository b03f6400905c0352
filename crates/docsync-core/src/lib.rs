//! docsync core library
//!
//! Keeps a tree of Automerge documents consistent with one or more storage
//! backends. The tree is usable offline; whatever changed while disconnected
//! is exchanged once storage is reachable again.
//!
//! # Architecture
//!
//! - **Automerge**: every document is a CRDT, so updates merge in any order
//!   and applying one twice is harmless
//! - **Storage adapters**: pull a delta for a state vector, push an update,
//!   subscribe to updates from other clients
//! - **Sync peers**: one retrying session per storage backend
//!
//! # Quick Start
//!
//! ```text
//! let root = Doc::new();
//! let storage = FsStorage::open("local", config.storage_dir())?;
//! let peer = SyncPeer::new(root.clone(), Arc::new(storage));
//!
//! peer.wait_for_loaded(None).await?;
//! root.change(|doc| doc.put(ROOT, "title", "Notes"))?;
//! peer.wait_for_synced(None).await?;
//! ```
//!
//! # Modules
//!
//! - `document`: CRDT document handles and sub-document trees
//! - `document_id`: Document identifiers
//! - `queue`: Awaitable FIFO used by the sync loops
//! - `storage`: Storage adapter contract plus memory and directory backends
//! - `sync`: Sync peers, their status, and the multi-peer engine
//! - `config`: Application configuration
//! - `identity`: Root document ID of a data directory

pub mod config;
pub mod document;
pub mod document_id;
pub mod error;
pub mod identity;
pub mod observer;
pub mod queue;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use document::{Doc, DocumentError, Origin, StateVector, SubdocsEvent, UpdateEvent};
pub use document_id::{DocumentId, DocumentIdError};
pub use error::{SyncError, SyncResult};
pub use identity::{Identity, InitResult};
pub use observer::{Observer, Subscription};
pub use queue::AsyncQueue;
pub use storage::{
    FsStorage, FsStorageStats, MemoryStorage, MemoryStorageClient, PullResult, StorageAdapter,
    StorageError, StorageResult,
};
pub use sync::{
    PeerConfig, SyncEngine, SyncEngineStatus, SyncEngineStep, SyncPeer, SyncStatus, SyncStep,
};

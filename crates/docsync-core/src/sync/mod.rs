//! Document tree synchronization
//!
//! A [`SyncPeer`] keeps a root document and its sub-documents in sync with a
//! single [`StorageAdapter`](crate::storage::StorageAdapter). A
//! [`SyncEngine`] combines a local peer with remote peers.
//!
//! ## Usage
//!
//! ```ignore
//! let peer = SyncPeer::new(root.clone(), Arc::new(storage));
//! peer.wait_for_synced(None).await?;
//! peer.stop();
//! ```

mod engine;
mod peer;
mod status;

pub use engine::{SyncEngine, SyncEngineStatus, SyncEngineStep};
pub use peer::{PeerConfig, SyncPeer, DEFAULT_RETRY_DELAY};
pub use status::{PeerCounters, SyncStatus, SyncStep};

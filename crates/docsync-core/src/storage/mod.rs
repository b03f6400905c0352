//! Storage layer
//!
//! A sync peer talks to storage only through the [`StorageAdapter`] trait:
//! pull a delta for a state vector, push an update, and subscribe to updates
//! written by other clients.
//!
//! ## Adapters
//!
//! - [`MemoryStorage`]: shared in-memory backend, one client handle per peer
//! - [`FsStorage`]: a directory with one Automerge file per document

mod adapter;
pub mod error;
pub mod fs;
pub mod memory;

pub use adapter::{DisconnectCallback, PullResult, StorageAdapter, UpdateCallback};
pub use error::{StorageError, StorageResult};
pub use fs::{FsStorage, FsStorageStats};
pub use memory::{MemoryStorage, MemoryStorageClient};

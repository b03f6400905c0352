//! Storage adapter contract

use std::sync::Arc;

use async_trait::async_trait;

use super::error::StorageResult;
use crate::document::StateVector;
use crate::document_id::DocumentId;
use crate::observer::Subscription;

/// Invoked with `(doc_id, update)` when another client changed a document
pub type UpdateCallback = Arc<dyn Fn(DocumentId, Vec<u8>) + Send + Sync>;

/// Invoked with a reason when the subscription is lost
pub type DisconnectCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Answer to a pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullResult {
    /// Update bringing the caller's state up to date (may be empty)
    pub data: Vec<u8>,
    /// What storage has, used as the baseline for the caller's push
    pub state: StateVector,
}

/// Transport-independent storage peer
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Stable name; doubles as the origin tag of updates a peer applies
    fn name(&self) -> &str;

    /// Fetch what a document at `state` is missing
    ///
    /// Returns `None` if storage has never seen the document.
    async fn pull(
        &self,
        doc_id: &DocumentId,
        state: &StateVector,
    ) -> StorageResult<Option<PullResult>>;

    /// Durably store an update
    async fn push(&self, doc_id: &DocumentId, data: &[u8]) -> StorageResult<()>;

    /// Listen for updates from other clients and for connection loss
    async fn subscribe(
        &self,
        on_update: UpdateCallback,
        on_disconnect: DisconnectCallback,
    ) -> StorageResult<Subscription>;
}

//! Unbounded FIFO with an awaitable, cancellable `next`
//!
//! Producers never block. A single consumer suspends in [`AsyncQueue::next`]
//! until an item is pushed or its cancellation token fires.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};

pub struct AsyncQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> AsyncQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Append one item and wake the consumer
    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.notify.notify_one();
    }

    /// Append several items and wake the consumer
    pub fn extend<I: IntoIterator<Item = T>>(&self, items: I) {
        let pushed = {
            let mut queue = self.items.lock();
            let before = queue.len();
            queue.extend(items);
            queue.len() > before
        };
        if pushed {
            self.notify.notify_one();
        }
    }

    /// Take the head item, waiting for one if the queue is empty
    ///
    /// Returns [`SyncError::Cancelled`] without removing anything if `cancel`
    /// fires first.
    pub async fn next(&self, cancel: &CancellationToken) -> SyncResult<T> {
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if let Some(item) = self.items.lock().pop_front() {
                return Ok(item);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Remove every item matching `predicate`, returning how many were removed
    pub fn remove<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let mut queue = self.items.lock();
        let before = queue.len();
        queue.retain(|item| !predicate(item));
        before - queue.len()
    }

    /// Drop all items without notifying
    pub fn clear(&self) {
        self.items.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

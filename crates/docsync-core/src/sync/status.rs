//! Peer status
//!
//! A peer's status is a pure function of its connected-document count, its
//! queue lengths and its two in-flight flags. Steps are ordered so callers
//! can ask "has the peer reached at least X".

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

/// How far a peer has progressed
///
/// Ordered by [`SyncStep::rank`]. `Loaded` sits between discovering documents
/// and exchanging updates: every document is connected but queued updates may
/// still be in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStep {
    Stopped,
    Retrying,
    LoadingRootDoc,
    LoadingSubDoc,
    Loaded,
    Syncing,
    Synced,
}

impl SyncStep {
    /// Numeric rank: 0, 1, 2, 3, 4.5, 5, 6
    pub fn rank(self) -> f32 {
        self.rank_tenths() as f32 / 10.0
    }

    fn rank_tenths(self) -> u8 {
        match self {
            SyncStep::Stopped => 0,
            SyncStep::Retrying => 10,
            SyncStep::LoadingRootDoc => 20,
            SyncStep::LoadingSubDoc => 30,
            SyncStep::Loaded => 45,
            SyncStep::Syncing => 50,
            SyncStep::Synced => 60,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncStep::Stopped => "stopped",
            SyncStep::Retrying => "retrying",
            SyncStep::LoadingRootDoc => "loading root doc",
            SyncStep::LoadingSubDoc => "loading sub doc",
            SyncStep::Loaded => "loaded",
            SyncStep::Syncing => "syncing",
            SyncStep::Synced => "synced",
        }
    }
}

impl PartialOrd for SyncStep {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SyncStep {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank_tenths().cmp(&other.rank_tenths())
    }
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a peer's progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub step: SyncStep,
    pub total_docs: usize,
    pub loaded_docs: usize,
    pub pending_pull_updates: usize,
    pub pending_push_updates: usize,
}

/// Inputs to [`SyncStatus::derive`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerCounters {
    pub connected_docs: usize,
    pub subdoc_queue: usize,
    pub pull_queue: usize,
    pub push_queue: usize,
    pub subdoc_loading: bool,
    pub pushing: bool,
}

impl SyncStatus {
    /// Status before the first attempt has connected anything
    pub fn initial() -> Self {
        Self::at(SyncStep::LoadingRootDoc)
    }

    /// Status between attempts
    pub fn retrying() -> Self {
        Self::at(SyncStep::Retrying)
    }

    /// Status once the peer has been stopped
    pub fn stopped() -> Self {
        Self::at(SyncStep::Stopped)
    }

    fn at(step: SyncStep) -> Self {
        Self {
            step,
            total_docs: 1,
            loaded_docs: 0,
            pending_pull_updates: 0,
            pending_push_updates: 0,
        }
    }

    pub fn derive(counters: &PeerCounters) -> Self {
        let pending_pull_updates = counters.pull_queue + usize::from(counters.subdoc_loading);
        let pending_push_updates = counters.push_queue + usize::from(counters.pushing);

        let step = if counters.connected_docs == 0 {
            SyncStep::LoadingRootDoc
        } else if counters.subdoc_queue > 0 || counters.subdoc_loading {
            SyncStep::LoadingSubDoc
        } else if counters.pull_queue > 0 || counters.push_queue > 0 || counters.pushing {
            SyncStep::Syncing
        } else {
            SyncStep::Synced
        };

        Self {
            step,
            total_docs: counters.connected_docs + counters.subdoc_queue,
            loaded_docs: counters.connected_docs,
            pending_pull_updates,
            pending_push_updates,
        }
    }

    /// Whether the peer has reached at least `step`
    pub fn reached(&self, step: SyncStep) -> bool {
        self.step >= step
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::initial()
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}/{} docs, {} to pull, {} to push)",
            self.step,
            self.loaded_docs,
            self.total_docs,
            self.pending_pull_updates,
            self.pending_push_updates
        )
    }
}

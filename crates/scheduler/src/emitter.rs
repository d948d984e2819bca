//! Progress fan-out to observers

use crate::state::ProgressSnapshot;
use tokio::sync::{broadcast, watch};

/// Default number of snapshots buffered per observer before it starts lagging
pub const DEFAULT_OBSERVER_CAPACITY: usize = 256;

/// Publishes immutable snapshots.
///
/// Observers subscribe to a broadcast stream of every snapshot; `latest()`
/// returns the most recent one without touching engine locks. A slow observer
/// lags and skips snapshots, it never blocks publication.
#[derive(Debug)]
pub struct ProgressEmitter {
    updates: broadcast::Sender<ProgressSnapshot>,
    latest: watch::Sender<ProgressSnapshot>,
}

impl ProgressEmitter {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        let (latest, _) = watch::channel(ProgressSnapshot::default());
        Self { updates, latest }
    }

    pub fn publish(&self, snapshot: ProgressSnapshot) {
        self.latest.send_replace(snapshot.clone());
        // No subscribers is not an error
        let _ = self.updates.send(snapshot);
    }

    /// Stream of every snapshot published after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.updates.subscribe()
    }

    /// Receiver that always holds the most recent snapshot
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ProgressSnapshot> {
        self.latest.subscribe()
    }

    #[must_use]
    pub fn latest(&self) -> ProgressSnapshot {
        self.latest.borrow().clone()
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.updates.receiver_count()
    }
}

impl Default for ProgressEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVER_CAPACITY)
    }
}

use std::collections::HashMap;
use tokio::sync::{broadcast, watch};

use super::state::OperationState;

/// Full read-only view of every known key
pub type Snapshot<T> = HashMap<String, OperationState<T>>;

/// One committed state change for a key
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<T> {
    /// Key whose state changed
    pub key: String,
    /// State the key moved into
    pub state: OperationState<T>,
}

/// Push-style observer of registry transitions
///
/// Transitions for one key arrive in the order they were committed. A
/// subscriber that falls behind skips the oldest events; it can always resync
/// from [`Subscription::latest`].
pub struct Subscription<T> {
    events: broadcast::Receiver<Transition<T>>,
    snapshots: watch::Receiver<Snapshot<T>>,
}

impl<T: Clone> Subscription<T> {
    pub(crate) const fn new(
        events: broadcast::Receiver<Transition<T>>,
        snapshots: watch::Receiver<Snapshot<T>>,
    ) -> Self {
        Self { events, snapshots }
    }

    /// Waits for the next transition; `None` once the registry is gone
    pub async fn next(&mut self) -> Option<Transition<T>> {
        loop {
            match self.events.recv().await {
                Ok(transition) => return Some(transition),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "observer lagged, dropping oldest transitions");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns an already-queued transition without waiting
    pub fn try_next(&mut self) -> Option<Transition<T>> {
        loop {
            match self.events.try_recv() {
                Ok(transition) => return Some(transition),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }

    /// Latest committed snapshot of all keys
    #[must_use]
    pub fn latest(&self) -> Snapshot<T> {
        self.snapshots.borrow().clone()
    }
}

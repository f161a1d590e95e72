//! Change notifications for the local store.
//!
//! Every store write calls [`ChangeFeed::notify`]. Subscribers (a UI refresh
//! loop, typically) receive a [`ChangeEvent`] naming the touched collections.
//! Bulk writers wrap their work in [`ChangeFeed::suppress`]: while any
//! [`SuppressGuard`] is alive, changes are collected instead of sent, and the
//! last guard to drop publishes them as a single coalesced event. Dropping is
//! the release, so early returns and `?` still resume notifications.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::record::Collection;

/// Collections touched since the last event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub collections: BTreeSet<Collection>,
}

#[derive(Default)]
struct FeedState {
    depth: usize,
    pending: BTreeSet<Collection>,
}

pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
    state: Mutex<FeedState>,
}

impl ChangeFeed {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            state: Mutex::new(FeedState::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    /// Record a change to `collection`.
    pub fn notify(&self, collection: Collection) {
        let mut state = self.state.lock();
        if state.depth > 0 {
            state.pending.insert(collection);
            return;
        }
        drop(state);
        self.publish(BTreeSet::from([collection]));
    }

    /// Hold notifications until the returned guard (and any nested ones) drop.
    #[must_use = "notifications resume as soon as the guard is dropped"]
    pub fn suppress(&self) -> SuppressGuard<'_> {
        self.state.lock().depth += 1;
        SuppressGuard { feed: self }
    }

    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        self.state.lock().depth > 0
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth > 0 || state.pending.is_empty() {
            return;
        }
        let collections = std::mem::take(&mut state.pending);
        drop(state);
        debug!(?collections, "Publishing coalesced change notification");
        self.publish(collections);
    }

    fn publish(&self, collections: BTreeSet<Collection>) {
        // No subscribers is fine.
        let _ = self.tx.send(ChangeEvent { collections });
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Scoped notification suppression. See [`ChangeFeed::suppress`].
pub struct SuppressGuard<'a> {
    feed: &'a ChangeFeed,
}

impl Drop for SuppressGuard<'_> {
    fn drop(&mut self) {
        self.feed.release();
    }
}

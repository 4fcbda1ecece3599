//! Event infrastructure for catalog-core.
//!
//! Provides `CatalogEvent` for debug/monitoring and `EventBus` for
//! subscriptions. Events describe what the synchronizer and the mutation
//! coordinator did; they are never needed for correctness.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::record::CollectionKind;

/// Where a published snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotOrigin {
    /// Authoritative re-fetch from the remote store.
    Remote,
    /// Optimistic local change.
    Optimistic,
    /// Restore of a pre-mutation snapshot after a failed remote call.
    Rollback,
    /// Local-only collection (no remote store).
    Local,
}

/// Mutation operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationOp {
    Add,
    Update,
    Delete,
}

/// Catalog events emitted for real-time monitoring.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CatalogEvent {
    /// A new snapshot became current for a collection.
    SnapshotPublished {
        kind: CollectionKind,
        /// Per-collection publish sequence number.
        seq: u64,
        /// Number of records in the snapshot.
        len: usize,
        origin: SnapshotOrigin,
        timestamp: i64,
    },
    /// A background re-fetch failed; the previous snapshot stays current.
    FetchFailed {
        kind: CollectionKind,
        error: String,
        timestamp: i64,
    },
    /// The change notification channel could not be opened, or closed for good.
    WatchFailed {
        kind: CollectionKind,
        error: String,
        timestamp: i64,
    },
    /// The collection runs without a remote store.
    LocalMode {
        kind: CollectionKind,
        timestamp: i64,
    },
    /// A mutation's remote call failed.
    MutationFailed {
        kind: CollectionKind,
        op: MutationOp,
        id: Option<String>,
        error: String,
        timestamp: i64,
    },
    /// An optimistic change was reverted.
    RolledBack {
        kind: CollectionKind,
        op: MutationOp,
        id: String,
        timestamp: i64,
    },
}

/// Current time in milliseconds since Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type EventCallback = Arc<dyn Fn(&CatalogEvent) + Send + Sync>;

/// Event bus for publishing catalog events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, EventCallback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&CatalogEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    /// Number of registered callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: CatalogEvent) {
        // Snapshot the list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(&event);
        }
    }
}

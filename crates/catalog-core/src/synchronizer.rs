//! CollectionSynchronizer: keeps a local copy of each collection current.
//!
//! Lifecycle per collection kind:
//!
//! 1. The first `subscribe` moves the collection to `Subscribing` and spawns a
//!    driver task. The driver opens a change feed, then runs the initial fetch.
//! 2. A successful fetch makes the collection `Live` and publishes the result
//!    to every subscriber, in subscription order.
//! 3. Each change notification triggers a re-fetch. Notifications that arrive
//!    while a fetch is in flight are coalesced into one trailing re-fetch.
//! 4. Disposing the last handle aborts the driver, which drops the feed and
//!    releases the transport. The collection goes back to `Unsubscribed`.
//!
//! Without a configured store the collection is `Local`: nothing is fetched
//! and the snapshot only changes through the mutation coordinator. A store
//! that reports itself unconfigured mid-cycle moves the collection to `Local`
//! and ends its driver.

use futures::{FutureExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{now_millis, CatalogEvent, EventBus, SnapshotOrigin};
use crate::record::{CollectionKind, Record};
use crate::snapshot::Snapshot;
use crate::store::RemoteStore;

/// Subscription state of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unsubscribed,
    /// Driver started, initial fetch not yet successful.
    Subscribing,
    Live,
    /// No remote store; local changes only.
    Local,
}

type SnapshotCallback = Box<dyn Fn(&Snapshot) + Send + Sync>;

struct Subscriber {
    live: AtomicBool,
    /// Highest `seq + 1` handed to the callback; 0 before the first delivery.
    /// Held for the whole callback so deliveries never interleave.
    delivered: Mutex<u64>,
    callback: SnapshotCallback,
}

impl Subscriber {
    fn new(callback: SnapshotCallback) -> Self {
        Self {
            live: AtomicBool::new(true),
            delivered: Mutex::new(0),
            callback,
        }
    }

    fn deliver(&self, snapshot: &Snapshot) {
        let mut delivered = self.delivered.lock().unwrap_or_else(|e| e.into_inner());
        if !self.live.load(Ordering::SeqCst) {
            return;
        }
        let mark = snapshot.seq() + 1;
        if *delivered >= mark {
            return;
        }
        *delivered = mark;
        (self.callback)(snapshot);
    }
}

struct CollectionState {
    phase: Phase,
    seq: u64,
    records: Arc<Vec<Record>>,
    subscribers: Vec<Arc<Subscriber>>,
    driver: Option<JoinHandle<()>>,
    /// Bumped on every start and teardown; stale drivers check it before publishing.
    generation: u64,
}

impl CollectionState {
    fn new() -> Self {
        Self {
            phase: Phase::Unsubscribed,
            seq: 0,
            records: Arc::new(Vec::new()),
            subscribers: Vec::new(),
            driver: None,
            generation: 0,
        }
    }

    fn snapshot(&self, kind: CollectionKind) -> Snapshot {
        Snapshot::new(kind, self.seq, Arc::clone(&self.records))
    }
}

struct Collection {
    kind: CollectionKind,
    state: Mutex<CollectionState>,
}

impl Collection {
    fn lock(&self) -> MutexGuard<'_, CollectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Guard on a publish coming from a driver task.
#[derive(Clone, Copy)]
enum Source {
    /// The driver of this generation; discarded if the cycle was torn down.
    Driver(u64),
    /// A local change from the mutation coordinator; always applied.
    Local,
}

struct Inner {
    store: Arc<dyn RemoteStore>,
    collections: [Collection; 2],
    events: Arc<EventBus>,
}

impl Inner {
    fn collection(&self, kind: CollectionKind) -> &Collection {
        &self.collections[kind.index()]
    }

    fn is_current(&self, kind: CollectionKind, generation: u64) -> bool {
        let state = self.collection(kind).lock();
        state.generation == generation && state.phase != Phase::Unsubscribed
    }

    /// Replace the collection's records and broadcast the new snapshot.
    fn install(
        &self,
        kind: CollectionKind,
        records: Arc<Vec<Record>>,
        origin: SnapshotOrigin,
        source: Source,
    ) -> Option<Snapshot> {
        let (snapshot, subscribers) = {
            let mut state = self.collection(kind).lock();
            if let Source::Driver(generation) = source {
                if state.generation != generation
                    || matches!(state.phase, Phase::Unsubscribed | Phase::Local)
                {
                    debug!("Discarding {} snapshot from a retired driver", kind);
                    return None;
                }
                state.phase = Phase::Live;
            }
            state.seq += 1;
            state.records = records;
            (state.snapshot(kind), state.subscribers.clone())
        };

        debug!(
            "Publishing {} snapshot #{} ({} records, {:?}) to {} subscriber(s)",
            kind,
            snapshot.seq(),
            snapshot.len(),
            origin,
            subscribers.len()
        );
        self.events.emit(CatalogEvent::SnapshotPublished {
            kind,
            seq: snapshot.seq(),
            len: snapshot.len(),
            origin,
            timestamp: now_millis(),
        });
        for subscriber in subscribers {
            subscriber.deliver(&snapshot);
        }
        Some(snapshot)
    }

    /// Switch a collection to local-only mode and hand the current snapshot
    /// to subscribers that have not seen one yet. The calling driver must
    /// return afterwards; its handle is released here.
    fn enter_local(&self, kind: CollectionKind, generation: u64) {
        let (snapshot, subscribers) = {
            let mut state = self.collection(kind).lock();
            if state.generation != generation || state.phase == Phase::Unsubscribed {
                return;
            }
            state.phase = Phase::Local;
            state.generation += 1;
            state.driver = None;
            (state.snapshot(kind), state.subscribers.clone())
        };
        info!("Remote store not configured; {} runs in local-only mode", kind);
        self.events.emit(CatalogEvent::LocalMode {
            kind,
            timestamp: now_millis(),
        });
        for subscriber in subscribers {
            subscriber.deliver(&snapshot);
        }
    }

    /// Fetch and publish. Returns false once the collection has fallen back
    /// to local-only mode and the driver should stop.
    async fn refresh(&self, kind: CollectionKind, generation: u64) -> bool {
        match self.store.fetch_all(kind).await {
            Ok(records) => {
                self.install(
                    kind,
                    Arc::new(records),
                    SnapshotOrigin::Remote,
                    Source::Driver(generation),
                );
            }
            Err(e) if e.is_not_configured() => {
                self.enter_local(kind, generation);
                return false;
            }
            Err(e) => {
                // Last good snapshot stays; the next change event retries.
                warn!("Failed to fetch {}: {}", kind, e);
                self.events.emit(CatalogEvent::FetchFailed {
                    kind,
                    error: e.to_string(),
                    timestamp: now_millis(),
                });
            }
        }
        true
    }

    fn unsubscribe(&self, kind: CollectionKind, subscriber: &Arc<Subscriber>) {
        subscriber.live.store(false, Ordering::SeqCst);
        let driver = {
            let mut state = self.collection(kind).lock();
            state.subscribers.retain(|s| !Arc::ptr_eq(s, subscriber));
            if !state.subscribers.is_empty() || state.phase == Phase::Unsubscribed {
                return;
            }
            if state.phase != Phase::Local {
                state.records = Arc::new(Vec::new());
            }
            state.phase = Phase::Unsubscribed;
            state.generation += 1;
            state.driver.take()
        };
        debug!("Last subscriber for {} gone, tearing down", kind);
        if let Some(driver) = driver {
            driver.abort();
        }
    }
}

/// Per-collection driver: watch, initial fetch, then one re-fetch per burst of
/// change events.
async fn drive(inner: Arc<Inner>, kind: CollectionKind, generation: u64) {
    let mut feed = match inner.store.watch(kind).await {
        Ok(feed) => Some(feed),
        Err(e) if e.is_not_configured() => {
            inner.enter_local(kind, generation);
            return;
        }
        Err(e) => {
            warn!("Failed to watch {}: {} (no live updates)", kind, e);
            inner.events.emit(CatalogEvent::WatchFailed {
                kind,
                error: e.to_string(),
                timestamp: now_millis(),
            });
            None
        }
    };

    if !inner.refresh(kind, generation).await {
        return;
    }

    let Some(feed) = feed.as_mut() else {
        return;
    };
    while feed.next().await.is_some() {
        // Everything queued while the previous fetch was in flight is owed a
        // single refresh.
        let mut coalesced = 0usize;
        while let Some(Some(_)) = feed.next().now_or_never() {
            coalesced += 1;
        }
        if coalesced > 0 {
            debug!("Coalesced {} extra change event(s) for {}", coalesced, kind);
        }
        if !inner.is_current(kind, generation) {
            return;
        }
        if !inner.refresh(kind, generation).await {
            return;
        }
    }
    if inner.is_current(kind, generation) {
        warn!("Change feed for {} closed; no further live updates", kind);
        inner.events.emit(CatalogEvent::WatchFailed {
            kind,
            error: "change feed closed".into(),
            timestamp: now_millis(),
        });
    }
}

/// Owns the authoritative local copy of each collection.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CollectionSynchronizer {
    inner: Arc<Inner>,
}

impl CollectionSynchronizer {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self::with_events(store, Arc::new(EventBus::new()))
    }

    pub fn with_events(store: Arc<dyn RemoteStore>, events: Arc<EventBus>) -> Self {
        let collection = |kind| Collection {
            kind,
            state: Mutex::new(CollectionState::new()),
        };
        Self {
            inner: Arc::new(Inner {
                store,
                collections: [
                    collection(CollectionKind::Tools),
                    collection(CollectionKind::News),
                ],
                events,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.inner.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Subscribe to snapshots of `kind`.
    ///
    /// The callback receives snapshots published after this call in
    /// increasing `seq` order, one at a time. A snapshot that loses a race to
    /// a newer one is skipped rather than delivered late. A subscriber joining
    /// a live or local collection gets the current snapshot right away.
    ///
    /// The callback must not publish to the same collection synchronously.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(
        &self,
        kind: CollectionKind,
        callback: impl Fn(&Snapshot) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let subscriber = Arc::new(Subscriber::new(Box::new(callback)));
        let collection = self.inner.collection(kind);

        let mut start = None;
        let mut local = false;
        let current = {
            let mut state = collection.lock();
            state.subscribers.push(Arc::clone(&subscriber));
            match state.phase {
                Phase::Unsubscribed if self.inner.store.is_configured() => {
                    state.phase = Phase::Subscribing;
                    state.generation += 1;
                    start = Some(state.generation);
                    None
                }
                Phase::Unsubscribed => {
                    state.phase = Phase::Local;
                    local = true;
                    Some(state.snapshot(kind))
                }
                Phase::Subscribing => None,
                Phase::Live | Phase::Local => Some(state.snapshot(kind)),
            }
        };

        if let Some(generation) = start {
            debug!("Starting {} subscription (generation {})", collection.kind, generation);
            let driver = tokio::spawn(drive(Arc::clone(&self.inner), kind, generation));
            let mut state = collection.lock();
            if state.generation == generation && state.phase != Phase::Unsubscribed {
                state.driver = Some(driver);
            } else {
                driver.abort();
            }
        }
        if local {
            info!("No remote store configured; {} runs in local-only mode", kind);
            self.inner.events.emit(CatalogEvent::LocalMode {
                kind,
                timestamp: now_millis(),
            });
        }
        if let Some(snapshot) = current {
            subscriber.deliver(&snapshot);
        }

        SubscriptionHandle {
            inner: Arc::downgrade(&self.inner),
            kind,
            subscriber: Some(subscriber),
        }
    }

    /// The current snapshot of `kind`.
    pub fn snapshot(&self, kind: CollectionKind) -> Snapshot {
        self.inner.collection(kind).lock().snapshot(kind)
    }

    pub fn phase(&self, kind: CollectionKind) -> Phase {
        self.inner.collection(kind).lock().phase
    }

    pub fn subscriber_count(&self, kind: CollectionKind) -> usize {
        self.inner.collection(kind).lock().subscribers.len()
    }

    /// Whether mutations on `kind` go to the remote store.
    pub fn is_remote_backed(&self, kind: CollectionKind) -> bool {
        self.inner.store.is_configured() && self.phase(kind) != Phase::Local
    }

    /// Append records to a local-only collection (demo data). Returns false
    /// and changes nothing when the collection is remote-backed.
    pub fn seed_local(&self, kind: CollectionKind, records: Vec<Record>) -> bool {
        if self.is_remote_backed(kind) {
            warn!("Ignoring local seed for remote-backed {}", kind);
            return false;
        }
        let records: Vec<Record> = records.into_iter().filter(|r| r.kind() == kind).collect();
        self.modify(kind, SnapshotOrigin::Local, |current| {
            let mut next = current.to_vec();
            next.extend(records);
            Some(next)
        });
        true
    }

    /// Apply `change` to the current records under the collection lock.
    ///
    /// Returns the snapshot before the change (the rollback point) and the
    /// published snapshot, if `change` produced one.
    pub(crate) fn modify(
        &self,
        kind: CollectionKind,
        origin: SnapshotOrigin,
        change: impl FnOnce(&[Record]) -> Option<Vec<Record>>,
    ) -> (Snapshot, Option<Snapshot>) {
        let (before, published, subscribers) = {
            let mut state = self.inner.collection(kind).lock();
            let before = state.snapshot(kind);
            match change(before.records()) {
                Some(records) => {
                    state.seq += 1;
                    state.records = Arc::new(records);
                    let published = state.snapshot(kind);
                    (before, Some(published), state.subscribers.clone())
                }
                None => (before, None, Vec::new()),
            }
        };

        if let Some(snapshot) = &published {
            self.inner.events.emit(CatalogEvent::SnapshotPublished {
                kind,
                seq: snapshot.seq(),
                len: snapshot.len(),
                origin,
                timestamp: now_millis(),
            });
            for subscriber in subscribers {
                subscriber.deliver(snapshot);
            }
        }
        (before, published)
    }

    /// Put back exactly the records of `rollback`, as a fresh publish.
    pub(crate) fn restore(&self, rollback: &Snapshot) -> Option<Snapshot> {
        self.inner.install(
            rollback.kind(),
            rollback.shared_records(),
            SnapshotOrigin::Rollback,
            Source::Local,
        )
    }
}

/// Disposable binding of one callback to one collection.
///
/// Dropping the handle disposes it. Disposing twice is a no-op.
pub struct SubscriptionHandle {
    inner: Weak<Inner>,
    kind: CollectionKind,
    subscriber: Option<Arc<Subscriber>>,
}

impl SubscriptionHandle {
    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.subscriber.is_some()
    }

    /// Stop receiving snapshots. No callback starts after this returns.
    pub fn dispose(&mut self) {
        let Some(subscriber) = self.subscriber.take() else {
            return;
        };
        subscriber.live.store(false, Ordering::SeqCst);
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe(self.kind, &subscriber);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::{InMemoryStore, StoreOp};
    use crate::record::Tool;
    use crate::store::{StoreError, UnconfiguredStore};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn tool(name: &str) -> Record {
        Record::Tool(Tool {
            name: name.into(),
            price: "Free".into(),
            category: "Writing".into(),
            ..Default::default()
        })
    }

    fn recorder() -> (
        impl Fn(&Snapshot) + Send + Sync + 'static,
        mpsc::UnboundedReceiver<Snapshot>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |snapshot: &Snapshot| {
                let _ = tx.send(snapshot.clone());
            },
            rx,
        )
    }

    async fn next_snapshot(rx: &mut mpsc::UnboundedReceiver<Snapshot>) -> Snapshot {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("Timed out waiting for snapshot")
            .expect("Snapshot channel closed")
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("Condition not reached");
    }

    fn names(snapshot: &Snapshot) -> Vec<String> {
        snapshot
            .records()
            .iter()
            .map(|r| r.as_tool().unwrap().name.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_initial_fetch_publishes_server_order() {
        let store = Arc::new(InMemoryStore::new());
        store.seed([tool("old"), tool("new")]);
        let sync = CollectionSynchronizer::new(store.clone());

        let (callback, mut rx) = recorder();
        let _handle = sync.subscribe(CollectionKind::Tools, callback);

        let snapshot = next_snapshot(&mut rx).await;
        assert_eq!(names(&snapshot), vec!["new", "old"]);
        assert_eq!(sync.phase(CollectionKind::Tools), Phase::Live);
        assert_eq!(store.fetch_count(CollectionKind::Tools), 1);
        assert_eq!(store.watcher_count(CollectionKind::Tools), 1);
    }

    #[tokio::test]
    async fn test_change_event_refetches_and_broadcasts_in_subscription_order() {
        let store = Arc::new(InMemoryStore::new());
        let sync = CollectionSynchronizer::new(store.clone());
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = Arc::clone(&order);
        let _a = sync.subscribe(CollectionKind::Tools, move |s: &Snapshot| {
            order_a.lock().unwrap().push(("a", s.seq()));
        });
        let order_b = Arc::clone(&order);
        let _b = sync.subscribe(CollectionKind::Tools, move |s: &Snapshot| {
            order_b.lock().unwrap().push(("b", s.seq()));
        });
        wait_until(|| sync.phase(CollectionKind::Tools) == Phase::Live).await;

        store.insert(&tool("fresh")).await.unwrap();
        wait_until(|| sync.snapshot(CollectionKind::Tools).len() == 1).await;

        let seen = order.lock().unwrap().clone();
        assert_eq!(seen, vec![("a", 1), ("b", 1), ("a", 2), ("b", 2)]);
    }

    #[tokio::test]
    async fn test_burst_of_changes_coalesces_into_one_trailing_fetch() {
        let store = Arc::new(InMemoryStore::new());
        store.hold_fetches();
        let sync = CollectionSynchronizer::new(store.clone());

        let (callback, mut rx) = recorder();
        let _handle = sync.subscribe(CollectionKind::Tools, callback);
        wait_until(|| store.fetch_count(CollectionKind::Tools) == 1).await;

        for _ in 0..10 {
            store.notify(CollectionKind::Tools);
        }
        store.release_fetches(1);
        next_snapshot(&mut rx).await;

        wait_until(|| store.fetch_count(CollectionKind::Tools) == 2).await;
        store.release_fetches(1);
        next_snapshot(&mut rx).await;

        settle().await;
        assert_eq!(store.fetch_count(CollectionKind::Tools), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_refetch_keeps_last_good_snapshot() {
        let store = Arc::new(InMemoryStore::new());
        store.seed([tool("kept")]);
        let sync = CollectionSynchronizer::new(store.clone());
        let failures = Arc::new(AtomicUsize::new(0));
        let failures_clone = Arc::clone(&failures);
        let _events = sync.events().subscribe(move |event| {
            if matches!(event, CatalogEvent::FetchFailed { .. }) {
                failures_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let (callback, mut rx) = recorder();
        let _handle = sync.subscribe(CollectionKind::Tools, callback);
        let first = next_snapshot(&mut rx).await;

        store.fail_next(
            StoreOp::FetchAll,
            CollectionKind::Tools,
            StoreError::Network("connection reset".into()),
        );
        store.notify(CollectionKind::Tools);
        wait_until(|| failures.load(Ordering::SeqCst) == 1).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(sync.snapshot(CollectionKind::Tools).seq(), first.seq());
        assert_eq!(names(&sync.snapshot(CollectionKind::Tools)), vec!["kept"]);

        // The next change event is the retry.
        store.notify(CollectionKind::Tools);
        let retried = next_snapshot(&mut rx).await;
        assert!(retried.seq() > first.seq());
        assert_eq!(store.fetch_count(CollectionKind::Tools), 3);
    }

    #[tokio::test]
    async fn test_failed_initial_fetch_stays_subscribing_until_next_change() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next(
            StoreOp::FetchAll,
            CollectionKind::News,
            StoreError::PermissionDenied("anon".into()),
        );
        let sync = CollectionSynchronizer::new(store.clone());

        let (callback, mut rx) = recorder();
        let _handle = sync.subscribe(CollectionKind::News, callback);
        wait_until(|| store.fetch_count(CollectionKind::News) == 1).await;
        settle().await;
        assert_eq!(sync.phase(CollectionKind::News), Phase::Subscribing);
        assert!(rx.try_recv().is_err());

        store.notify(CollectionKind::News);
        next_snapshot(&mut rx).await;
        assert_eq!(sync.phase(CollectionKind::News), Phase::Live);
    }

    #[tokio::test]
    async fn test_double_dispose_is_silent_and_blocks_late_fetches() {
        let store = Arc::new(InMemoryStore::new());
        store.hold_fetches();
        let sync = CollectionSynchronizer::new(store.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let mut handle = sync.subscribe(CollectionKind::Tools, move |_: &Snapshot| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        wait_until(|| store.fetch_count(CollectionKind::Tools) == 1).await;

        handle.dispose();
        handle.dispose();
        assert!(!handle.is_active());

        store.open_gate();
        store.notify(CollectionKind::Tools);
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(sync.phase(CollectionKind::Tools), Phase::Unsubscribed);
        wait_until(|| store.watcher_count(CollectionKind::Tools) == 0).await;
    }

    #[tokio::test]
    async fn test_resubscribe_after_teardown_starts_fresh() {
        let store = Arc::new(InMemoryStore::new());
        store.seed([tool("one")]);
        let sync = CollectionSynchronizer::new(store.clone());

        let (callback, mut rx) = recorder();
        let handle = sync.subscribe(CollectionKind::Tools, callback);
        let first = next_snapshot(&mut rx).await;
        drop(handle);
        wait_until(|| store.watcher_count(CollectionKind::Tools) == 0).await;
        assert!(sync.snapshot(CollectionKind::Tools).is_empty());

        let (callback, mut rx) = recorder();
        let _handle = sync.subscribe(CollectionKind::Tools, callback);
        let second = next_snapshot(&mut rx).await;

        assert_eq!(store.fetch_count(CollectionKind::Tools), 2);
        assert_eq!(store.watcher_count(CollectionKind::Tools), 1);
        assert!(second.seq() > first.seq());
        assert_eq!(names(&second), vec!["one"]);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_current_snapshot() {
        let store = Arc::new(InMemoryStore::new());
        store.seed([tool("a"), tool("b")]);
        let sync = CollectionSynchronizer::new(store.clone());

        let (callback, mut rx) = recorder();
        let _first = sync.subscribe(CollectionKind::Tools, callback);
        next_snapshot(&mut rx).await;

        let (callback, mut late_rx) = recorder();
        let _late = sync.subscribe(CollectionKind::Tools, callback);
        let snapshot = late_rx.try_recv().expect("late subscriber served immediately");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(store.fetch_count(CollectionKind::Tools), 1);
    }

    #[tokio::test]
    async fn test_snapshots_never_go_backwards() {
        let store = Arc::new(InMemoryStore::new());
        let sync = CollectionSynchronizer::new(store.clone());

        let (callback, mut rx) = recorder();
        let _handle = sync.subscribe(CollectionKind::Tools, callback);
        next_snapshot(&mut rx).await;

        for i in 0..20 {
            store.insert(&tool(&format!("t{i}"))).await.unwrap();
            if i % 3 == 0 {
                settle().await;
            }
        }
        wait_until(|| sync.snapshot(CollectionKind::Tools).len() == 20).await;
        settle().await;

        let mut seqs = Vec::new();
        while let Ok(snapshot) = rx.try_recv() {
            seqs.push(snapshot.seq());
        }
        assert!(!seqs.is_empty());
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_unconfigured_store_runs_local() {
        let sync = CollectionSynchronizer::new(Arc::new(UnconfiguredStore));

        let (callback, mut rx) = recorder();
        let _handle = sync.subscribe(CollectionKind::Tools, callback);
        let initial = rx.try_recv().expect("local subscriber served immediately");
        assert!(initial.is_empty());
        assert_eq!(sync.phase(CollectionKind::Tools), Phase::Local);
        assert!(!sync.is_remote_backed(CollectionKind::Tools));

        assert!(sync.seed_local(CollectionKind::Tools, vec![tool("demo").with_id("d1")]));
        let seeded = rx.try_recv().unwrap();
        assert_eq!(seeded.ids(), vec!["d1"]);
    }

    #[tokio::test]
    async fn test_seed_local_refused_when_remote_backed() {
        let store = Arc::new(InMemoryStore::new());
        let sync = CollectionSynchronizer::new(store);
        assert!(!sync.seed_local(CollectionKind::Tools, vec![tool("x")]));
        assert!(sync.snapshot(CollectionKind::Tools).is_empty());
    }

    #[tokio::test]
    async fn test_watch_failure_is_isolated_per_collection() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next(
            StoreOp::Watch,
            CollectionKind::News,
            StoreError::Network("socket refused".into()),
        );
        let sync = CollectionSynchronizer::new(store.clone());

        let (news_cb, mut news_rx) = recorder();
        let (tools_cb, mut tools_rx) = recorder();
        let _news = sync.subscribe(CollectionKind::News, news_cb);
        let _tools = sync.subscribe(CollectionKind::Tools, tools_cb);

        // News still gets its initial snapshot, just no live updates.
        next_snapshot(&mut news_rx).await;
        next_snapshot(&mut tools_rx).await;

        store.insert(&tool("live")).await.unwrap();
        let updated = next_snapshot(&mut tools_rx).await;
        assert_eq!(names(&updated), vec!["live"]);
        assert_eq!(store.watcher_count(CollectionKind::News), 0);
    }

    #[tokio::test]
    async fn test_not_configured_on_first_fetch_falls_back_to_local_and_releases_feed() {
        let store = Arc::new(InMemoryStore::new());
        store.seed([tool("remote")]);
        store.fail_next(StoreOp::FetchAll, CollectionKind::Tools, StoreError::NotConfigured);
        let sync = CollectionSynchronizer::new(store.clone());

        let (callback, mut rx) = recorder();
        let mut handle = sync.subscribe(CollectionKind::Tools, callback);
        let initial = next_snapshot(&mut rx).await;
        assert!(initial.is_empty());
        assert_eq!(sync.phase(CollectionKind::Tools), Phase::Local);
        wait_until(|| store.watcher_count(CollectionKind::Tools) == 0).await;

        assert!(sync.seed_local(CollectionKind::Tools, vec![tool("demo").with_id("d1")]));
        store.notify(CollectionKind::Tools);
        settle().await;
        assert_eq!(sync.phase(CollectionKind::Tools), Phase::Local);
        assert_eq!(sync.snapshot(CollectionKind::Tools).ids(), vec!["d1"]);
        assert_eq!(store.fetch_count(CollectionKind::Tools), 1);

        handle.dispose();
        assert_eq!(sync.phase(CollectionKind::Tools), Phase::Unsubscribed);
        assert_eq!(store.watcher_count(CollectionKind::Tools), 0);
    }

    #[tokio::test]
    async fn test_not_configured_on_refetch_stops_the_driver() {
        let store = Arc::new(InMemoryStore::new());
        store.seed([tool("remote")]);
        let sync = CollectionSynchronizer::new(store.clone());

        let (callback, mut rx) = recorder();
        let _handle = sync.subscribe(CollectionKind::Tools, callback);
        let first = next_snapshot(&mut rx).await;
        assert_eq!(names(&first), vec!["remote"]);
        assert_eq!(store.watcher_count(CollectionKind::Tools), 1);

        store.fail_next(StoreOp::FetchAll, CollectionKind::Tools, StoreError::NotConfigured);
        store.notify(CollectionKind::Tools);
        wait_until(|| sync.phase(CollectionKind::Tools) == Phase::Local).await;
        wait_until(|| store.watcher_count(CollectionKind::Tools) == 0).await;

        // Local edits survive; nothing re-fetches over them.
        assert!(sync.seed_local(CollectionKind::Tools, vec![tool("local").with_id("l1")]));
        store.insert(&tool("elsewhere")).await.unwrap();
        settle().await;
        assert_eq!(sync.phase(CollectionKind::Tools), Phase::Local);
        assert_eq!(names(&sync.snapshot(CollectionKind::Tools)), vec!["remote", "local"]);
        assert_eq!(store.fetch_count(CollectionKind::Tools), 2);
    }

    #[tokio::test]
    async fn test_closed_feed_reports_watch_failure() {
        let store = Arc::new(InMemoryStore::new());
        let sync = CollectionSynchronizer::new(store.clone());
        let failures = Arc::new(Mutex::new(Vec::new()));
        let failures_clone = Arc::clone(&failures);
        let _events = sync.events().subscribe(move |event| {
            if let CatalogEvent::WatchFailed { kind, error, .. } = event {
                failures_clone.lock().unwrap().push((*kind, error.clone()));
            }
        });

        let (callback, mut rx) = recorder();
        let _handle = sync.subscribe(CollectionKind::Tools, callback);
        next_snapshot(&mut rx).await;

        store.disconnect_watchers(CollectionKind::Tools);
        wait_until(|| !failures.lock().unwrap().is_empty()).await;

        let seen = failures.lock().unwrap().clone();
        assert_eq!(seen, vec![(CollectionKind::Tools, "change feed closed".to_string())]);
        // The last good snapshot stays current.
        assert_eq!(sync.phase(CollectionKind::Tools), Phase::Live);
    }

    #[tokio::test]
    async fn test_idle_feed_is_not_a_watch_failure() {
        struct QuietStore(InMemoryStore);

        #[async_trait::async_trait]
        impl RemoteStore for QuietStore {
            async fn fetch_all(&self, kind: CollectionKind) -> crate::store::Result<Vec<Record>> {
                self.0.fetch_all(kind).await
            }
            async fn insert(&self, record: &Record) -> crate::store::Result<Record> {
                self.0.insert(record).await
            }
            async fn update(&self, id: &str, record: &Record) -> crate::store::Result<()> {
                self.0.update(id, record).await
            }
            async fn remove(&self, kind: CollectionKind, id: &str) -> crate::store::Result<()> {
                self.0.remove(kind, id).await
            }
            async fn watch(&self, kind: CollectionKind) -> crate::store::Result<crate::store::ChangeFeed> {
                Ok(crate::store::ChangeFeed::idle(kind))
            }
        }

        let sync = CollectionSynchronizer::new(Arc::new(QuietStore(InMemoryStore::new())));
        let failed = Arc::new(AtomicUsize::new(0));
        let failed_clone = Arc::clone(&failed);
        let _events = sync.events().subscribe(move |event| {
            if matches!(event, CatalogEvent::WatchFailed { .. }) {
                failed_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let (callback, mut rx) = recorder();
        let _handle = sync.subscribe(CollectionKind::News, callback);
        next_snapshot(&mut rx).await;
        settle().await;

        assert_eq!(sync.phase(CollectionKind::News), Phase::Live);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_publishes_reach_each_subscriber_in_order() {
        let sync = CollectionSynchronizer::new(Arc::new(UnconfiguredStore));
        let seqs = Arc::new(Mutex::new(Vec::new()));
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let (seqs_clone, busy_clone, overlaps_clone) =
            (Arc::clone(&seqs), Arc::clone(&busy), Arc::clone(&overlaps));
        let _handle = sync.subscribe(CollectionKind::Tools, move |s: &Snapshot| {
            if busy_clone.swap(true, Ordering::SeqCst) {
                overlaps_clone.fetch_add(1, Ordering::SeqCst);
            }
            seqs_clone.lock().unwrap().push(s.seq());
            busy_clone.store(false, Ordering::SeqCst);
        });

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..5_000 {
                        sync.modify(CollectionKind::Tools, SnapshotOrigin::Local, |r| {
                            Some(r.to_vec())
                        });
                    }
                });
            }
        });

        let seqs = seqs.lock().unwrap().clone();
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seqs.last().copied(), Some(sync.snapshot(CollectionKind::Tools).seq()));
    }
}

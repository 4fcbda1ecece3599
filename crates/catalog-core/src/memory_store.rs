//! In-process implementation of [`RemoteStore`].
//!
//! Behaves like the hosted store as far as the synchronizer can tell: rows
//! are kept in storage representation, ids and `created_at` are assigned on
//! insert, reads come back newest first, and every successful mutation fires
//! a change notification to the watchers of that collection.
//!
//! Also carries the knobs tests need: one-shot fault injection, a gate that
//! holds `fetch_all` until released, and counters.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use crate::field_map::{self, Row};
use crate::record::{CollectionKind, Record};
use crate::store::{ChangeEvent, ChangeFeed, RemoteStore, Result, StoreError};

/// Operation selector for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    FetchAll,
    Insert,
    Update,
    Remove,
    Watch,
}

struct StoredRow {
    /// Insertion order, the tie breaker for equal order-column values.
    seq: u64,
    row: Row,
}

#[derive(Default)]
struct Tables {
    rows: [Vec<StoredRow>; 2],
    watchers: [Vec<(u64, mpsc::UnboundedSender<ChangeEvent>)>; 2],
    faults: HashMap<(StoreOp, CollectionKind), StoreError>,
    fetch_counts: [usize; 2],
    gate: Option<Arc<Semaphore>>,
}

struct Inner {
    tables: Mutex<Tables>,
    next_seq: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-memory store for tests and demo mode.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Insert rows without firing change notifications. Returns stored records
    /// with their assigned ids, in the order given.
    pub fn seed(&self, records: impl IntoIterator<Item = Record>) -> Vec<Record> {
        records
            .into_iter()
            .filter_map(|record| match self.store_row(&record) {
                Ok((_, stored)) => Some(stored),
                Err(e) => {
                    debug!("Skipping seed record: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Make the next call of `op` on `kind` fail with `error`.
    pub fn fail_next(&self, op: StoreOp, kind: CollectionKind, error: StoreError) {
        self.inner.lock().faults.insert((op, kind), error);
    }

    /// Hold every subsequent `fetch_all` until released with
    /// [`release_fetches`](Self::release_fetches) or [`open_gate`](Self::open_gate).
    pub fn hold_fetches(&self) {
        self.inner.lock().gate = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `n` held fetches proceed.
    pub fn release_fetches(&self, n: usize) {
        if let Some(gate) = self.inner.lock().gate.as_ref() {
            gate.add_permits(n);
        }
    }

    /// Stop holding fetches; any waiting fetch proceeds.
    pub fn open_gate(&self) {
        if let Some(gate) = self.inner.lock().gate.take() {
            gate.close();
        }
    }

    /// Number of `fetch_all` calls started for `kind`.
    pub fn fetch_count(&self, kind: CollectionKind) -> usize {
        self.inner.lock().fetch_counts[kind.index()]
    }

    /// Number of open change feeds for `kind`.
    pub fn watcher_count(&self, kind: CollectionKind) -> usize {
        self.inner.lock().watchers[kind.index()].len()
    }

    /// Number of rows stored for `kind`.
    pub fn len(&self, kind: CollectionKind) -> usize {
        self.inner.lock().rows[kind.index()].len()
    }

    pub fn is_empty(&self, kind: CollectionKind) -> bool {
        self.len(kind) == 0
    }

    /// Fire a change notification as if another client had written.
    pub fn notify(&self, kind: CollectionKind) {
        let mut tables = self.inner.lock();
        let watchers = &mut tables.watchers[kind.index()];
        watchers.retain(|(_, tx)| tx.send(ChangeEvent { kind }).is_ok());
    }

    /// End every open change feed for `kind`, as a dropped connection would.
    pub fn disconnect_watchers(&self, kind: CollectionKind) {
        self.inner.lock().watchers[kind.index()].clear();
    }

    fn take_fault(&self, op: StoreOp, kind: CollectionKind) -> Result<()> {
        match self.inner.lock().faults.remove(&(op, kind)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn now() -> String {
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
    }

    fn store_row(&self, record: &Record) -> Result<(CollectionKind, Record)> {
        let kind = record.kind();
        let now = Self::now();
        let mut row = field_map::insert_row(record, &now)?;
        let id = uuid::Uuid::new_v4().to_string();
        row.insert("id".to_string(), Value::String(id));
        row.insert("created_at".to_string(), Value::String(now));

        let stored = field_map::from_row(kind, Value::Object(row.clone()))?;
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().rows[kind.index()].push(StoredRow { seq, row });
        Ok((kind, stored))
    }

    fn release_watcher(inner: &Arc<Inner>, kind: CollectionKind, watcher_id: u64) {
        inner.lock().watchers[kind.index()].retain(|(id, _)| *id != watcher_id);
    }
}

/// Newest first by the kind's order column, newest insertion breaking ties.
fn sort_newest_first(kind: CollectionKind, rows: &mut [&StoredRow]) {
    let column = kind.order_column();
    rows.sort_by(|a, b| {
        let a_key = a.row.get(column).and_then(Value::as_str).unwrap_or("");
        let b_key = b.row.get(column).and_then(Value::as_str).unwrap_or("");
        b_key.cmp(a_key).then(b.seq.cmp(&a.seq))
    });
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn fetch_all(&self, kind: CollectionKind) -> Result<Vec<Record>> {
        let gate = {
            let mut tables = self.inner.lock();
            tables.fetch_counts[kind.index()] += 1;
            tables.gate.clone()
        };
        if let Some(gate) = gate {
            // A closed gate means "open": proceed immediately.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.take_fault(StoreOp::FetchAll, kind)?;

        let tables = self.inner.lock();
        let mut rows: Vec<&StoredRow> = tables.rows[kind.index()].iter().collect();
        sort_newest_first(kind, &mut rows);
        rows.into_iter()
            .map(|stored| {
                field_map::from_row(kind, Value::Object(stored.row.clone()))
                    .map_err(StoreError::from)
            })
            .collect()
    }

    async fn insert(&self, record: &Record) -> Result<Record> {
        let kind = record.kind();
        self.take_fault(StoreOp::Insert, kind)?;
        let (kind, stored) = self.store_row(record)?;
        debug!("Inserted {} into {}", stored.id(), kind);
        self.notify(kind);
        Ok(stored)
    }

    async fn update(&self, id: &str, record: &Record) -> Result<()> {
        let kind = record.kind();
        self.take_fault(StoreOp::Update, kind)?;
        let changes = field_map::update_row(record)?;
        {
            let mut tables = self.inner.lock();
            let target = tables.rows[kind.index()]
                .iter_mut()
                .find(|stored| stored.row.get("id").and_then(Value::as_str) == Some(id))
                .ok_or_else(|| StoreError::NotFound(format!("{kind}/{id}")))?;
            for (column, value) in changes {
                target.row.insert(column, value);
            }
        }
        self.notify(kind);
        Ok(())
    }

    async fn remove(&self, kind: CollectionKind, id: &str) -> Result<()> {
        self.take_fault(StoreOp::Remove, kind)?;
        let removed = {
            let mut tables = self.inner.lock();
            let rows = &mut tables.rows[kind.index()];
            let before = rows.len();
            rows.retain(|stored| stored.row.get("id").and_then(Value::as_str) != Some(id));
            before != rows.len()
        };
        if removed {
            self.notify(kind);
        } else {
            debug!("Remove of {}/{} matched no row", kind, id);
        }
        Ok(())
    }

    async fn watch(&self, kind: CollectionKind) -> Result<ChangeFeed> {
        self.take_fault(StoreOp::Watch, kind)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher_id = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().watchers[kind.index()].push((watcher_id, tx));

        let inner = Arc::clone(&self.inner);
        Ok(ChangeFeed::new(kind, rx, move || {
            InMemoryStore::release_watcher(&inner, kind, watcher_id);
        }))
    }
}

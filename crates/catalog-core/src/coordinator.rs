//! MutationCoordinator: add, update, and delete with optimistic local effects.
//!
//! - Delete is always applied locally first, then sent to the store. A failed
//!   remote delete restores the exact pre-delete snapshot.
//! - Add and update go straight to the store when the collection is
//!   remote-backed; their effect shows up through the next live snapshot.
//!   Without a remote store they are applied locally right away.
//!
//! Errors from the store are returned to the caller after any rollback.

use tracing::{debug, error, warn};

use crate::events::{now_millis, CatalogEvent, MutationOp, SnapshotOrigin};
use crate::record::{CatalogRecord, CollectionKind, NewsArticle, Record, Tool};
use crate::snapshot::Snapshot;
use crate::store::{Result, StoreError};
use crate::synchronizer::CollectionSynchronizer;

/// What a mutation acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationTarget {
    Record(Record),
    Id(String),
}

/// A mutation between "triggered" and "settled".
///
/// `rollback` is captured before any local change is applied.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub op: MutationOp,
    pub kind: CollectionKind,
    pub target: MutationTarget,
    rollback: Snapshot,
}

impl PendingMutation {
    fn new(op: MutationOp, kind: CollectionKind, target: MutationTarget, rollback: Snapshot) -> Self {
        Self {
            op,
            kind,
            target,
            rollback,
        }
    }

    pub fn rollback_point(&self) -> &Snapshot {
        &self.rollback
    }

    fn target_id(&self) -> Option<String> {
        match &self.target {
            MutationTarget::Id(id) => Some(id.clone()),
            MutationTarget::Record(r) if !r.id().is_empty() => Some(r.id().to_string()),
            MutationTarget::Record(_) => None,
        }
    }
}

/// Applies user mutations to the store and to the synchronizer's snapshots.
#[derive(Clone)]
pub struct MutationCoordinator {
    sync: CollectionSynchronizer,
}

impl MutationCoordinator {
    pub fn new(sync: CollectionSynchronizer) -> Self {
        Self { sync }
    }

    pub fn synchronizer(&self) -> &CollectionSynchronizer {
        &self.sync
    }

    /// Add a record. Returns the record as stored: with the server-assigned id
    /// when remote-backed, otherwise with a locally generated one.
    pub async fn add(&self, record: Record) -> Result<Record> {
        let kind = record.kind();
        if self.sync.is_remote_backed(kind) {
            let pending = PendingMutation::new(
                MutationOp::Add,
                kind,
                MutationTarget::Record(record.clone()),
                self.sync.snapshot(kind),
            );
            match self.sync.store().insert(&record).await {
                Ok(stored) => {
                    debug!("Inserted {}/{}; waiting for live snapshot", kind, stored.id());
                    return Ok(stored);
                }
                Err(e) if e.is_not_configured() => {
                    warn!("Store not configured; adding {} locally", kind);
                }
                Err(e) => return Err(self.fail(&pending, e, false)),
            }
        }
        Ok(self.add_local(record))
    }

    /// Replace record `id` with `record` (the id is carried over).
    pub async fn update(&self, id: &str, record: Record) -> Result<()> {
        let kind = record.kind();
        let record = record.with_id(id);
        if self.sync.is_remote_backed(kind) {
            let pending = PendingMutation::new(
                MutationOp::Update,
                kind,
                MutationTarget::Record(record.clone()),
                self.sync.snapshot(kind),
            );
            match self.sync.store().update(id, &record).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_configured() => {
                    warn!("Store not configured; updating {}/{} locally", kind, id);
                }
                Err(e) => return Err(self.fail(&pending, e, false)),
            }
        }
        self.update_local(id, record)
    }

    /// Remove record `id`: immediately from the snapshot, then from the store.
    pub async fn delete(&self, kind: CollectionKind, id: &str) -> Result<()> {
        let (before, published) = self.sync.modify(kind, SnapshotOrigin::Optimistic, |records| {
            if !records.iter().any(|r| r.id() == id) {
                return None;
            }
            Some(records.iter().filter(|r| r.id() != id).cloned().collect())
        });
        if published.is_none() {
            debug!("Delete of {}/{}: not in local snapshot", kind, id);
        }
        let pending =
            PendingMutation::new(MutationOp::Delete, kind, MutationTarget::Id(id.to_string()), before);

        if !self.sync.is_remote_backed(kind) {
            return Ok(());
        }
        match self.sync.store().remove(kind, id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_configured() => Ok(()),
            Err(e) => Err(self.fail(&pending, e, published.is_some())),
        }
    }

    pub async fn add_tool(&self, tool: Tool) -> Result<Tool> {
        self.add_typed(tool).await
    }

    pub async fn update_tool(&self, id: &str, tool: Tool) -> Result<()> {
        self.update(id, tool.into_record()).await
    }

    pub async fn delete_tool(&self, id: &str) -> Result<()> {
        self.delete(Tool::KIND, id).await
    }

    pub async fn add_news(&self, article: NewsArticle) -> Result<NewsArticle> {
        self.add_typed(article).await
    }

    pub async fn update_news(&self, id: &str, article: NewsArticle) -> Result<()> {
        self.update(id, article.into_record()).await
    }

    pub async fn delete_news(&self, id: &str) -> Result<()> {
        self.delete(NewsArticle::KIND, id).await
    }

    async fn add_typed<R: CatalogRecord>(&self, record: R) -> Result<R> {
        let stored = self.add(record.into_record()).await?;
        R::from_record(&stored)
            .cloned()
            .ok_or_else(|| StoreError::Decode(format!("store returned a {} record", stored.kind())))
    }

    fn add_local(&self, record: Record) -> Record {
        let kind = record.kind();
        let mut record = if record.id().is_empty() {
            record.with_id(&uuid::Uuid::new_v4().to_string())
        } else {
            record
        };
        if let Record::News(article) = &mut record {
            if article.date.is_empty() {
                article.date = chrono::Utc::now().to_rfc3339();
            }
        }

        let inserted = record.clone();
        self.sync.modify(kind, SnapshotOrigin::Local, move |records| {
            let mut next = Vec::with_capacity(records.len() + 1);
            next.push(inserted);
            next.extend_from_slice(records);
            Some(next)
        });
        debug!("Added {}/{} locally", kind, record.id());
        record
    }

    fn update_local(&self, id: &str, record: Record) -> Result<()> {
        let kind = record.kind();
        let (_, published) = self.sync.modify(kind, SnapshotOrigin::Local, |records| {
            let position = records.iter().position(|r| r.id() == id)?;
            let mut next = records.to_vec();
            next[position] = record;
            Some(next)
        });
        match published {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("{kind}/{id}"))),
        }
    }

    /// Report a failed remote call, rolling back first when asked to.
    fn fail(&self, pending: &PendingMutation, err: StoreError, roll_back: bool) -> StoreError {
        let id = pending.target_id();
        error!(
            "Failed to {:?} {}/{}: {}",
            pending.op,
            pending.kind,
            id.as_deref().unwrap_or("<new>"),
            err
        );

        if roll_back {
            self.sync.restore(pending.rollback_point());
        }

        let events = self.sync.events();
        events.emit(CatalogEvent::MutationFailed {
            kind: pending.kind,
            op: pending.op,
            id: id.clone(),
            error: err.to_string(),
            timestamp: now_millis(),
        });
        if roll_back {
            events.emit(CatalogEvent::RolledBack {
                kind: pending.kind,
                op: pending.op,
                id: id.unwrap_or_default(),
                timestamp: now_millis(),
            });
        }
        err
    }
}

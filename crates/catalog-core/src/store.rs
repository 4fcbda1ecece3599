//! RemoteStore trait: the boundary to the hosted database.
//!
//! Implementations:
//! - `UnconfiguredStore` - No credentials; every call reports `NotConfigured`
//! - `InMemoryStore` - In-process store for tests and demo mode
//! - `PostgrestStore` (in catalog-daemon) - HTTP + realtime websocket

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::field_map::FieldMapError;
use crate::record::{CollectionKind, Record};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Remote store is not configured")]
    NotConfigured,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rejected by store: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid data from store: {0}")]
    Decode(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl StoreError {
    /// True when the store is simply absent (local-only mode), not failing.
    pub fn is_not_configured(&self) -> bool {
        matches!(self, StoreError::NotConfigured)
    }
}

impl From<FieldMapError> for StoreError {
    fn from(err: FieldMapError) -> Self {
        StoreError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// "Something changed in this collection, re-fetch." Carries no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: CollectionKind,
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Stream of change notifications for one collection.
///
/// Closing the feed (explicitly or by dropping it) releases the underlying
/// transport channel. Closing twice is a no-op.
pub struct ChangeFeed {
    kind: CollectionKind,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    release: Option<ReleaseFn>,
    /// Sender held by an idle feed so it stays pending until closed.
    keepalive: Option<mpsc::UnboundedSender<ChangeEvent>>,
    closed: bool,
}

impl ChangeFeed {
    pub fn new(
        kind: CollectionKind,
        rx: mpsc::UnboundedReceiver<ChangeEvent>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            kind,
            rx,
            release: Some(Box::new(release)),
            keepalive: None,
            closed: false,
        }
    }

    /// A feed that never yields and holds no transport. It stays pending
    /// until closed.
    pub fn idle(kind: CollectionKind) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            kind,
            rx,
            release: None,
            keepalive: Some(tx),
            closed: false,
        }
    }

    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop receiving events and release the transport.
    pub fn close(&mut self) {
        self.closed = true;
        self.keepalive = None;
        self.rx.close();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Stream for ChangeFeed {
    type Item = ChangeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.close();
    }
}

/// Remote store adapter for the two catalog collections.
///
/// Field-name translation between records and storage rows happens inside
/// implementations, in both directions.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Whether credentials are present. An unconfigured store puts every
    /// collection in local-only mode.
    fn is_configured(&self) -> bool {
        true
    }

    /// All records of `kind`, in server order (newest first). Never partial.
    async fn fetch_all(&self, kind: CollectionKind) -> Result<Vec<Record>>;

    /// Insert a record. Any caller-provided id is stripped; the returned
    /// record carries the server-assigned id.
    async fn insert(&self, record: &Record) -> Result<Record>;

    /// Replace the fields of record `id` with those of `record`.
    async fn update(&self, id: &str, record: &Record) -> Result<()>;

    /// Delete record `id`. Success does not prove that a row existed.
    async fn remove(&self, kind: CollectionKind, id: &str) -> Result<()>;

    /// Open a change notification channel for `kind`.
    async fn watch(&self, kind: CollectionKind) -> Result<ChangeFeed>;
}

/// Store used when no credentials are available.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredStore;

#[async_trait]
impl RemoteStore for UnconfiguredStore {
    fn is_configured(&self) -> bool {
        false
    }

    async fn fetch_all(&self, _kind: CollectionKind) -> Result<Vec<Record>> {
        Err(StoreError::NotConfigured)
    }

    async fn insert(&self, _record: &Record) -> Result<Record> {
        Err(StoreError::NotConfigured)
    }

    async fn update(&self, _id: &str, _record: &Record) -> Result<()> {
        Err(StoreError::NotConfigured)
    }

    async fn remove(&self, _kind: CollectionKind, _id: &str) -> Result<()> {
        Err(StoreError::NotConfigured)
    }

    async fn watch(&self, _kind: CollectionKind) -> Result<ChangeFeed> {
        Err(StoreError::NotConfigured)
    }
}

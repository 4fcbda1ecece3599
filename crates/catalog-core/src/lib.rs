//! catalog-core: Realtime synchronization of the AI tools catalog.
//!
//! This crate provides the core functionality for:
//! - Tool and news records, and their storage-row translation
//! - The `RemoteStore` trait plus in-process implementations
//! - Keeping local collection snapshots in sync with the remote store
//! - Optimistic mutations with exact rollback
//! - Typed view bindings and derived catalog views

pub mod binding;
pub mod catalog;
pub mod coordinator;
pub mod events;
pub mod field_map;
pub mod memory_store;
pub mod record;
pub mod snapshot;
pub mod store;
pub mod synchronizer;

pub use binding::CollectionView;
pub use catalog::{ToolCollections, ToolFilter, CATEGORIES};
pub use coordinator::{MutationCoordinator, MutationTarget, PendingMutation};
pub use events::{CatalogEvent, EventBus, MutationOp, SnapshotOrigin, Subscription};
pub use field_map::{FieldMap, FieldMapError, Row};
pub use memory_store::{InMemoryStore, StoreOp};
pub use record::{CatalogRecord, CollectionKind, NewsArticle, Record, Role, Tool, UserProfile};
pub use snapshot::Snapshot;
pub use store::{ChangeEvent, ChangeFeed, RemoteStore, StoreError, UnconfiguredStore};
pub use synchronizer::{CollectionSynchronizer, Phase, SubscriptionHandle};

//! View binding: connects a renderer to one collection.
//!
//! A `CollectionView` subscribes to the synchronizer, converts each published
//! snapshot to typed records, keeps the latest rendered list, and calls the
//! render callback once per publish.

use std::sync::{Arc, RwLock};

use crate::record::CatalogRecord;
use crate::snapshot::Snapshot;
use crate::synchronizer::{CollectionSynchronizer, SubscriptionHandle};

struct Rendered<R> {
    seq: u64,
    items: Arc<Vec<R>>,
}

/// Typed, render-on-publish view of one collection.
pub struct CollectionView<R: CatalogRecord> {
    latest: Arc<RwLock<Rendered<R>>>,
    handle: SubscriptionHandle,
}

impl<R: CatalogRecord> CollectionView<R> {
    /// Bind `render` to the collection of `R`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(
        sync: &CollectionSynchronizer,
        render: impl Fn(&[R]) + Send + Sync + 'static,
    ) -> Self {
        let latest = Arc::new(RwLock::new(Rendered {
            seq: 0,
            items: Arc::new(Vec::new()),
        }));
        let target = Arc::clone(&latest);

        let handle = sync.subscribe(R::KIND, move |snapshot: &Snapshot| {
            let items: Arc<Vec<R>> = Arc::new(
                snapshot
                    .records()
                    .iter()
                    .filter_map(R::from_record)
                    .cloned()
                    .collect(),
            );
            {
                let mut rendered = target.write().unwrap_or_else(|e| e.into_inner());
                rendered.seq = snapshot.seq();
                rendered.items = Arc::clone(&items);
            }
            render(&items);
        });

        Self {
            latest,
            handle,
        }
    }

    /// The most recently rendered items.
    pub fn current(&self) -> Arc<Vec<R>> {
        Arc::clone(&self.latest.read().unwrap_or_else(|e| e.into_inner()).items)
    }

    /// Sequence number of the most recently rendered snapshot.
    pub fn rendered_seq(&self) -> u64 {
        self.latest.read().unwrap_or_else(|e| e.into_inner()).seq
    }

    pub fn is_bound(&self) -> bool {
        self.handle.is_active()
    }

    /// Stop rendering. Safe to call more than once.
    pub fn dispose(&mut self) {
        self.handle.dispose();
    }
}

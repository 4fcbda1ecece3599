//! catalog-daemon: hosted-store adapter for the AI tools catalog.
//!
//! Provides:
//! - `Config`: config file plus environment overrides
//! - `PostgrestStore`: the `RemoteStore` over the hosted REST endpoint
//! - `realtime`: change notifications over the Phoenix channel protocol

pub mod config;
pub mod postgrest;
pub mod realtime;

use std::sync::Arc;

use catalog_core::{RemoteStore, UnconfiguredStore};
use tracing::{info, warn};

pub use config::Config;
pub use postgrest::PostgrestStore;

/// Pick the store for `config`: the hosted store when a URL and key are set,
/// otherwise the unconfigured store, which puts collections in local mode.
pub fn store_from_config(config: &Config) -> anyhow::Result<Arc<dyn RemoteStore>> {
    match PostgrestStore::from_config(config)? {
        Some(store) => {
            info!(
                "Using hosted store (realtime {})",
                if store.realtime_enabled() { "on" } else { "off" }
            );
            Ok(Arc::new(store))
        }
        None => {
            warn!("Store URL or key missing, running in local-only mode");
            Ok(Arc::new(UnconfiguredStore))
        }
    }
}

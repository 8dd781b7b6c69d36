//! Cache coordinator: a single owner of the on-disk cache, reached only through
//! correlated request/reply messages.

mod client;
mod store;
pub mod worker;

pub use client::{CacheClient, CacheHit, CacheTimeouts};
pub use store::{CacheStore, ReconcileReport, StoreError};

use ferry_protocol::EntryClass;

use crate::config::{AssetKind, LoaderConfig};
use crate::error::CacheProtocolError;

pub fn class_for(kind: AssetKind) -> EntryClass {
    match kind {
        AssetKind::Runtime => EntryClass::Static,
        AssetKind::Model => EntryClass::Model,
    }
}

impl CacheTimeouts {
    pub fn from_config(cfg: &LoaderConfig) -> Self {
        Self {
            request: cfg.cache_request_timeout(),
            transfer: cfg.cache_transfer_timeout(),
        }
    }
}

/// Open the configured cache directory and serve it from a task in this process.
pub async fn open_in_process(cfg: &LoaderConfig) -> Result<CacheClient, CacheProtocolError> {
    let store = CacheStore::open(cfg.cache_dir(), &cfg.loader.cache_generation)
        .await
        .map_err(|e| CacheProtocolError::Unavailable(e.to_string()))?;
    Ok(CacheClient::in_process(store, CacheTimeouts::from_config(cfg)))
}

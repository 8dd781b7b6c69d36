use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;

use ferry_protocol::CacheSummary;

use crate::config::{AssetKind, SourceTier};
use crate::error::ErrorKind;

/// Where a single load is in its state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoadState {
    Idle,
    Checking,
    FetchingSource { index: usize, tier: SourceTier },
    Validating { index: usize },
    Storing,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One entry of the append-only attempt log.
#[derive(Debug, Clone, Serialize)]
pub struct LoadAttempt {
    pub asset_key: String,
    pub url: String,
    pub tier: SourceTier,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Milliseconds since the orchestrator was created.
    pub at_ms: u64,
    pub elapsed_ms: u64,
}

impl LoadAttempt {
    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

/// A resolved asset: the bytes plus where they came from.
#[derive(Clone)]
pub struct LoadedAsset {
    pub key: String,
    pub kind: AssetKind,
    pub bytes: Bytes,
    pub source_url: String,
    pub tier: SourceTier,
    pub from_cache: bool,
    /// Set when this asset stands in for a model whose sources were exhausted.
    pub substituted_for: Option<String>,
}

impl fmt::Debug for LoadedAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedAsset")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("len", &self.bytes.len())
            .field("source_url", &self.source_url)
            .field("tier", &self.tier)
            .field("from_cache", &self.from_cache)
            .field("substituted_for", &self.substituted_for)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveLoad {
    pub key: String,
    #[serde(flatten)]
    pub state: LoadState,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoaderStatus {
    pub loaded_keys: Vec<String>,
    pub active_loads: Vec<ActiveLoad>,
    pub attempts: Vec<LoadAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_summary: Option<CacheSummary>,
    pub offline_ready: bool,
}

impl LoaderStatus {
    pub fn attempts_for<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a LoadAttempt> + 'a {
        self.attempts.iter().filter(move |a| a.asset_key == key)
    }
}

pub(crate) type ActiveTable = Mutex<HashMap<String, LoadState>>;

/// Keeps a key's entry in the active table for as long as it lives.
pub(crate) struct ActiveGuard<'a> {
    table: &'a ActiveTable,
    key: String,
}

impl<'a> ActiveGuard<'a> {
    pub(crate) fn enter(table: &'a ActiveTable, key: &str) -> Self {
        table.lock().insert(key.to_string(), LoadState::Checking);
        Self {
            table,
            key: key.to_string(),
        }
    }

    pub(crate) fn set(&self, state: LoadState) {
        self.table.lock().insert(self.key.clone(), state);
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.table.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_state_until_dropped() {
        let table = ActiveTable::default();
        {
            let guard = ActiveGuard::enter(&table, "m");
            assert_eq!(table.lock().get("m"), Some(&LoadState::Checking));
            guard.set(LoadState::FetchingSource {
                index: 1,
                tier: SourceTier::RemoteSecondary,
            });
            assert!(matches!(
                table.lock().get("m"),
                Some(LoadState::FetchingSource { index: 1, .. })
            ));
        }
        assert!(table.lock().is_empty());
    }

    #[test]
    fn state_serializes_with_tag() {
        let value = serde_json::to_value(LoadState::FetchingSource {
            index: 2,
            tier: SourceTier::Local,
        })
        .unwrap();
        assert_eq!(
            value,
            serde_json::json!({"state": "fetching_source", "index": 2, "tier": "local"})
        );
    }
}

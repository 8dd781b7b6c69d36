//! The loader façade.
//!
//! One [`Orchestrator`] owns every piece of cross-call state: the flight table,
//! the probe cache (inside the resolver), the loaded markers and the attempt log.
//! Nothing here is process-global, so independent orchestrators never interfere.

mod chain;
mod status;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ferry_protocol::{CacheNotice, ClearScope};

use crate::cache::{self, CacheClient};
use crate::config::{AssetKind, LoaderConfig, SourceTier};
use crate::downloader::Downloader;
use crate::error::{CacheProtocolError, LoadError, LoadResult};
use crate::http_client;
use crate::integrity::IntegrityValidator;
use crate::progress::ProgressUpdate;
use crate::resolver::SourceResolver;
use crate::retry::RetryPolicy;
use crate::singleflight::Singleflight;

pub use status::{ActiveLoad, AttemptOutcome, LoadAttempt, LoadState, LoadedAsset, LoaderStatus};

use status::ActiveTable;

const PROGRESS_DEPTH: usize = 256;

/// Reachability of one configured source, as reported by [`Orchestrator::probe_sources`].
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub url: String,
    pub tier: SourceTier,
    pub admitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reachable: Option<bool>,
}

pub struct Orchestrator {
    config: LoaderConfig,
    validator: IntegrityValidator,
    resolver: SourceResolver,
    downloader: Downloader,
    cache: Option<CacheClient>,
    flights: Singleflight<LoadResult<LoadedAsset>>,
    loaded: RwLock<HashMap<String, LoadedAsset>>,
    refetched: Mutex<HashSet<String>>,
    bypass_cache: Mutex<HashSet<String>>,
    active: ActiveTable,
    attempts: Mutex<Vec<LoadAttempt>>,
    progress_tx: broadcast::Sender<ProgressUpdate>,
    cancel: Mutex<CancellationToken>,
    started: Instant,
}

impl Orchestrator {
    pub fn new(config: LoaderConfig, cache: Option<CacheClient>) -> LoadResult<Self> {
        config.validate()?;
        let origin = config.origin_url()?;
        let client = http_client::build_client(config.connect_timeout())?;
        let validator = IntegrityValidator::new(origin, &config.integrity, config.bundle_dir());
        let resolver =
            SourceResolver::new(client.clone(), config.probe_timeout(), config.probe_ttl());
        let downloader = Downloader::new(
            client,
            RetryPolicy::from_config(&config),
            config.loader.size_tolerance,
        );
        let (progress_tx, _) = broadcast::channel(PROGRESS_DEPTH);
        Ok(Self {
            config,
            validator,
            resolver,
            downloader,
            cache,
            flights: Singleflight::default(),
            loaded: RwLock::new(HashMap::new()),
            refetched: Mutex::new(HashSet::new()),
            bypass_cache: Mutex::new(HashSet::new()),
            active: ActiveTable::default(),
            attempts: Mutex::new(Vec::new()),
            progress_tx,
            cancel: Mutex::new(CancellationToken::new()),
            started: Instant::now(),
        })
    }

    /// Build with an in-process cache coordinator on the configured directory.
    /// A cache that cannot be opened is logged and the orchestrator runs without one.
    pub async fn from_config(config: LoaderConfig) -> LoadResult<Self> {
        let cache = match cache::open_in_process(&config).await {
            Ok(client) => Some(client),
            Err(err) => {
                warn!(target: "ferry::cache", "persistent cache unavailable, continuing without it: {err}");
                None
            }
        };
        match cache {
            Some(cache) => Self::with_cache(config, cache),
            None => Self::new(config, None),
        }
    }

    /// Build on an already connected coordinator, in-process or a worker child,
    /// and log the notices it pushes. Must be called inside a tokio runtime.
    pub fn with_cache(config: LoaderConfig, cache: CacheClient) -> LoadResult<Self> {
        let orchestrator = Self::new(config, Some(cache))?;
        orchestrator.log_cache_notices();
        Ok(orchestrator)
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&CacheClient> {
        self.cache.as_ref()
    }

    /// Resolve `key` to bytes, joining an in-flight load for the same key if there is one.
    ///
    /// A model whose sources are exhausted is replaced by the smallest other model
    /// variant. The substitute loads under its own flight, entered only after the
    /// failed flight has settled, so two models standing in for each other never
    /// wait on one another.
    pub async fn ensure_loaded(&self, key: &str) -> LoadResult<LoadedAsset> {
        let asset = self
            .config
            .asset(key)
            .ok_or_else(|| LoadError::UnknownAsset { key: key.to_string() })?;
        match self.flight(key, || self.run_session(asset)).await {
            Err(LoadError::AggregateSourceFailure { attempts, .. })
                if asset.kind == AssetKind::Model && self.config.loader.model_fallback =>
            {
                self.substitute(asset, attempts).await
            }
            other => other,
        }
    }

    /// Ensure `key`, then run `check` on the result. A failed check invalidates the
    /// asset and permits one re-fetch; a second failure is fatal.
    pub async fn ensure_healthy<F>(&self, key: &str, check: F) -> LoadResult<LoadedAsset>
    where
        F: Fn(&LoadedAsset) -> bool,
    {
        let first = self.ensure_loaded(key).await?;
        if check(&first) {
            return Ok(first);
        }
        warn!(target: "ferry::loader", asset = key, "health check failed; re-fetching");
        self.invalidate(key)?;
        let second = self.ensure_loaded(key).await?;
        if check(&second) {
            Ok(second)
        } else {
            error!(target: "ferry::loader", asset = key, "health check failed after re-fetch");
            Err(LoadError::Unhealthy { key: key.to_string() })
        }
    }

    /// Evict the loaded marker for `key` and force the next load past the cache.
    /// Allowed once per key per orchestrator; the second call is [`LoadError::StaleAsset`].
    pub fn invalidate(&self, key: &str) -> LoadResult<()> {
        if self.config.asset(key).is_none() {
            return Err(LoadError::UnknownAsset { key: key.to_string() });
        }
        if !self.refetched.lock().insert(key.to_string()) {
            error!(target: "ferry::loader", asset = key, "asset went stale after its re-fetch");
            return Err(LoadError::StaleAsset { key: key.to_string() });
        }
        self.loaded.write().remove(key);
        self.bypass_cache.lock().insert(key.to_string());
        info!(target: "ferry::loader", asset = key, "asset invalidated");
        Ok(())
    }

    /// Cancel every in-flight load. Later calls start with a fresh token.
    pub fn abort_all(&self) {
        let previous = std::mem::replace(&mut *self.cancel.lock(), CancellationToken::new());
        previous.cancel();
        warn!(target: "ferry::loader", "all in-flight loads aborted");
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.progress_tx.subscribe()
    }

    /// Forward progress updates to `callback` from a background task.
    pub fn on_progress<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(ProgressUpdate) + Send + 'static,
    {
        let mut rx = self.subscribe_progress();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) => callback(update),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(target: "ferry::progress", skipped, "progress observer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn state(&self, key: &str) -> LoadState {
        if let Some(state) = self.active.lock().get(key) {
            return state.clone();
        }
        if self.loaded.read().contains_key(key) {
            LoadState::Ready
        } else {
            LoadState::Idle
        }
    }

    pub async fn get_status(&self) -> LoaderStatus {
        let mut loaded_keys: Vec<String> = self.loaded.read().keys().cloned().collect();
        loaded_keys.sort();
        let mut active_loads: Vec<ActiveLoad> = self
            .active
            .lock()
            .iter()
            .map(|(key, state)| ActiveLoad {
                key: key.clone(),
                state: state.clone(),
            })
            .collect();
        active_loads.sort_by(|a, b| a.key.cmp(&b.key));
        let attempts = self.attempts.lock().clone();
        let (cache_summary, offline_ready) = match &self.cache {
            Some(cache) => {
                let summary = match cache.status().await {
                    Ok(summary) => Some(summary),
                    Err(err) => {
                        warn!(target: "ferry::cache", "cache status unavailable: {err}");
                        None
                    }
                };
                (summary, cache.is_offline_ready())
            }
            None => (None, false),
        };
        LoaderStatus {
            loaded_keys,
            active_loads,
            attempts,
            cache_summary,
            offline_ready,
        }
    }

    /// Clear the whole persistent cache; returns the number of entries removed.
    pub async fn clear_cache(&self) -> LoadResult<u64> {
        self.clear_cache_scope(ClearScope::All).await
    }

    pub async fn clear_cache_scope(&self, scope: ClearScope) -> LoadResult<u64> {
        let cache = self.cache.as_ref().ok_or_else(|| {
            CacheProtocolError::Unavailable("no cache coordinator attached".into())
        })?;
        let removed = cache.clear(scope).await?;
        info!(target: "ferry::cache", removed, "persistent cache cleared");
        Ok(removed)
    }

    pub fn validate_url(&self, url: &str) -> bool {
        self.validator.validate(url)
    }

    /// Admission and reachability of every configured source of `key`, without downloading.
    pub async fn probe_sources(&self, key: &str) -> LoadResult<Vec<SourceReport>> {
        let asset = self
            .config
            .asset(key)
            .ok_or_else(|| LoadError::UnknownAsset { key: key.to_string() })?;
        let mut reports = Vec::new();
        for candidate in self.resolver.resolve_candidates(asset) {
            let report = match self.validator.assess(&candidate) {
                Ok(source) => SourceReport {
                    url: candidate.url.clone(),
                    tier: candidate.tier,
                    admitted: true,
                    rejection: None,
                    reachable: Some(self.resolver.probe(&source).await.is_available()),
                },
                Err(err) => SourceReport {
                    url: candidate.url.clone(),
                    tier: candidate.tier,
                    admitted: false,
                    rejection: Some(err.to_string()),
                    reachable: None,
                },
            };
            reports.push(report);
        }
        Ok(reports)
    }

    /// Run `work` as the single flight for `key`, or share the outcome of the one
    /// already running. If the leader goes away without an outcome, a waiting
    /// caller takes over.
    async fn flight<F, Fut>(&self, key: &str, work: F) -> LoadResult<LoadedAsset>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LoadResult<LoadedAsset>>,
    {
        let mut guard = loop {
            if let Some(done) = self.loaded_marker(key) {
                return Ok(done);
            }
            let guard = self.flights.begin(key);
            if guard.is_leader() {
                break guard;
            }
            debug!(target: "ferry::loader", asset = key, "joining in-flight load");
            if let Some(result) = guard.wait().await {
                return result;
            }
        };
        // A flight may have settled between the marker check and `begin`.
        let result = match self.loaded_marker(key) {
            Some(done) => Ok(done),
            None => work().await,
        };
        guard.complete(result.clone());
        result
    }

    fn loaded_marker(&self, key: &str) -> Option<LoadedAsset> {
        self.loaded.read().get(key).cloned()
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    fn log_cache_notices(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let mut notices = cache.subscribe();
        if cache.is_offline_ready() {
            info!(target: "ferry::cache", "cache coordinator ready for offline use");
        }
        // Notices are informational; the orchestrator reads state through requests.
        tokio::spawn(async move {
            loop {
                match notices.recv().await {
                    Ok(CacheNotice::OfflineReady {
                        generation,
                        entries,
                    }) => {
                        debug!(target: "ferry::cache", %generation, entries, "offline ready");
                    }
                    Ok(CacheNotice::CacheUpdated {
                        url,
                        size_bytes,
                        class,
                    }) => {
                        debug!(target: "ferry::cache", %url, size_bytes, class = class.as_str(), "cache updated");
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

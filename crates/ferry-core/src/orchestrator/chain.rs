//! The per-asset state machine: cache check, then ordered source fallback.

use std::time::Instant;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ferry_protocol::ClearScope;

use super::status::{ActiveGuard, AttemptOutcome, LoadAttempt, LoadState, LoadedAsset};
use super::Orchestrator;
use crate::cache::class_for;
use crate::config::{AssetDescriptor, AssetKind, SourceCandidate};
use crate::error::{ConfigError, IntegrityError, LoadError, LoadResult, NetworkErrorKind};
use crate::integrity::{SourceLocation, ValidatedSource};
use crate::progress::{Phase, ProgressAggregator};
use crate::resolver::ProbeOutcome;

/// Cache key for a remote source: its absolute URL.
fn cache_key(source: &ValidatedSource) -> Option<String> {
    match &source.location {
        SourceLocation::Remote(url) => Some(url.to_string()),
        SourceLocation::Local(_) => None,
    }
}

impl Orchestrator {
    /// One `ensure_loaded` session as its flight leader: runtime first for models,
    /// then the asset itself.
    pub(super) async fn run_session(&self, asset: &AssetDescriptor) -> LoadResult<LoadedAsset> {
        let cancel = self.cancel_token();
        let phases = self.config.session_phases(asset.kind);
        let first_phase = phases.first().map(|p| p.phase).unwrap_or(Phase::Model);
        let mut progress =
            ProgressAggregator::new(&asset.key, phases, self.config.progress_min_interval())
                .with_sink(self.progress_tx.clone());
        progress.report(first_phase, 0.0, "Checking cache");

        let result = match asset.kind {
            AssetKind::Runtime => self.run_chain(asset, &mut progress, &cancel).await,
            AssetKind::Model => self.run_model(asset, &mut progress, &cancel).await,
        };
        match &result {
            Ok(loaded) => {
                progress.complete("Ready");
                info!(
                    target: "ferry::loader",
                    asset = %asset.key,
                    tier = loaded.tier.as_str(),
                    from_cache = loaded.from_cache,
                    "asset ready"
                );
            }
            Err(err) => {
                error!(target: "ferry::loader", asset = %asset.key, kind = err.kind().as_str(), "load failed: {err}");
            }
        }
        result
    }

    async fn run_model(
        &self,
        asset: &AssetDescriptor,
        progress: &mut ProgressAggregator,
        cancel: &CancellationToken,
    ) -> LoadResult<LoadedAsset> {
        let runtime = self.config.runtime_asset().ok_or_else(|| {
            ConfigError::Invalid(format!("model `{}` needs a runtime asset", asset.key))
        })?;
        self.flight(&runtime.key, || self.run_chain(runtime, &mut *progress, cancel))
            .await?;
        progress.report(Phase::Runtime, 100.0, "Runtime ready");
        self.run_chain(asset, progress, cancel).await
    }

    /// Stand the smallest other model variant in for `asset` after its own chain
    /// failed with `attempts` failures. The substitute never substitutes again.
    pub(super) async fn substitute(
        &self,
        asset: &AssetDescriptor,
        attempts: usize,
    ) -> LoadResult<LoadedAsset> {
        let Some(alternative) = self.config.smallest_model_excluding(&asset.key) else {
            return Err(LoadError::AggregateSourceFailure {
                asset: asset.key.clone(),
                attempts,
                substitute: None,
            });
        };
        warn!(
            target: "ferry::loader",
            asset = %asset.key,
            substitute = %alternative.key,
            "all sources exhausted; substituting the smallest model variant"
        );
        let substituted = self
            .flight(&alternative.key, || self.run_session(alternative))
            .await;
        match substituted {
            Ok(mut loaded) => {
                loaded.substituted_for = Some(asset.key.clone());
                Ok(loaded)
            }
            Err(LoadError::AggregateSourceFailure {
                attempts: more, ..
            }) => Err(LoadError::AggregateSourceFailure {
                asset: asset.key.clone(),
                attempts: attempts + more,
                substitute: Some(alternative.key.clone()),
            }),
            Err(err) => Err(err),
        }
    }

    /// Cache check, then every candidate in order until one yields verified bytes.
    pub(super) async fn run_chain(
        &self,
        asset: &AssetDescriptor,
        progress: &mut ProgressAggregator,
        cancel: &CancellationToken,
    ) -> LoadResult<LoadedAsset> {
        let phase = Phase::from(asset.kind);
        if let Some(done) = self.loaded_marker(&asset.key) {
            progress.report(phase, 100.0, &format!("{} already loaded", asset.filename));
            return Ok(done);
        }
        let bypass_cache = self.bypass_cache.lock().remove(&asset.key);
        let tracker = ActiveGuard::enter(&self.active, &asset.key);

        let candidates = self.resolver.resolve_candidates(asset);
        let assessed: Vec<Result<ValidatedSource, IntegrityError>> =
            candidates.iter().map(|c| self.validator.assess(c)).collect();

        if !bypass_cache {
            if let Some(hit) = self.cache_pass(asset, &assessed, cancel).await {
                progress.report(phase, 100.0, &format!("{} restored from cache", asset.filename));
                self.mark_loaded(&hit);
                tracker.set(LoadState::Ready);
                return Ok(hit);
            }
        } else {
            debug!(target: "ferry::loader", asset = %asset.key, "cache bypassed after invalidation");
        }

        let mut failures = 0usize;
        for (index, (candidate, assessed)) in candidates.iter().zip(assessed).enumerate() {
            if cancel.is_cancelled() {
                return Err(LoadError::aborted(&candidate.url));
            }
            let started = Instant::now();
            let source = match assessed {
                Ok(source) => source,
                Err(err) => {
                    failures += 1;
                    self.record_failure(asset, candidate, started, &LoadError::from(err));
                    continue;
                }
            };
            if source.is_remote() && self.config.loader.probe_before_fetch {
                let err = match self.resolver.probe(&source).await {
                    ProbeOutcome::Available => None,
                    ProbeOutcome::Status(status) => Some(LoadError::Http {
                        status,
                        url: candidate.url.clone(),
                    }),
                    ProbeOutcome::Unreachable => Some(LoadError::network(
                        NetworkErrorKind::Connect,
                        candidate.url.clone(),
                        "source unreachable (probe failed)",
                    )),
                };
                if let Some(err) = err {
                    failures += 1;
                    self.record_failure(asset, candidate, started, &err);
                    continue;
                }
            }

            tracker.set(LoadState::FetchingSource {
                index,
                tier: candidate.tier,
            });
            let message = format!("Downloading {} ({})", asset.filename, candidate.tier.as_str());
            progress.report(phase, 0.0, &message);
            let deadline = self.config.deadline_for(asset, candidate.tier);
            let fetched = self
                .downloader
                .fetch(&source, deadline, cancel, |chunk| {
                    progress.report(phase, chunk.percent(), &message);
                })
                .await;
            let verified = fetched.and_then(|bytes| {
                tracker.set(LoadState::Validating { index });
                self.downloader
                    .verify(&source, asset.expected_size_bytes, &bytes)
                    .map(|()| bytes)
            });

            match verified {
                Ok(bytes) => {
                    self.record(asset, candidate, started, None);
                    if let Some(key) = cache_key(&source) {
                        tracker.set(LoadState::Storing);
                        self.store_in_cache(asset, &key, bytes.clone(), cancel).await;
                    }
                    let loaded = LoadedAsset {
                        key: asset.key.clone(),
                        kind: asset.kind,
                        bytes,
                        source_url: source.display_location(),
                        tier: candidate.tier,
                        from_cache: false,
                        substituted_for: None,
                    };
                    self.mark_loaded(&loaded);
                    tracker.set(LoadState::Ready);
                    progress.report(phase, 100.0, &format!("{} ready", asset.filename));
                    return Ok(loaded);
                }
                Err(err) if err.is_aborted() => {
                    self.record(asset, candidate, started, Some(&err));
                    return Err(err);
                }
                Err(err) => {
                    failures += 1;
                    tracker.set(LoadState::Failed);
                    self.record_failure(asset, candidate, started, &err);
                    if source.is_remote() {
                        match err {
                            LoadError::Http { status, .. } => {
                                self.resolver
                                    .remember(source.url(), ProbeOutcome::Status(status))
                                    .await
                            }
                            _ => self.resolver.mark_unavailable(source.url()).await,
                        }
                    }
                }
            }
        }
        tracker.set(LoadState::Failed);
        Err(LoadError::AggregateSourceFailure {
            asset: asset.key.clone(),
            attempts: failures,
            substitute: None,
        })
    }

    /// Look up every admitted remote candidate. A hit that fails verification is
    /// evicted and treated as a miss; coordinator errors end the pass as a miss.
    async fn cache_pass(
        &self,
        asset: &AssetDescriptor,
        assessed: &[Result<ValidatedSource, IntegrityError>],
        cancel: &CancellationToken,
    ) -> Option<LoadedAsset> {
        let cache = self.cache.as_ref()?;
        for source in assessed.iter().filter_map(|r| r.as_ref().ok()) {
            let Some(key) = cache_key(source) else {
                continue;
            };
            let lookup = tokio::select! {
                _ = cancel.cancelled() => return None,
                res = cache.lookup(&key) => res,
            };
            match lookup {
                Ok(Some(hit)) => {
                    match self
                        .downloader
                        .verify(source, asset.expected_size_bytes, &hit.bytes)
                    {
                        Ok(()) => {
                            info!(target: "ferry::cache", asset = %asset.key, url = %key, "cache hit");
                            return Some(LoadedAsset {
                                key: asset.key.clone(),
                                kind: asset.kind,
                                bytes: hit.bytes,
                                source_url: key,
                                tier: source.candidate.tier,
                                from_cache: true,
                                substituted_for: None,
                            });
                        }
                        Err(err) => {
                            warn!(target: "ferry::cache", asset = %asset.key, url = %key, "cached copy rejected: {err}");
                            if let Err(err) = cache.clear(ClearScope::Url(key)).await {
                                warn!(target: "ferry::cache", "evicting rejected entry failed: {err}");
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(target: "ferry::cache", asset = %asset.key, "cache lookup failed, treating as miss: {err}");
                    return None;
                }
            }
        }
        None
    }

    async fn store_in_cache(
        &self,
        asset: &AssetDescriptor,
        key: &str,
        bytes: Bytes,
        cancel: &CancellationToken,
    ) {
        let Some(cache) = &self.cache else {
            return;
        };
        let stored = tokio::select! {
            _ = cancel.cancelled() => return,
            res = cache.store(key, bytes, class_for(asset.kind)) => res,
        };
        match stored {
            Ok(()) => debug!(target: "ferry::cache", asset = %asset.key, url = key, "stored in cache"),
            Err(err) => warn!(target: "ferry::cache", asset = %asset.key, url = key, "cache store failed: {err}"),
        }
    }

    fn mark_loaded(&self, loaded: &LoadedAsset) {
        self.loaded
            .write()
            .insert(loaded.key.clone(), loaded.clone());
    }

    fn record_failure(
        &self,
        asset: &AssetDescriptor,
        candidate: &SourceCandidate,
        started: Instant,
        err: &LoadError,
    ) {
        warn!(
            target: "ferry::loader",
            asset = %asset.key,
            url = %candidate.url,
            tier = candidate.tier.as_str(),
            kind = err.kind().as_str(),
            "source failed: {err}"
        );
        self.record(asset, candidate, started, Some(err));
    }

    fn record(
        &self,
        asset: &AssetDescriptor,
        candidate: &SourceCandidate,
        started: Instant,
        err: Option<&LoadError>,
    ) {
        let attempt = LoadAttempt {
            asset_key: asset.key.clone(),
            url: candidate.url.clone(),
            tier: candidate.tier,
            outcome: if err.is_some() {
                AttemptOutcome::Failure
            } else {
                AttemptOutcome::Success
            },
            error_kind: err.map(LoadError::kind),
            message: err.map(ToString::to_string),
            at_ms: started.saturating_duration_since(self.started).as_millis() as u64,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        self.attempts.lock().push(attempt);
    }
}

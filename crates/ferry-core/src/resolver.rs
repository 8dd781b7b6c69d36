//! Candidate resolution and reachability probes.
//!
//! Probe results are memoised per URL for the configured TTL so repeated
//! loads within a session do not re-probe the same mirror.

use std::time::Duration;

use moka::future::Cache;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use tracing::debug;

use crate::config::{AssetDescriptor, SourceCandidate};
use crate::integrity::{SourceLocation, ValidatedSource};

const MAX_PROBE_ENTRIES: u64 = 4096;

/// What a reachability probe observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Available,
    /// The mirror answered with a non-success status.
    Status(u16),
    Unreachable,
}

impl ProbeOutcome {
    pub fn is_available(&self) -> bool {
        matches!(self, ProbeOutcome::Available)
    }
}

#[derive(Clone)]
pub struct SourceResolver {
    client: reqwest::Client,
    probe_timeout: Duration,
    probes: Cache<String, ProbeOutcome>,
}

impl SourceResolver {
    pub fn new(client: reqwest::Client, probe_timeout: Duration, probe_ttl: Duration) -> Self {
        let probes = Cache::builder()
            .max_capacity(MAX_PROBE_ENTRIES)
            .time_to_live(probe_ttl)
            .build();
        Self {
            client,
            probe_timeout,
            probes,
        }
    }

    /// Candidates for `asset` in fallback order: primary, secondary, local.
    pub fn resolve_candidates(&self, asset: &AssetDescriptor) -> Vec<SourceCandidate> {
        asset.sources.clone()
    }

    /// Reachability of the source. Local sources are always considered available;
    /// their absence surfaces when they are read.
    pub async fn probe(&self, source: &ValidatedSource) -> ProbeOutcome {
        let url = match &source.location {
            SourceLocation::Local(_) => return ProbeOutcome::Available,
            SourceLocation::Remote(url) => url.clone(),
        };
        let key = source.url().to_string();
        let client = self.client.clone();
        let timeout = self.probe_timeout;
        self.probes
            .get_with(key, async move { probe_remote(&client, url, timeout).await })
            .await
    }

    /// Remember that a source failed mid-session so later loads skip it until the TTL lapses.
    pub async fn mark_unavailable(&self, url: &str) {
        self.remember(url, ProbeOutcome::Unreachable).await;
    }

    /// Overwrite the cached outcome for `url`, e.g. with a status seen mid-download.
    pub async fn remember(&self, url: &str, outcome: ProbeOutcome) {
        self.probes.insert(url.to_string(), outcome).await;
    }

    pub async fn cached_probe(&self, url: &str) -> Option<ProbeOutcome> {
        self.probes.get(url).await
    }
}

async fn probe_remote(client: &reqwest::Client, url: url::Url, timeout: Duration) -> ProbeOutcome {
    match client.head(url.clone()).timeout(timeout).send().await {
        Ok(resp) if resp.status().is_success() => ProbeOutcome::Available,
        // Some static hosts refuse HEAD; ask for a single byte instead.
        Ok(resp)
            if matches!(
                resp.status(),
                StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
            ) =>
        {
            match client
                .get(url.clone())
                .header(RANGE, "bytes=0-0")
                .timeout(timeout)
                .send()
                .await
            {
                Ok(resp) => status_outcome(resp.status()),
                Err(err) => {
                    debug!(target: "ferry::probe", %url, "ranged probe failed: {err}");
                    ProbeOutcome::Unreachable
                }
            }
        }
        Ok(resp) => {
            debug!(target: "ferry::probe", %url, status = resp.status().as_u16(), "probe rejected");
            status_outcome(resp.status())
        }
        Err(err) => {
            debug!(target: "ferry::probe", %url, "probe failed: {err}");
            ProbeOutcome::Unreachable
        }
    }
}

fn status_outcome(status: StatusCode) -> ProbeOutcome {
    if status.is_success() {
        ProbeOutcome::Available
    } else {
        ProbeOutcome::Status(status.as_u16())
    }
}

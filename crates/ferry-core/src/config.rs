use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use jsonschema::{validator_for, Validator};
use once_cell::sync::OnceCell;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::integrity::IntegrityHash;
use crate::progress::{Phase, PhaseWeight};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Runtime,
    Model,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Runtime => "runtime",
            AssetKind::Model => "model",
        }
    }
}

/// Fallback position of a source. Declaration order is the fallback order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum SourceTier {
    RemotePrimary,
    RemoteSecondary,
    Local,
}

impl SourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTier::RemotePrimary => "remote-primary",
            SourceTier::RemoteSecondary => "remote-secondary",
            SourceTier::Local => "local",
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, SourceTier::Local)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SourceCandidate {
    pub url: String,
    pub tier: SourceTier,
    /// Subresource-integrity value such as `sha384-<base64>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AssetDescriptor {
    pub key: String,
    pub kind: AssetKind,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size_bytes: Option<u64>,
    #[serde(default)]
    pub priority_tier: u8,
    /// Input resolution for model variants, e.g. `[640, 640]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Vec<u32>>,
    /// Per-attempt deadline override for this asset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub sources: Vec<SourceCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LoaderSettings {
    /// Origin the application is served from; relative sources resolve against it.
    pub origin: Option<String>,
    /// Directory holding the bundled copies referenced by `local` sources.
    pub bundle_dir: String,
    pub cache_dir: Option<String>,
    pub cache_generation: String,
    /// Key of the runtime asset loaded ahead of every model.
    pub runtime_asset: Option<String>,
    pub default_model: Option<String>,
    pub size_tolerance: f64,
    pub download_timeout_ms: u64,
    pub local_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub probe_ttl_secs: u64,
    pub probe_before_fetch: bool,
    pub send_retries: u32,
    pub retry_backoff_ms: u64,
    pub cache_request_timeout_ms: u64,
    pub cache_transfer_timeout_ms: u64,
    pub progress_min_interval_ms: u64,
    pub model_fallback: bool,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            origin: None,
            bundle_dir: "assets".into(),
            cache_dir: None,
            cache_generation: "v1".into(),
            runtime_asset: None,
            default_model: None,
            size_tolerance: 0.10,
            download_timeout_ms: 30_000,
            local_timeout_ms: 30_000,
            connect_timeout_ms: 3_000,
            probe_timeout_ms: 5_000,
            probe_ttl_secs: 300,
            probe_before_fetch: true,
            send_retries: 1,
            retry_backoff_ms: 250,
            cache_request_timeout_ms: 5_000,
            cache_transfer_timeout_ms: 60_000,
            progress_min_interval_ms: 100,
            model_fallback: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct IntegritySettings {
    /// Hosts allowed to serve cross-origin sources (https only).
    pub trusted_hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ProgressSettings {
    pub phases: Vec<PhaseWeight>,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            phases: vec![
                PhaseWeight {
                    phase: Phase::Runtime,
                    weight: 20,
                },
                PhaseWeight {
                    phase: Phase::Model,
                    weight: 80,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LoaderConfig {
    #[serde(default)]
    pub loader: LoaderSettings,
    #[serde(default)]
    pub integrity: IntegritySettings,
    #[serde(default)]
    pub progress: ProgressSettings,
    #[serde(default)]
    pub assets: Vec<AssetDescriptor>,
}

fn schema_validator() -> Result<&'static Validator, ConfigError> {
    static VALIDATOR: OnceCell<Validator> = OnceCell::new();
    VALIDATOR.get_or_try_init(|| {
        let schema = serde_json::to_value(schemars::schema_for!(LoaderConfig))
            .map_err(|e| ConfigError::Invalid(format!("schema generation failed: {e}")))?;
        validator_for(&schema).map_err(|e| ConfigError::Invalid(format!("invalid schema: {e}")))
    })
}

/// JSON schema of the configuration file.
pub fn config_schema_json() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(LoaderConfig)).unwrap_or_default()
}

pub fn load_config(path: impl AsRef<Path>) -> Result<LoaderConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let mut cfg = LoaderConfig::from_toml_str(&content)?;
    cfg.apply_env();
    cfg.validate()?;
    Ok(cfg)
}

impl LoaderConfig {
    /// Parse and schema-check a TOML document. Semantic checks run in [`Self::validate`].
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: toml::Value =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let json_value =
            serde_json::to_value(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let errors: Vec<String> = schema_validator()?
            .iter_errors(&json_value)
            .map(|e| e.to_string())
            .collect();
        if !errors.is_empty() {
            return Err(ConfigError::Schema(errors));
        }
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `FERRY_*` overrides through `lookup`; unparsable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let num = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        let l = &mut self.loader;
        if let Some(dir) = lookup("FERRY_CACHE_DIR").filter(|s| !s.trim().is_empty()) {
            l.cache_dir = Some(dir);
        }
        if let Some(generation) = lookup("FERRY_CACHE_GENERATION").filter(|s| !s.trim().is_empty())
        {
            l.cache_generation = generation;
        }
        if let Some(ms) = num("FERRY_DOWNLOAD_TIMEOUT_MS") {
            l.download_timeout_ms = ms;
        }
        if let Some(ms) = num("FERRY_PROBE_TIMEOUT_MS") {
            l.probe_timeout_ms = ms;
        }
        if let Some(secs) = num("FERRY_PROBE_TTL_SECS") {
            l.probe_ttl_secs = secs;
        }
        if let Some(retries) = num("FERRY_SEND_RETRIES") {
            l.send_retries = retries.min(u32::MAX as u64) as u32;
        }
        if let Some(ms) = num("FERRY_RETRY_BACKOFF_MS") {
            l.retry_backoff_ms = ms.clamp(10, 60_000);
        }
        if let Some(tol) = lookup("FERRY_SIZE_TOLERANCE").and_then(|s| s.trim().parse::<f64>().ok())
        {
            l.size_tolerance = tol;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let l = &self.loader;
        if !(0.0..=1.0).contains(&l.size_tolerance) {
            return Err(ConfigError::Invalid(format!(
                "size_tolerance must be within 0..=1, got {}",
                l.size_tolerance
            )));
        }
        if l.cache_generation.trim().is_empty() {
            return Err(ConfigError::Invalid("cache_generation must not be empty".into()));
        }
        for (name, value) in [
            ("download_timeout_ms", l.download_timeout_ms),
            ("local_timeout_ms", l.local_timeout_ms),
            ("probe_timeout_ms", l.probe_timeout_ms),
            ("cache_request_timeout_ms", l.cache_request_timeout_ms),
            ("cache_transfer_timeout_ms", l.cache_transfer_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if let Some(origin) = &l.origin {
            url::Url::parse(origin)
                .map_err(|e| ConfigError::Invalid(format!("origin `{origin}`: {e}")))?;
        }

        let mut seen_phases = HashSet::new();
        for pw in &self.progress.phases {
            if pw.weight == 0 {
                return Err(ConfigError::Invalid(format!(
                    "phase {} has zero weight",
                    pw.phase.as_str()
                )));
            }
            if !seen_phases.insert(pw.phase) {
                return Err(ConfigError::Invalid(format!(
                    "phase {} listed twice",
                    pw.phase.as_str()
                )));
            }
        }
        for phase in [Phase::Runtime, Phase::Model] {
            if !seen_phases.contains(&phase) {
                return Err(ConfigError::Invalid(format!(
                    "progress table lacks the {} phase",
                    phase.as_str()
                )));
            }
        }

        let mut keys = HashSet::new();
        for asset in &self.assets {
            if asset.key.trim().is_empty() {
                return Err(ConfigError::Invalid("asset key must not be empty".into()));
            }
            if !keys.insert(asset.key.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate asset key `{}`", asset.key)));
            }
            if asset.sources.is_empty() {
                return Err(ConfigError::Invalid(format!("asset `{}` has no sources", asset.key)));
            }
            for pair in asset.sources.windows(2) {
                if pair[1].tier < pair[0].tier {
                    return Err(ConfigError::Invalid(format!(
                        "asset `{}` lists {} after {}; sources must run primary, secondary, local",
                        asset.key,
                        pair[1].tier.as_str(),
                        pair[0].tier.as_str()
                    )));
                }
            }
            for source in &asset.sources {
                if let Some(value) = &source.integrity {
                    IntegrityHash::parse(value).map_err(|e| {
                        ConfigError::Invalid(format!("asset `{}`: {e}", asset.key))
                    })?;
                }
            }
        }

        if let Some(key) = &l.runtime_asset {
            match self.asset(key) {
                Some(a) if a.kind == AssetKind::Runtime => {}
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "runtime_asset `{key}` is not a runtime asset"
                    )))
                }
            }
        }
        if let Some(key) = &l.default_model {
            match self.asset(key) {
                Some(a) if a.kind == AssetKind::Model => {}
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "default_model `{key}` is not a model asset"
                    )))
                }
            }
        }
        if self.models().next().is_some() && self.runtime_asset().is_none() {
            return Err(ConfigError::Invalid(
                "models are configured but no runtime asset is".into(),
            ));
        }
        Ok(())
    }

    pub fn asset(&self, key: &str) -> Option<&AssetDescriptor> {
        self.assets.iter().find(|a| a.key == key)
    }

    pub fn models(&self) -> impl Iterator<Item = &AssetDescriptor> {
        self.assets.iter().filter(|a| a.kind == AssetKind::Model)
    }

    /// The explicitly configured runtime asset, else the first runtime listed.
    pub fn runtime_asset(&self) -> Option<&AssetDescriptor> {
        match &self.loader.runtime_asset {
            Some(key) => self.asset(key),
            None => self.assets.iter().find(|a| a.kind == AssetKind::Runtime),
        }
    }

    /// Smallest model by expected size other than `key`; unsized models sort last.
    pub fn smallest_model_excluding(&self, key: &str) -> Option<&AssetDescriptor> {
        self.models()
            .filter(|a| a.key != key)
            .min_by_key(|a| (a.expected_size_bytes.unwrap_or(u64::MAX), a.priority_tier))
    }

    /// Phases a load of `kind` walks through, in order.
    pub fn session_phases(&self, kind: AssetKind) -> Vec<PhaseWeight> {
        let wanted: &[Phase] = match kind {
            AssetKind::Runtime => &[Phase::Runtime],
            AssetKind::Model => &[Phase::Runtime, Phase::Model],
        };
        wanted
            .iter()
            .filter_map(|phase| self.progress.phases.iter().find(|pw| pw.phase == *phase))
            .cloned()
            .collect()
    }

    pub fn origin_url(&self) -> Result<Option<url::Url>, ConfigError> {
        self.loader
            .origin
            .as_deref()
            .map(|origin| {
                url::Url::parse(origin)
                    .map_err(|e| ConfigError::Invalid(format!("origin `{origin}`: {e}")))
            })
            .transpose()
    }

    pub fn bundle_dir(&self) -> PathBuf {
        PathBuf::from(&self.loader.bundle_dir)
    }

    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.loader.cache_dir {
            return PathBuf::from(dir);
        }
        directories::ProjectDirs::from("dev", "ferry", "ferry")
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".ferry-cache"))
    }

    /// Per-attempt deadline for a source of `tier` belonging to `asset`.
    pub fn deadline_for(&self, asset: &AssetDescriptor, tier: SourceTier) -> Duration {
        let ms = asset.timeout_ms.unwrap_or(if tier.is_local() {
            self.loader.local_timeout_ms
        } else {
            self.loader.download_timeout_ms
        });
        Duration::from_millis(ms.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.loader.probe_timeout_ms.max(1))
    }

    pub fn probe_ttl(&self) -> Duration {
        Duration::from_secs(self.loader.probe_ttl_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.loader.connect_timeout_ms.max(1))
    }

    pub fn progress_min_interval(&self) -> Duration {
        Duration::from_millis(self.loader.progress_min_interval_ms)
    }

    pub fn cache_request_timeout(&self) -> Duration {
        Duration::from_millis(self.loader.cache_request_timeout_ms.max(1))
    }

    pub fn cache_transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.loader.cache_transfer_timeout_ms.max(1))
    }
}

//! Resilient delivery of large binary assets: ordered multi-source fallback,
//! integrity checks, single-flight loads, weighted progress and a persistent
//! cache owned by a separate coordinator.

pub mod cache;
pub mod config;
pub mod downloader;
pub mod error;
pub mod http_client;
pub mod integrity;
pub mod orchestrator;
pub mod progress;
pub mod resolver;
pub mod retry;
pub mod singleflight;

pub use config::{load_config, AssetDescriptor, AssetKind, LoaderConfig, SourceCandidate, SourceTier};
pub use error::{
    CacheProtocolError, ConfigError, ErrorKind, IntegrityError, LoadError, LoadResult,
    NetworkErrorKind,
};
pub use integrity::{IntegrityValidator, ValidatedSource};
pub use orchestrator::{
    ActiveLoad, AttemptOutcome, LoadAttempt, LoadState, LoadedAsset, LoaderStatus, Orchestrator,
    SourceReport,
};
pub use progress::{Phase, PhaseWeight, ProgressAggregator, ProgressUpdate};

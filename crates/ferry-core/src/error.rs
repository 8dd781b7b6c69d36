use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification recorded on every failed [`crate::LoadAttempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Http,
    Integrity,
    AggregateSourceFailure,
    CacheProtocol,
    Config,
    UnknownAsset,
    Stale,
    Unhealthy,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Http => "http",
            ErrorKind::Integrity => "integrity",
            ErrorKind::AggregateSourceFailure => "aggregate_source_failure",
            ErrorKind::CacheProtocol => "cache_protocol",
            ErrorKind::Config => "config",
            ErrorKind::UnknownAsset => "unknown_asset",
            ErrorKind::Stale => "stale",
            ErrorKind::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    Timeout,
    Aborted,
    Connect,
    Io,
}

impl NetworkErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::Aborted => "aborted",
            NetworkErrorKind::Connect => "connect",
            NetworkErrorKind::Io => "io",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("invalid source url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("path traversal in `{url}`")]
    PathTraversal { url: String },
    #[error("cross-origin source `{url}` must use https, not {scheme}")]
    InsecureScheme { url: String, scheme: String },
    #[error("host `{host}` is not a trusted mirror (url `{url}`)")]
    UntrustedHost { url: String, host: String },
    #[error("malformed integrity value `{value}`")]
    MalformedHash { value: String },
    #[error("{algorithm} digest mismatch for `{url}`: expected {expected}, got {actual}")]
    HashMismatch {
        url: String,
        algorithm: String,
        expected: String,
        actual: String,
    },
}

#[derive(Debug, Clone, Error)]
pub enum CacheProtocolError {
    #[error("cache coordinator unavailable: {0}")]
    Unavailable(String),
    #[error("cache coordinator did not answer within {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("cache coordinator disconnected")]
    Disconnected,
    #[error("malformed cache message: {0}")]
    Malformed(String),
    #[error("cache coordinator error: {0}")]
    Remote(String),
    #[error("unexpected {got} reply to {request}")]
    UnexpectedReply {
        request: &'static str,
        got: &'static str,
    },
}

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {message}")]
    Read { path: String, message: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("config does not match schema: {}", .0.join(", "))]
    Schema(Vec<String>),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("network {} for `{url}`: {message}", .kind.as_str())]
    Network {
        kind: NetworkErrorKind,
        url: String,
        message: String,
    },
    #[error("http status {status} for `{url}`")]
    Http { status: u16, url: String },
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(
        "size mismatch for `{url}`: expected {expected} bytes, got {actual} (tolerance {:.0}%)",
        .tolerance * 100.0
    )]
    SizeMismatch {
        url: String,
        expected: u64,
        actual: u64,
        tolerance: f64,
    },
    #[error("could not obtain asset `{asset}`: all {attempts} source attempts failed{}", substitute_note(.substitute))]
    AggregateSourceFailure {
        asset: String,
        attempts: usize,
        substitute: Option<String>,
    },
    #[error("unknown asset `{key}`")]
    UnknownAsset { key: String },
    #[error("asset `{key}` went stale again after its re-fetch")]
    StaleAsset { key: String },
    #[error("asset `{key}` failed its health check after re-fetch")]
    Unhealthy { key: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cache(#[from] CacheProtocolError),
}

fn substitute_note(substitute: &Option<String>) -> String {
    match substitute {
        Some(key) => format!(" (fallback variant `{key}` also failed)"),
        None => String::new(),
    }
}

impl LoadError {
    pub fn network(kind: NetworkErrorKind, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            kind,
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn aborted(url: impl Into<String>) -> Self {
        Self::network(NetworkErrorKind::Aborted, url, "loading aborted")
    }

    pub fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::Http {
                status: status.as_u16(),
                url: url.to_string(),
            };
        }
        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if err.is_connect() {
            NetworkErrorKind::Connect
        } else {
            NetworkErrorKind::Io
        };
        Self::network(kind, url, err.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::Network { .. } => ErrorKind::Network,
            // An out-of-tolerance remote payload is treated like a bad response.
            LoadError::Http { .. } | LoadError::SizeMismatch { .. } => ErrorKind::Http,
            LoadError::Integrity(_) => ErrorKind::Integrity,
            LoadError::AggregateSourceFailure { .. } => ErrorKind::AggregateSourceFailure,
            LoadError::UnknownAsset { .. } => ErrorKind::UnknownAsset,
            LoadError::StaleAsset { .. } => ErrorKind::Stale,
            LoadError::Unhealthy { .. } => ErrorKind::Unhealthy,
            LoadError::Config(_) => ErrorKind::Config,
            LoadError::Cache(_) => ErrorKind::CacheProtocol,
        }
    }

    /// Whether the fallback loop may continue with the next candidate.
    pub fn advances_to_next_source(&self) -> bool {
        match self {
            LoadError::Network { kind, .. } => *kind != NetworkErrorKind::Aborted,
            LoadError::Http { .. } | LoadError::Integrity(_) | LoadError::SizeMismatch { .. } => {
                true
            }
            _ => false,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(
            self,
            LoadError::Network {
                kind: NetworkErrorKind::Aborted,
                ..
            }
        )
    }

    /// Transient failures worth retrying on the same candidate: nothing was
    /// received and the connection never came up.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LoadError::Network {
                kind: NetworkErrorKind::Connect,
                ..
            }
        )
    }
}

pub type LoadResult<T> = Result<T, LoadError>;

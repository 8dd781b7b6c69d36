use std::path::Path;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{LoadError, LoadResult, NetworkErrorKind};
use crate::integrity::{SourceLocation, ValidatedSource};
use crate::retry::{self, RetryPolicy};

/// Largest buffer reserved up front from a server-declared length.
const MAX_PREALLOC: u64 = 1 << 30;
const LOCAL_CHUNK: usize = 256 * 1024;

/// Bytes received so far and the expected total, if known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkProgress {
    pub received: u64,
    pub total: Option<u64>,
}

impl ChunkProgress {
    pub fn percent(&self) -> f64 {
        match self.total {
            Some(0) => 100.0,
            Some(total) => (self.received as f64 / total as f64 * 100.0).min(100.0),
            None => 0.0,
        }
    }
}

/// `|actual - expected| <= expected * tolerance`.
pub fn within_tolerance(expected: u64, actual: u64, tolerance: f64) -> bool {
    actual.abs_diff(expected) as f64 <= expected as f64 * tolerance
}

#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    retry: RetryPolicy,
    size_tolerance: f64,
}

impl Downloader {
    pub fn new(client: reqwest::Client, retry: RetryPolicy, size_tolerance: f64) -> Self {
        Self {
            client,
            retry,
            size_tolerance,
        }
    }

    pub fn size_tolerance(&self) -> f64 {
        self.size_tolerance
    }

    /// Fetch and verify in one step.
    pub async fn download<F>(
        &self,
        source: &ValidatedSource,
        expected_size: Option<u64>,
        deadline: Duration,
        cancel: &CancellationToken,
        on_chunk: F,
    ) -> LoadResult<Bytes>
    where
        F: FnMut(ChunkProgress),
    {
        let bytes = self.fetch(source, deadline, cancel, on_chunk).await?;
        self.verify(source, expected_size, &bytes)?;
        Ok(bytes)
    }

    /// Stream the full payload into one contiguous buffer.
    ///
    /// `deadline` bounds the whole attempt, body included. Cancellation wins over
    /// everything and surfaces as [`NetworkErrorKind::Aborted`].
    pub async fn fetch<F>(
        &self,
        source: &ValidatedSource,
        deadline: Duration,
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> LoadResult<Bytes>
    where
        F: FnMut(ChunkProgress),
    {
        let label = source.display_location();
        let work = async {
            match &source.location {
                SourceLocation::Remote(url) => {
                    self.fetch_remote(url, cancel, &mut on_chunk).await
                }
                SourceLocation::Local(path) => read_local(path, &mut on_chunk).await,
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(LoadError::aborted(label)),
            res = tokio::time::timeout(deadline, work) => match res {
                Ok(inner) => inner,
                Err(_) => Err(LoadError::network(
                    NetworkErrorKind::Timeout,
                    label,
                    format!("no complete response within {} ms", deadline.as_millis()),
                )),
            },
        }
    }

    /// Integrity digest first, then the size tolerance. A local payload outside the
    /// tolerance is accepted with a warning; a remote one is rejected.
    pub fn verify(
        &self,
        source: &ValidatedSource,
        expected_size: Option<u64>,
        bytes: &[u8],
    ) -> LoadResult<()> {
        if let Some(hash) = &source.integrity {
            hash.verify(source.url(), bytes)?;
        }
        let Some(expected) = expected_size else {
            return Ok(());
        };
        let actual = bytes.len() as u64;
        if within_tolerance(expected, actual, self.size_tolerance) {
            return Ok(());
        }
        if source.is_remote() {
            return Err(LoadError::SizeMismatch {
                url: source.url().to_string(),
                expected,
                actual,
                tolerance: self.size_tolerance,
            });
        }
        warn!(
            target: "ferry::download",
            source = %source.display_location(),
            expected,
            actual,
            "local asset size outside tolerance; using it anyway"
        );
        Ok(())
    }

    async fn fetch_remote<F>(
        &self,
        url: &url::Url,
        cancel: &CancellationToken,
        on_chunk: &mut F,
    ) -> LoadResult<Bytes>
    where
        F: FnMut(ChunkProgress),
    {
        let label = url.as_str();
        let response = retry::with_backoff(self.retry, cancel, label, |_| {
            let request = self.client.get(url.clone());
            async move {
                request
                    .send()
                    .await
                    .map_err(|e| LoadError::from_reqwest(label, &e))
            }
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::Http {
                status: status.as_u16(),
                url: label.to_string(),
            });
        }

        let Some(total) = response.content_length() else {
            // No length to normalise against: one read, reported as a single step.
            on_chunk(ChunkProgress {
                received: 0,
                total: None,
            });
            let body = response
                .bytes()
                .await
                .map_err(|e| LoadError::from_reqwest(label, &e))?;
            let n = body.len() as u64;
            on_chunk(ChunkProgress {
                received: n,
                total: Some(n),
            });
            return Ok(body);
        };

        let mut buf = BytesMut::with_capacity(total.min(MAX_PREALLOC) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| LoadError::from_reqwest(label, &e))?;
            buf.extend_from_slice(&chunk);
            on_chunk(ChunkProgress {
                received: buf.len() as u64,
                total: Some(total),
            });
        }
        debug!(target: "ferry::download", url = label, bytes = buf.len(), "download complete");
        Ok(buf.freeze())
    }
}

async fn read_local<F>(path: &Path, on_chunk: &mut F) -> LoadResult<Bytes>
where
    F: FnMut(ChunkProgress),
{
    let label = path.display().to_string();
    let io_err =
        |e: std::io::Error| LoadError::network(NetworkErrorKind::Io, label.clone(), e.to_string());
    let mut file = tokio::fs::File::open(path).await.map_err(io_err)?;
    let total = file.metadata().await.map_err(io_err)?.len();
    let mut buf = BytesMut::with_capacity(total.min(MAX_PREALLOC) as usize);
    let mut chunk = vec![0u8; LOCAL_CHUNK];
    on_chunk(ChunkProgress {
        received: 0,
        total: Some(total),
    });
    loop {
        let n = file.read(&mut chunk).await.map_err(io_err)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        on_chunk(ChunkProgress {
            received: buf.len() as u64,
            total: Some(total),
        });
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IntegritySettings, SourceCandidate, SourceTier};
    use crate::integrity::{HashAlgorithm, IntegrityHash, IntegrityValidator};
    use httpmock::prelude::*;

    fn downloader() -> Downloader {
        Downloader::new(reqwest::Client::new(), RetryPolicy::none(), 0.10)
    }

    fn remote(server: &MockServer, path: &str, integrity: Option<String>) -> ValidatedSource {
        let origin = url::Url::parse(&server.base_url()).unwrap();
        IntegrityValidator::new(Some(origin), &IntegritySettings::default(), "bundle".into())
            .assess(&SourceCandidate {
                url: path.into(),
                tier: SourceTier::RemotePrimary,
                integrity,
            })
            .unwrap()
    }

    #[test]
    fn tolerance_is_symmetric() {
        assert!(within_tolerance(1000, 1100, 0.10));
        assert!(within_tolerance(1000, 900, 0.10));
        assert!(!within_tolerance(1000, 1101, 0.10));
        assert!(!within_tolerance(1000, 899, 0.10));
    }

    #[tokio::test]
    async fn streams_body_with_monotonic_progress() {
        let server = MockServer::start_async().await;
        let body = vec![7u8; 300_000];
        server.mock_async(|when, then| {
            when.method(GET).path("/m.onnx");
            then.status(200).body(body.clone());
        }).await;
        let src = remote(&server, "/m.onnx", None);
        let mut seen = Vec::new();
        let bytes = downloader()
            .download(&src, Some(300_000), Duration::from_secs(5), &CancellationToken::new(), |p| {
                seen.push(p.received)
            })
            .await
            .unwrap();
        assert_eq!(bytes.len(), 300_000);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last().copied(), Some(300_000));
    }

    #[tokio::test]
    async fn http_errors_map_to_status() {
        let server = MockServer::start_async().await;
        server.mock_async(|when, then| {
            when.method(GET).path("/missing.onnx");
            then.status(404);
        }).await;
        let src = remote(&server, "/missing.onnx", None);
        let err = downloader()
            .fetch(&src, Duration::from_secs(5), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Http { status: 404, .. }));
    }

    #[tokio::test]
    async fn deadline_maps_to_timeout() {
        let server = MockServer::start_async().await;
        server.mock_async(|when, then| {
            when.method(GET).path("/slow.onnx");
            then.status(200).delay(Duration::from_secs(2)).body("late");
        }).await;
        let src = remote(&server, "/slow.onnx", None);
        let err = downloader()
            .fetch(&src, Duration::from_millis(200), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LoadError::Network {
                kind: NetworkErrorKind::Timeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn remote_size_outside_tolerance_is_rejected() {
        let server = MockServer::start_async().await;
        server.mock_async(|when, then| {
            when.method(GET).path("/short.onnx");
            then.status(200).body(vec![0u8; 500]);
        }).await;
        let src = remote(&server, "/short.onnx", None);
        let err = downloader()
            .download(&src, Some(1000), Duration::from_secs(5), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LoadError::SizeMismatch {
                expected: 1000,
                actual: 500,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn digest_mismatch_fails_verification() {
        let server = MockServer::start_async().await;
        server.mock_async(|when, then| {
            when.method(GET).path("/m.onnx");
            then.status(200).body("tampered");
        }).await;
        let expected = IntegrityHash::compute(HashAlgorithm::Sha384, b"original").to_string();
        let src = remote(&server, "/m.onnx", Some(expected));
        let err = downloader()
            .download(&src, None, Duration::from_secs(5), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Integrity(_)));
    }

    #[tokio::test]
    async fn local_size_mismatch_only_warns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("models")).unwrap();
        std::fs::write(dir.path().join("models/m.onnx"), vec![1u8; 10]).unwrap();
        let src = IntegrityValidator::new(None, &IntegritySettings::default(), dir.path().into())
            .assess(&SourceCandidate {
                url: "models/m.onnx".into(),
                tier: SourceTier::Local,
                integrity: None,
            })
            .unwrap();
        let bytes = downloader()
            .download(&src, Some(1000), Duration::from_secs(5), &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(bytes.len(), 10);
    }

    #[tokio::test]
    async fn cancelled_fetch_is_aborted() {
        let server = MockServer::start_async().await;
        server.mock_async(|when, then| {
            when.method(GET).path("/slow.onnx");
            then.status(200).delay(Duration::from_secs(5)).body("late");
        }).await;
        let src = remote(&server, "/slow.onnx", None);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = downloader()
            .fetch(&src, Duration::from_secs(30), &cancel, |_| {})
            .await
            .unwrap_err();
        assert!(err.is_aborted());
    }
}

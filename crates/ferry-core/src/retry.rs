use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::LoaderConfig;
use crate::error::{LoadError, LoadResult};

/// How often a request that never reached the server is re-sent to the same source.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    pub fn from_config(cfg: &LoaderConfig) -> Self {
        Self {
            max_retries: cfg.loader.send_retries,
            backoff: Duration::from_millis(cfg.loader.retry_backoff_ms),
        }
    }

    /// Linear backoff: `backoff * attempt`, attempts counted from 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let step = attempt.max(1);
        self.backoff.checked_mul(step).unwrap_or(self.backoff)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or retries run out.
/// Cancellation during a backoff sleep surfaces as an aborted network error.
pub async fn with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> LoadResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = LoadResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    target: "ferry::retry",
                    "{label}: send failed (attempt {attempt}): {err}; retrying in {:?}",
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LoadError::aborted(label)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}

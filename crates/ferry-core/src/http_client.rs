use std::time::Duration;

use crate::error::ConfigError;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

fn keepalive() -> Duration {
    Duration::from_secs(env_u64("FERRY_HTTP_TCP_KEEPALIVE_SECS", 60).max(1))
}

fn pool_idle() -> Duration {
    Duration::from_secs(env_u64("FERRY_HTTP_POOL_IDLE_SECS", 90).max(1))
}

fn user_agent() -> String {
    format!("ferry/{}", env!("CARGO_PKG_VERSION"))
}

/// Base client builder with harmonized defaults. Deadlines are applied per request.
pub fn builder(connect_timeout: Duration) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(user_agent())
        .connect_timeout(connect_timeout)
        .tcp_keepalive(keepalive())
        .pool_idle_timeout(pool_idle())
}

pub fn build_client(connect_timeout: Duration) -> Result<reqwest::Client, ConfigError> {
    builder(connect_timeout)
        .build()
        .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))
}

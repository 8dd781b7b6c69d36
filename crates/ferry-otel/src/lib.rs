//! Tracing setup shared by the ferry binaries.
//!
//! Console output always goes to stderr: stdout is reserved for the cache
//! worker protocol when a binary runs as `ferry cache-worker`.

use once_cell::sync::OnceCell;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

pub fn init() {
    init_with_default("info");
}

/// Install the global subscriber. `FERRY_LOG` (then `RUST_LOG`) wins over
/// `default_directive`. Calling this twice is harmless.
pub fn init_with_default(default_directive: &str) {
    let filter = std::env::var("FERRY_LOG")
        .ok()
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive));

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);
    let registry = tracing_subscriber::registry().with(console);

    let Some(dir) = std::env::var("FERRY_LOG_DIR").ok().filter(|d| !d.trim().is_empty()) else {
        let _ = registry.try_init();
        return;
    };
    let prefix = std::env::var("FERRY_LOG_PREFIX").unwrap_or_else(|_| "ferry.log".into());
    let rotation = std::env::var("FERRY_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
    let dir_created = std::fs::create_dir_all(&dir).is_ok();
    match file_appender(&dir, &prefix, &rotation) {
        Ok(appender) => {
            let (nb, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            let targets = Targets::new().with_target("ferry", file_level());
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_writer(nb)
                .with_filter(targets);
            let _ = registry.with(file_layer).try_init();
        }
        Err(err) => {
            let _ = registry.try_init();
            tracing::warn!(target: "ferry::log", directory = %dir, "file logging disabled: {err}");
        }
    }
    if !dir_created {
        tracing::warn!(target: "ferry::log", directory = %dir, "failed to create log directory");
    }
}

fn file_appender(
    dir: &str,
    prefix: &str,
    rotation: &str,
) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    RollingFileAppender::builder()
        .rotation(rotation_from(rotation))
        .filename_prefix(prefix)
        .build(dir)
}

fn rotation_from(raw: &str) -> Rotation {
    match raw.trim().to_ascii_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

fn file_level() -> tracing::Level {
    std::env::var("FERRY_LOG_FILE_LEVEL")
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(tracing::Level::DEBUG)
}

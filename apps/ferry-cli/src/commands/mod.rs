pub mod cache;
pub mod inspect;
pub mod load;

use std::path::PathBuf;

use anyhow::{Context, Result};
use ferry_core::cache::{CacheClient, CacheTimeouts};
use ferry_core::{load_config, LoaderConfig, Orchestrator};
use tracing::debug;

pub use cache::ClearArgs;
pub use inspect::{ProbeArgs, ValidateArgs};
pub use load::EnsureArgs;

/// Flags shared by every subcommand.
pub struct Global {
    pub config: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub worker: bool,
    pub json: bool,
}

impl Global {
    pub fn load_config(&self) -> Result<LoaderConfig> {
        let mut cfg = load_config(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        if let Some(dir) = &self.cache_dir {
            cfg.loader.cache_dir = Some(dir.display().to_string());
        }
        Ok(cfg)
    }

    /// Orchestrator with its cache either in-process or in a `cache-worker` child.
    pub async fn orchestrator(&self) -> Result<Orchestrator> {
        let cfg = self.load_config()?;
        if !self.worker {
            return Ok(Orchestrator::from_config(cfg).await?);
        }
        let exe = std::env::current_exe().context("locating the ferry binary")?;
        let mut command = tokio::process::Command::new(exe);
        command.arg("--config").arg(&self.config);
        command.arg("--cache-dir").arg(cfg.cache_dir());
        command.arg("cache-worker");
        debug!(target: "ferry::cli", "spawning cache worker");
        let client = CacheClient::spawn_worker(command, CacheTimeouts::from_config(&cfg))?;
        Ok(Orchestrator::with_cache(cfg, client)?)
    }

    pub fn print(&self, value: &serde_json::Value, text: impl FnOnce() -> String) {
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            );
        } else {
            println!("{}", text());
        }
    }
}

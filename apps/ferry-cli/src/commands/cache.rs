use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use ferry_core::cache::{worker as cache_worker, CacheStore};
use ferry_protocol::ClearScope;
use serde_json::json;
use tracing::info;

use super::Global;

#[derive(Clone, Copy, ValueEnum)]
pub enum ScopeArg {
    All,
    Models,
    Static,
}

#[derive(Args)]
pub struct ClearArgs {
    /// Which entries to remove
    #[arg(long, value_enum, default_value_t = ScopeArg::All)]
    pub scope: ScopeArg,
    /// Remove only the entry for this absolute url (overrides --scope)
    #[arg(long)]
    pub url: Option<String>,
}

pub async fn clear(global: &Global, args: ClearArgs) -> Result<()> {
    let scope = match (args.url, args.scope) {
        (Some(url), _) => ClearScope::Url(url),
        (None, ScopeArg::All) => ClearScope::All,
        (None, ScopeArg::Models) => ClearScope::Models,
        (None, ScopeArg::Static) => ClearScope::Static,
    };
    let orchestrator = global.orchestrator().await?;
    let removed = orchestrator.clear_cache_scope(scope).await?;
    global.print(&json!({ "removed": removed }), || {
        format!("removed {removed} cache entries")
    });
    Ok(())
}

/// Own the cache directory and answer requests on stdio until stdin closes.
pub async fn worker(global: &Global) -> Result<()> {
    let cfg = global.load_config()?;
    let root = cfg.cache_dir();
    let store = CacheStore::open(&root, &cfg.loader.cache_generation)
        .await
        .with_context(|| format!("opening cache at {}", root.display()))?;
    info!(target: "ferry::cache", root = %root.display(), entries = store.len(), "cache worker serving on stdio");
    cache_worker::serve_stdio(store).await?;
    Ok(())
}

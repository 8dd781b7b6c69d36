use anyhow::{bail, Result};
use clap::Args;
use ferry_core::{LoadedAsset, LoaderStatus, Orchestrator};
use serde_json::json;

use super::Global;

#[derive(Args)]
pub struct EnsureArgs {
    /// Asset keys; defaults to the configured default model
    pub keys: Vec<String>,
    /// Hide progress lines on stderr
    #[arg(long)]
    pub quiet: bool,
}

fn keys_or_default(orchestrator: &Orchestrator, keys: Vec<String>) -> Result<Vec<String>> {
    if !keys.is_empty() {
        return Ok(keys);
    }
    let cfg = orchestrator.config();
    let fallback = cfg
        .loader
        .default_model
        .clone()
        .or_else(|| cfg.models().next().map(|m| m.key.clone()))
        .or_else(|| cfg.runtime_asset().map(|r| r.key.clone()));
    match fallback {
        Some(key) => Ok(vec![key]),
        None => bail!("no assets configured"),
    }
}

fn describe(loaded: &LoadedAsset) -> serde_json::Value {
    json!({
        "key": loaded.key,
        "kind": loaded.kind.as_str(),
        "size_bytes": loaded.bytes.len(),
        "tier": loaded.tier.as_str(),
        "source_url": loaded.source_url,
        "from_cache": loaded.from_cache,
        "substituted_for": loaded.substituted_for,
    })
}

async fn warm(orchestrator: &Orchestrator, keys: &[String], quiet: bool) -> Vec<serde_json::Value> {
    let progress = (!quiet).then(|| {
        orchestrator.on_progress(|update| {
            eprintln!("[{:>3}%] {}: {}", update.rounded(), update.asset_key, update.message);
        })
    });
    let mut results = Vec::with_capacity(keys.len());
    for key in keys {
        let value = match orchestrator.ensure_loaded(key).await {
            Ok(loaded) => describe(&loaded),
            Err(err) => json!({
                "key": key,
                "error": err.to_string(),
                "kind": err.kind().as_str(),
            }),
        };
        results.push(value);
    }
    if let Some(task) = progress {
        task.abort();
    }
    results
}

pub async fn ensure(global: &Global, args: EnsureArgs) -> Result<()> {
    let orchestrator = global.orchestrator().await?;
    let keys = keys_or_default(&orchestrator, args.keys)?;
    let results = warm(&orchestrator, &keys, args.quiet).await;
    let failed = results.iter().filter(|r| r.get("error").is_some()).count();

    global.print(&json!({ "assets": results }), || {
        results
            .iter()
            .map(|r| match r.get("error") {
                Some(err) => format!("{}: FAILED {}", r["key"].as_str().unwrap_or("?"), err),
                None => format!(
                    "{}: {} bytes via {} ({}{}{})",
                    r["key"].as_str().unwrap_or("?"),
                    r["size_bytes"],
                    r["tier"].as_str().unwrap_or("?"),
                    r["source_url"].as_str().unwrap_or("?"),
                    if r["from_cache"].as_bool() == Some(true) { ", cached" } else { "" },
                    match r["substituted_for"].as_str() {
                        Some(original) => format!(", instead of {original}"),
                        None => String::new(),
                    },
                ),
            })
            .collect::<Vec<_>>()
            .join("\n")
    });
    if failed > 0 {
        bail!("{failed} of {} assets failed to load", results.len());
    }
    Ok(())
}

fn render_status(status: &LoaderStatus) -> String {
    let mut lines = Vec::new();
    lines.push(format!("loaded: {}", status.loaded_keys.join(", ")));
    match &status.cache_summary {
        Some(c) => lines.push(format!(
            "cache: {} static, {} models, {} bytes, generation {}{}",
            c.static_asset_count,
            c.model_count,
            c.total_bytes,
            c.generation,
            if status.offline_ready { " (offline ready)" } else { "" }
        )),
        None => lines.push("cache: unavailable".into()),
    }
    for a in &status.attempts {
        lines.push(format!(
            "  {} {} {} {}ms{}",
            a.asset_key,
            a.tier.as_str(),
            if a.succeeded() { "ok" } else { "failed" },
            a.elapsed_ms,
            a.message
                .as_deref()
                .map(|m| format!(": {m}"))
                .unwrap_or_default()
        ));
    }
    lines.join("\n")
}

pub async fn status(global: &Global, args: EnsureArgs) -> Result<()> {
    let orchestrator = global.orchestrator().await?;
    if !args.keys.is_empty() {
        warm(&orchestrator, &args.keys, args.quiet).await;
    }
    let status = orchestrator.get_status().await;
    global.print(&serde_json::to_value(&status)?, || render_status(&status));
    Ok(())
}

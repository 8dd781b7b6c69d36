use anyhow::{bail, Result};
use clap::Args;
use ferry_core::config::config_schema_json;
use ferry_core::{IntegrityValidator, SourceTier};
use serde_json::json;

use super::Global;

#[derive(Args)]
pub struct ValidateArgs {
    /// Url as it would appear in a manifest
    pub url: String,
}

#[derive(Args)]
pub struct ProbeArgs {
    /// Asset key
    pub key: String,
}

/// Admission check only; no network access.
pub fn validate(global: &Global, args: ValidateArgs) -> Result<()> {
    let cfg = global.load_config()?;
    let validator = IntegrityValidator::new(cfg.origin_url()?, &cfg.integrity, cfg.bundle_dir());
    let remote = ferry_core::SourceCandidate {
        url: args.url.clone(),
        tier: SourceTier::RemotePrimary,
        integrity: None,
    };
    let verdict = validator.assess(&remote);
    let admitted = validator.validate(&args.url);
    global.print(
        &json!({
            "url": args.url,
            "admitted": admitted,
            "reason": verdict.as_ref().err().map(ToString::to_string),
            "resolved": verdict.as_ref().ok().map(|s| s.display_location()),
        }),
        || match &verdict {
            Ok(source) => format!("admitted: {}", source.display_location()),
            Err(err) => format!("rejected: {err}"),
        },
    );
    if !admitted {
        bail!("url rejected");
    }
    Ok(())
}

pub async fn probe(global: &Global, args: ProbeArgs) -> Result<()> {
    let orchestrator = global.orchestrator().await?;
    let reports = orchestrator.probe_sources(&args.key).await?;
    global.print(&serde_json::to_value(&reports)?, || {
        reports
            .iter()
            .map(|r| {
                let verdict = match (&r.rejection, r.reachable) {
                    (Some(reason), _) => format!("rejected ({reason})"),
                    (None, Some(true)) => "reachable".into(),
                    (None, _) => "unreachable".into(),
                };
                format!("{:<16} {} {verdict}", r.tier.as_str(), r.url)
            })
            .collect::<Vec<_>>()
            .join("\n")
    });
    Ok(())
}

pub fn schema() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&config_schema_json())?);
    Ok(())
}

#![allow(dead_code)]

use std::path::Path;

use ferry_core::LoaderConfig;
use tempfile::TempDir;

pub const RUNTIME_BYTES: usize = 4096;

const RUNTIME_BLOCK: &str = r#"
[[assets]]
key = "ort"
kind = "runtime"
filename = "ort-wasm-simd.wasm"
expected_size_bytes = 4096

[[assets.sources]]
url = "runtime/ort-wasm-simd.wasm"
tier = "local"
"#;

pub fn write_file(root: &Path, rel: &str, bytes: &[u8]) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().expect("file has a parent")).expect("mkdir");
    std::fs::write(path, bytes).expect("write fixture");
}

/// A bundle directory that already holds the runtime engine.
pub fn bundle_with_runtime() -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    write_file(dir.path(), "runtime/ort-wasm-simd.wasm", &[0x61; RUNTIME_BYTES]);
    dir
}

fn toml_path(path: &Path) -> String {
    path.display().to_string().replace('\\', "/")
}

const LOADER_DEFAULTS: [(&str, &str); 3] = [
    ("probe_before_fetch", "false"),
    ("send_retries", "0"),
    ("progress_min_interval_ms", "0"),
];

/// Test config: probes off, no send retries, unthrottled progress, a local
/// runtime, plus `assets`. `loader_extra` lines land in `[loader]` and take
/// precedence over those defaults.
pub fn config(origin: &str, bundle: &Path, loader_extra: &str, assets: &str) -> LoaderConfig {
    let overridden = |key: &str| {
        loader_extra
            .lines()
            .any(|line| line.split('=').next().map(str::trim) == Some(key))
    };
    let defaults: String = LOADER_DEFAULTS
        .iter()
        .filter(|(key, _)| !overridden(key))
        .map(|(key, value)| format!("{key} = {value}\n"))
        .collect();
    let doc = format!(
        r#"
[loader]
origin = "{origin}"
bundle_dir = "{bundle}"
{defaults}{loader_extra}

{runtime}
{assets}
"#,
        bundle = toml_path(bundle),
        runtime = RUNTIME_BLOCK,
    );
    let cfg = LoaderConfig::from_toml_str(&doc).expect("test config parses");
    cfg.validate().expect("test config is valid");
    cfg
}

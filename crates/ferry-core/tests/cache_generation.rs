mod common;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use ferry_core::cache::{CacheClient, CacheStore, CacheTimeouts, StoreError};
use ferry_core::{LoadError, Orchestrator};
use ferry_protocol::EntryClass;
use httpmock::prelude::*;

const MODEL_BYTES: usize = 16_384;

const MODEL: &str = r#"
[[assets]]
key = "model-a"
kind = "model"
filename = "model-a.onnx"
expected_size_bytes = 16384

[[assets.sources]]
url = "/cdn/model-a.onnx"
tier = "remote-primary"
"#;

/// The previous coordinator task releases its lock when it winds down, which
/// happens shortly after its last client is dropped.
async fn open_cache(dir: &Path, generation: &str) -> CacheClient {
    for _ in 0..100 {
        match CacheStore::open(dir, generation).await {
            Ok(store) => return CacheClient::in_process(store, CacheTimeouts::default()),
            Err(StoreError::Locked(_)) => tokio::time::sleep(Duration::from_millis(20)).await,
            Err(err) => panic!("open cache: {err}"),
        }
    }
    panic!("cache directory stayed locked");
}

#[tokio::test]
async fn same_generation_serves_from_cache_across_sessions() {
    let server = MockServer::start_async().await;
    let download = server
        .mock_async(|when, then| {
            when.method(GET).path("/cdn/model-a.onnx");
            then.status(200).body(vec![9u8; MODEL_BYTES]);
        })
        .await;
    let bundle = common::bundle_with_runtime();
    let cache_dir = tempfile::tempdir().expect("cache dir");
    let cfg = common::config(&server.base_url(), bundle.path(), "", MODEL);

    {
        let cache = open_cache(cache_dir.path(), "v1").await;
        let orchestrator = Orchestrator::new(cfg.clone(), Some(cache)).expect("orchestrator");
        let first = orchestrator.ensure_loaded("model-a").await.expect("download");
        assert!(!first.from_cache);
        let summary = orchestrator
            .get_status()
            .await
            .cache_summary
            .expect("cache summary");
        assert_eq!(summary.model_count, 1);
        assert_eq!(summary.total_bytes, MODEL_BYTES as u64);
    }

    let cache = open_cache(cache_dir.path(), "v1").await;
    let orchestrator = Orchestrator::new(cfg, Some(cache)).expect("orchestrator");
    let second = orchestrator.ensure_loaded("model-a").await.expect("cache hit");
    assert!(second.from_cache);
    assert_eq!(second.bytes.len(), MODEL_BYTES);
    assert_eq!(second.source_url, format!("{}/cdn/model-a.onnx", server.base_url()));
    download.assert_hits_async(1).await;
    // A cache hit is not a source attempt.
    assert_eq!(orchestrator.get_status().await.attempts_for("model-a").count(), 0);
}

#[tokio::test]
async fn bumped_generation_downloads_again() {
    let server = MockServer::start_async().await;
    let download = server
        .mock_async(|when, then| {
            when.method(GET).path("/cdn/model-a.onnx");
            then.status(200).body(vec![9u8; MODEL_BYTES]);
        })
        .await;
    let bundle = common::bundle_with_runtime();
    let cache_dir = tempfile::tempdir().expect("cache dir");
    let cfg = common::config(&server.base_url(), bundle.path(), "", MODEL);

    {
        let cache = open_cache(cache_dir.path(), "v1").await;
        let orchestrator = Orchestrator::new(cfg.clone(), Some(cache)).expect("orchestrator");
        orchestrator.ensure_loaded("model-a").await.expect("download");
    }

    let cache = open_cache(cache_dir.path(), "v2").await;
    let summary = cache.status().await.expect("status");
    assert_eq!(summary.model_count, 0);
    assert_eq!(summary.generation, "v2");
    let orchestrator = Orchestrator::new(cfg, Some(cache)).expect("orchestrator");
    let loaded = orchestrator.ensure_loaded("model-a").await.expect("re-download");
    assert!(!loaded.from_cache);
    download.assert_hits_async(2).await;
}

#[tokio::test]
async fn corrupt_cache_entry_is_evicted_and_refetched() {
    let server = MockServer::start_async().await;
    let download = server
        .mock_async(|when, then| {
            when.method(GET).path("/cdn/model-a.onnx");
            then.status(200).body(vec![9u8; MODEL_BYTES]);
        })
        .await;
    let bundle = common::bundle_with_runtime();
    let cache_dir = tempfile::tempdir().expect("cache dir");
    let cache = open_cache(cache_dir.path(), "v1").await;
    let url = format!("{}/cdn/model-a.onnx", server.base_url());
    cache
        .store(&url, Bytes::from_static(b"truncated"), EntryClass::Model)
        .await
        .expect("seed bad entry");

    let cfg = common::config(&server.base_url(), bundle.path(), "", MODEL);
    let orchestrator = Orchestrator::new(cfg, Some(cache.clone())).expect("orchestrator");
    let loaded = orchestrator.ensure_loaded("model-a").await.expect("refetched");
    assert!(!loaded.from_cache);
    assert_eq!(loaded.bytes.len(), MODEL_BYTES);
    download.assert_hits_async(1).await;

    let hit = cache.lookup(&url).await.expect("lookup").expect("replaced entry");
    assert_eq!(hit.bytes.len(), MODEL_BYTES);
}

#[tokio::test]
async fn invalidation_bypasses_the_cache_once() {
    let server = MockServer::start_async().await;
    let download = server
        .mock_async(|when, then| {
            when.method(GET).path("/cdn/model-a.onnx");
            then.status(200).body(vec![9u8; MODEL_BYTES]);
        })
        .await;
    let bundle = common::bundle_with_runtime();
    let cache_dir = tempfile::tempdir().expect("cache dir");
    let cache = open_cache(cache_dir.path(), "v1").await;
    let cfg = common::config(&server.base_url(), bundle.path(), "", MODEL);
    let orchestrator = Orchestrator::new(cfg, Some(cache)).expect("orchestrator");

    let checks = AtomicUsize::new(0);
    let loaded = orchestrator
        .ensure_healthy("model-a", |_| checks.fetch_add(1, Ordering::SeqCst) > 0)
        .await
        .expect("healthy after re-fetch");
    assert!(!loaded.from_cache);
    assert_eq!(checks.load(Ordering::SeqCst), 2);
    download.assert_hits_async(2).await;

    orchestrator.invalidate("model-a").unwrap_err();
}

#[tokio::test]
async fn second_health_failure_is_fatal() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/cdn/model-a.onnx");
            then.status(200).body(vec![9u8; MODEL_BYTES]);
        })
        .await;
    let bundle = common::bundle_with_runtime();
    let cfg = common::config(&server.base_url(), bundle.path(), "", MODEL);
    let orchestrator = Orchestrator::new(cfg, None).expect("orchestrator");

    let err = orchestrator
        .ensure_healthy("model-a", |_| false)
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::Unhealthy { .. }));
    let err = orchestrator
        .ensure_healthy("model-a", |_| false)
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::StaleAsset { .. }));
}

mod common;

use std::time::Duration;

use ferry_core::Orchestrator;
use futures_util::future::join_all;
use httpmock::prelude::*;

const MODEL: &str = r#"
[[assets]]
key = "model-a"
kind = "model"
filename = "model-a.onnx"
expected_size_bytes = 20000

[[assets.sources]]
url = "/models/model-a.onnx"
tier = "remote-primary"
"#;

#[tokio::test]
async fn concurrent_loads_share_one_download() {
    let server = MockServer::start_async().await;
    let download = server
        .mock_async(|when, then| {
            when.method(GET).path("/models/model-a.onnx");
            then.status(200)
                .delay(Duration::from_millis(150))
                .body(vec![0x5a; 20_000]);
        })
        .await;
    let bundle = common::bundle_with_runtime();
    let cfg = common::config(&server.base_url(), bundle.path(), "", MODEL);
    let orchestrator = Orchestrator::new(cfg, None).expect("orchestrator");

    let results = join_all((0..8).map(|_| orchestrator.ensure_loaded("model-a"))).await;

    download.assert_hits_async(1).await;
    for result in &results {
        let loaded = result.as_ref().expect("load succeeds");
        assert_eq!(loaded.bytes.len(), 20_000);
        assert_eq!(loaded.key, "model-a");
    }
    let status = orchestrator.get_status().await;
    assert_eq!(status.attempts_for("model-a").count(), 1);
    assert_eq!(status.attempts_for("ort").count(), 1);
    assert!(status.active_loads.is_empty());
}

#[tokio::test]
async fn resolved_asset_is_not_fetched_again() {
    let server = MockServer::start_async().await;
    let download = server
        .mock_async(|when, then| {
            when.method(GET).path("/models/model-a.onnx");
            then.status(200).body(vec![0x5a; 20_000]);
        })
        .await;
    let bundle = common::bundle_with_runtime();
    let cfg = common::config(&server.base_url(), bundle.path(), "", MODEL);
    let orchestrator = Orchestrator::new(cfg, None).expect("orchestrator");

    orchestrator.ensure_loaded("model-a").await.expect("first load");
    orchestrator.ensure_loaded("model-a").await.expect("second load");

    download.assert_hits_async(1).await;
    assert_eq!(
        orchestrator.state("model-a"),
        ferry_core::LoadState::Ready
    );
}

#[tokio::test]
async fn failed_flight_allows_a_retry() {
    let server = MockServer::start_async().await;
    let mut missing = server
        .mock_async(|when, then| {
            when.method(GET).path("/models/model-a.onnx");
            then.status(503);
        })
        .await;
    let bundle = common::bundle_with_runtime();
    let cfg = common::config(
        &server.base_url(),
        bundle.path(),
        "model_fallback = false",
        MODEL,
    );
    let orchestrator = Orchestrator::new(cfg, None).expect("orchestrator");

    let err = orchestrator.ensure_loaded("model-a").await.unwrap_err();
    assert!(matches!(
        err,
        ferry_core::LoadError::AggregateSourceFailure { attempts: 1, .. }
    ));

    missing.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/models/model-a.onnx");
            then.status(200).body(vec![0x5a; 20_000]);
        })
        .await;
    let loaded = orchestrator.ensure_loaded("model-a").await.expect("retry succeeds");
    assert_eq!(loaded.bytes.len(), 20_000);
}

mod common;

use std::time::Duration;

use bytes::Bytes;
use ferry_core::cache::{worker, CacheClient, CacheStore, CacheTimeouts};
use ferry_core::Orchestrator;
use ferry_protocol::{CacheNotice, ClearScope, EntryClass};
use futures_util::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const PIPE: usize = 1 << 20;

async fn piped_client(dir: &std::path::Path) -> CacheClient {
    let store = CacheStore::open(dir, "v1").await.expect("open store");
    let (client_side, worker_side) = tokio::io::duplex(PIPE);
    let (worker_read, worker_write) = tokio::io::split(worker_side);
    tokio::spawn(worker::serve_io(store, worker_read, worker_write));
    let (client_read, client_write) = tokio::io::split(client_side);
    CacheClient::over_io(client_read, client_write, CacheTimeouts::default())
}

#[tokio::test]
async fn concurrent_requests_are_correlated_over_the_pipe() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = piped_client(dir.path()).await;

    let stores = (0..16).map(|i| {
        let client = client.clone();
        async move {
            let url = format!("https://cdn.example/m{i}.onnx");
            client
                .store(&url, Bytes::from(vec![i as u8; 100 + i]), EntryClass::Model)
                .await
                .map(|()| url)
        }
    });
    let urls: Vec<String> = join_all(stores)
        .await
        .into_iter()
        .map(|r| r.expect("store"))
        .collect();

    let lookups = urls.iter().map(|url| client.lookup(url));
    for (i, hit) in join_all(lookups).await.into_iter().enumerate() {
        let hit = hit.expect("lookup").expect("hit");
        assert_eq!(hit.bytes.len(), 100 + i);
        assert_eq!(hit.meta.url, urls[i]);
    }

    let summary = client.status().await.expect("status");
    assert_eq!(summary.model_count, 16);
    assert!(client.is_offline_ready());

    let removed = client
        .clear(ClearScope::Url(urls[0].clone()))
        .await
        .expect("clear one");
    assert_eq!(removed, 1);
    assert!(client.lookup(&urls[0]).await.expect("lookup").is_none());
    assert_eq!(client.clear(ClearScope::Models).await.expect("clear"), 15);
}

#[tokio::test]
async fn store_is_announced_to_subscribers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = piped_client(dir.path()).await;
    let mut notices = client.subscribe();

    client
        .store("https://cdn.example/ort.wasm", Bytes::from_static(b"wasm"), EntryClass::Static)
        .await
        .expect("store");

    let updated = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match notices.recv().await.expect("notice stream") {
                CacheNotice::CacheUpdated { url, size_bytes, class } => {
                    break (url, size_bytes, class)
                }
                CacheNotice::OfflineReady { .. } => continue,
            }
        }
    })
    .await
    .expect("CACHE_UPDATED arrives");
    assert_eq!(updated.0, "https://cdn.example/ort.wasm");
    assert_eq!(updated.1, 4);
    assert_eq!(updated.2, EntryClass::Static);
}

#[tokio::test]
async fn malformed_line_gets_an_error_reply() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::open(dir.path(), "v1").await.expect("open store");
    let (client_side, worker_side) = tokio::io::duplex(PIPE);
    let (worker_read, worker_write) = tokio::io::split(worker_side);
    tokio::spawn(worker::serve_io(store, worker_read, worker_write));

    let (read, mut write) = tokio::io::split(client_side);
    write
        .write_all(b"{\"id\":\"bad-1\",\"type\":\"CACHE_EXPLODE\"}\n")
        .await
        .expect("write");
    write
        .write_all(b"{\"id\":\"ok-1\",\"type\":\"CACHE_STATUS\"}\n")
        .await
        .expect("write");

    let mut lines = BufReader::new(read).lines();
    let mut replies = Vec::new();
    while replies.len() < 2 {
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("worker answers")
            .expect("read")
            .expect("line");
        let value: serde_json::Value = serde_json::from_str(&line).expect("json line");
        if value.get("id").is_some() {
            replies.push(value);
        }
    }
    assert_eq!(replies[0]["id"], "bad-1");
    assert_eq!(replies[0]["type"], "ERROR");
    assert_eq!(replies[1]["id"], "ok-1");
    assert_eq!(replies[1]["type"], "STATUS");
}

#[tokio::test]
async fn dead_coordinator_surfaces_as_an_error() {
    let (client_side, worker_side) = tokio::io::duplex(PIPE);
    drop(worker_side);
    let (read, write) = tokio::io::split(client_side);
    let client = CacheClient::over_io(
        read,
        write,
        CacheTimeouts {
            request: Duration::from_millis(200),
            transfer: Duration::from_millis(200),
        },
    );
    assert!(client.status().await.is_err());
    assert!(!client.is_offline_ready());
}

#[tokio::test]
async fn orchestrator_over_a_pipe_listens_for_notices() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = piped_client(dir.path()).await;
    let bundle = common::bundle_with_runtime();
    let cfg = common::config("http://127.0.0.1:9", bundle.path(), "", "");
    assert_eq!(client.subscriber_count(), 0);

    let orchestrator = Orchestrator::with_cache(cfg, client.clone()).expect("orchestrator");
    assert_eq!(client.subscriber_count(), 1);
    let status = orchestrator.get_status().await;
    assert_eq!(status.cache_summary.expect("summary").generation, "v1");
}

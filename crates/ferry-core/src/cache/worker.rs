//! The cache coordinator loop.
//!
//! Requests are handled strictly one at a time in arrival order, so a lookup
//! issued after a store always observes it.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ferry_protocol::{
    from_line, to_line, CacheNotice, CacheReply, CacheRequest, ReplyEnvelope, RequestEnvelope,
    WorkerMessage,
};

use super::store::CacheStore;

const CHANNEL_DEPTH: usize = 64;

/// Serve requests from `requests` until every sender is gone.
///
/// `OFFLINE_READY` is pushed once the store is open and reconciled, before the
/// first request is read.
pub async fn serve(
    mut store: CacheStore,
    mut requests: mpsc::Receiver<RequestEnvelope>,
    out: mpsc::Sender<WorkerMessage>,
) {
    let ready = CacheNotice::OfflineReady {
        generation: store.generation().to_string(),
        entries: store.len() as u64,
    };
    if out.send(WorkerMessage::Notice(ready)).await.is_err() {
        return;
    }
    info!(target: "ferry::cache", root = %store.root().display(), entries = store.len(), "cache coordinator ready");

    while let Some(RequestEnvelope { id, request }) = requests.recv().await {
        debug!(target: "ferry::cache", %id, kind = request.type_name(), "request");
        let (reply, notice) = handle(&mut store, request).await;
        if out
            .send(WorkerMessage::Reply(ReplyEnvelope { id, reply }))
            .await
            .is_err()
        {
            break;
        }
        if let Some(notice) = notice {
            if out.send(WorkerMessage::Notice(notice)).await.is_err() {
                break;
            }
        }
    }
    debug!(target: "ferry::cache", "cache coordinator stopped");
}

async fn handle(store: &mut CacheStore, request: CacheRequest) -> (CacheReply, Option<CacheNotice>) {
    match request {
        CacheRequest::CacheStore { url, bytes, class } => {
            match store.store(&url, &bytes, class).await {
                Ok(meta) => (
                    CacheReply::Ack { removed: 0 },
                    Some(CacheNotice::CacheUpdated {
                        url,
                        size_bytes: meta.size_bytes,
                        class,
                    }),
                ),
                Err(err) => (error_reply(err), None),
            }
        }
        CacheRequest::CacheLookup { url } => match store.lookup(&url).await {
            Ok(Some((bytes, meta))) => (CacheReply::Hit { bytes, meta }, None),
            Ok(None) => (CacheReply::Miss, None),
            Err(err) => (error_reply(err), None),
        },
        CacheRequest::CacheClear(scope) => match store.clear(&scope).await {
            Ok(removed) => (CacheReply::Ack { removed }, None),
            Err(err) => (error_reply(err), None),
        },
        CacheRequest::CacheStatus => (CacheReply::Status(store.status()), None),
    }
}

fn error_reply(err: impl std::fmt::Display) -> CacheReply {
    warn!(target: "ferry::cache", "request failed: {err}");
    CacheReply::Error {
        message: err.to_string(),
    }
}

/// Speak the protocol as newline-delimited JSON over a byte stream.
pub async fn serve_io<R, W>(store: CacheStore, reader: R, writer: W) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (req_tx, req_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (out_tx, mut out_rx) = mpsc::channel::<WorkerMessage>(CHANNEL_DEPTH);
    let rejects = out_tx.clone();
    let worker = tokio::spawn(serve(store, req_rx, out_tx));

    let read_loop = async move {
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match from_line::<RequestEnvelope>(&line) {
                Ok(env) => {
                    if req_tx.send(env).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(target: "ferry::cache", "malformed request: {err}");
                    if let Some(id) = correlation_id(&line) {
                        let reply = ReplyEnvelope {
                            id,
                            reply: CacheReply::Error {
                                message: format!("malformed request: {err}"),
                            },
                        };
                        let _ = rejects.send(WorkerMessage::Reply(reply)).await;
                    }
                }
            }
        }
        Ok::<_, io::Error>(())
    };

    let write_loop = async move {
        let mut writer = writer;
        while let Some(msg) = out_rx.recv().await {
            let line = to_line(&msg).map_err(io::Error::other)?;
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok::<_, io::Error>(())
    };

    let (read, write) = tokio::join!(read_loop, write_loop);
    if let Err(err) = worker.await {
        warn!(target: "ferry::cache", "cache coordinator task failed: {err}");
    }
    read.and(write)
}

pub async fn serve_stdio(store: CacheStore) -> io::Result<()> {
    serve_io(store, tokio::io::stdin(), tokio::io::stdout()).await
}

fn correlation_id(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ferry_protocol::{ClearScope, EntryClass};

    async fn recv_reply(rx: &mut mpsc::Receiver<WorkerMessage>) -> ReplyEnvelope {
        loop {
            match rx.recv().await.expect("worker alive") {
                WorkerMessage::Reply(env) => return env,
                WorkerMessage::Notice(_) => continue,
            }
        }
    }

    #[tokio::test]
    async fn announces_ready_then_answers_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path(), "v7").await.unwrap();
        let (req_tx, req_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        tokio::spawn(serve(store, req_rx, out_tx));

        match out_rx.recv().await.unwrap() {
            WorkerMessage::Notice(CacheNotice::OfflineReady { generation, entries }) => {
                assert_eq!(generation, "v7");
                assert_eq!(entries, 0);
            }
            other => panic!("expected OFFLINE_READY, got {other:?}"),
        }

        req_tx
            .send(RequestEnvelope {
                id: "1".into(),
                request: CacheRequest::CacheStore {
                    url: "u".into(),
                    bytes: Bytes::from_static(b"abc"),
                    class: EntryClass::Model,
                },
            })
            .await
            .unwrap();
        req_tx
            .send(RequestEnvelope {
                id: "2".into(),
                request: CacheRequest::CacheLookup { url: "u".into() },
            })
            .await
            .unwrap();

        let first = recv_reply(&mut out_rx).await;
        assert_eq!(first.id, "1");
        assert_eq!(first.reply, CacheReply::Ack { removed: 0 });
        match out_rx.recv().await.unwrap() {
            WorkerMessage::Notice(CacheNotice::CacheUpdated { url, size_bytes, .. }) => {
                assert_eq!(url, "u");
                assert_eq!(size_bytes, 3);
            }
            other => panic!("expected CACHE_UPDATED, got {other:?}"),
        }
        let second = recv_reply(&mut out_rx).await;
        assert_eq!(second.id, "2");
        assert!(matches!(second.reply, CacheReply::Hit { .. }));

        req_tx
            .send(RequestEnvelope {
                id: "3".into(),
                request: CacheRequest::CacheClear(ClearScope::All),
            })
            .await
            .unwrap();
        assert_eq!(recv_reply(&mut out_rx).await.reply, CacheReply::Ack { removed: 1 });
    }

    #[test]
    fn correlation_id_survives_bad_payloads() {
        assert_eq!(
            correlation_id(r#"{"id":"abc","type":"CACHE_EXPLODE"}"#).as_deref(),
            Some("abc")
        );
        assert_eq!(correlation_id("not json"), None);
    }
}

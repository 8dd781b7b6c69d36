use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use ferry_protocol::{
    from_line, to_line, CacheNotice, CacheReply, CacheRequest, CacheSummary, ClearScope,
    EntryClass, EntryMeta, RequestEnvelope, WorkerMessage,
};

use super::store::CacheStore;
use super::worker;
use crate::error::CacheProtocolError;

const CHANNEL_DEPTH: usize = 64;
const NOTICE_DEPTH: usize = 64;

#[derive(Clone, Copy, Debug)]
pub struct CacheTimeouts {
    /// Deadline for small requests (`CACHE_STATUS`, `CACHE_CLEAR`).
    pub request: Duration,
    /// Deadline for requests that carry a payload either way.
    pub transfer: Duration,
}

impl Default for CacheTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(5),
            transfer: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub bytes: Bytes,
    pub meta: EntryMeta,
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<CacheReply>>>>;

/// Handle to a cache coordinator, in this process or behind a pipe.
///
/// Every request carries a fresh correlation id; replies may come back in any
/// order and are routed to their caller by that id.
#[derive(Clone)]
pub struct CacheClient {
    inner: Arc<Inner>,
}

struct Inner {
    requests: mpsc::Sender<RequestEnvelope>,
    pending: Pending,
    notices: broadcast::Sender<CacheNotice>,
    offline_ready: Arc<AtomicBool>,
    timeouts: CacheTimeouts,
    _child: Mutex<Option<Child>>,
}

impl CacheClient {
    /// Run the coordinator as a task inside this process.
    pub fn in_process(store: CacheStore, timeouts: CacheTimeouts) -> Self {
        let (req_tx, req_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
        tokio::spawn(worker::serve(store, req_rx, out_tx));
        Self::from_channels(req_tx, out_rx, timeouts, None)
    }

    /// Talk newline-delimited JSON to a coordinator on the other end of a byte stream.
    pub fn over_io<R, W>(reader: R, writer: W, timeouts: CacheTimeouts) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::over_io_with_child(reader, writer, timeouts, None)
    }

    /// Spawn `command` as an out-of-process coordinator speaking on its stdio.
    pub fn spawn_worker(
        mut command: Command,
        timeouts: CacheTimeouts,
    ) -> Result<Self, CacheProtocolError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| CacheProtocolError::Unavailable(format!("spawn cache worker: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CacheProtocolError::Unavailable("cache worker stdin missing".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CacheProtocolError::Unavailable("cache worker stdout missing".into()))?;
        Ok(Self::over_io_with_child(stdout, stdin, timeouts, Some(child)))
    }

    fn over_io_with_child<R, W>(
        reader: R,
        writer: W,
        timeouts: CacheTimeouts,
        child: Option<Child>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (req_tx, mut req_rx) = mpsc::channel::<RequestEnvelope>(CHANNEL_DEPTH);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);

        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(env) = req_rx.recv().await {
                let line = match to_line(&env) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(target: "ferry::cache", "request encode failed: {err}");
                        continue;
                    }
                };
                let sent = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await
                };
                if let Err(err) = sent.await {
                    warn!(target: "ferry::cache", "cache pipe write failed: {err}");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match from_line::<WorkerMessage>(&line) {
                        Ok(msg) => {
                            if out_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(target: "ferry::cache", "malformed cache message: {err}"),
                    },
                    Ok(None) => break,
                    Err(err) => {
                        warn!(target: "ferry::cache", "cache pipe read failed: {err}");
                        break;
                    }
                }
            }
        });

        Self::from_channels(req_tx, out_rx, timeouts, child)
    }

    fn from_channels(
        requests: mpsc::Sender<RequestEnvelope>,
        mut incoming: mpsc::Receiver<WorkerMessage>,
        timeouts: CacheTimeouts,
        child: Option<Child>,
    ) -> Self {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (notices, _) = broadcast::channel(NOTICE_DEPTH);
        let offline_ready = Arc::new(AtomicBool::new(false));

        let router_pending = pending.clone();
        let router_notices = notices.clone();
        let router_ready = offline_ready.clone();
        tokio::spawn(async move {
            while let Some(msg) = incoming.recv().await {
                match msg {
                    WorkerMessage::Reply(env) => {
                        let waiter = router_pending.lock().remove(&env.id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(env.reply);
                            }
                            None => debug!(target: "ferry::cache", id = %env.id, "reply without a waiter"),
                        }
                    }
                    WorkerMessage::Notice(notice) => {
                        if matches!(notice, CacheNotice::OfflineReady { .. }) {
                            router_ready.store(true, Ordering::SeqCst);
                        }
                        let _ = router_notices.send(notice);
                    }
                }
            }
            // Dropping the senders fails every outstanding call with Disconnected.
            router_pending.lock().clear();
            router_ready.store(false, Ordering::SeqCst);
        });

        Self {
            inner: Arc::new(Inner {
                requests,
                pending,
                notices,
                offline_ready,
                timeouts,
                _child: Mutex::new(child),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheNotice> {
        self.inner.notices.subscribe()
    }

    /// Live notice subscribers across every clone of this client.
    pub fn subscriber_count(&self) -> usize {
        self.inner.notices.receiver_count()
    }

    /// Whether the coordinator has announced `OFFLINE_READY` and is still connected.
    pub fn is_offline_ready(&self) -> bool {
        self.inner.offline_ready.load(Ordering::SeqCst)
    }

    pub async fn store(
        &self,
        url: &str,
        bytes: Bytes,
        class: EntryClass,
    ) -> Result<(), CacheProtocolError> {
        let request = CacheRequest::CacheStore {
            url: url.to_string(),
            bytes,
            class,
        };
        match self.call(request, self.inner.timeouts.transfer).await? {
            CacheReply::Ack { .. } => Ok(()),
            other => Err(unexpected("CACHE_STORE", &other)),
        }
    }

    pub async fn lookup(&self, url: &str) -> Result<Option<CacheHit>, CacheProtocolError> {
        let request = CacheRequest::CacheLookup {
            url: url.to_string(),
        };
        match self.call(request, self.inner.timeouts.transfer).await? {
            CacheReply::Hit { bytes, meta } => Ok(Some(CacheHit { bytes, meta })),
            CacheReply::Miss => Ok(None),
            other => Err(unexpected("CACHE_LOOKUP", &other)),
        }
    }

    /// Returns the number of entries removed.
    pub async fn clear(&self, scope: ClearScope) -> Result<u64, CacheProtocolError> {
        match self
            .call(CacheRequest::CacheClear(scope), self.inner.timeouts.request)
            .await?
        {
            CacheReply::Ack { removed } => Ok(removed),
            other => Err(unexpected("CACHE_CLEAR", &other)),
        }
    }

    pub async fn status(&self) -> Result<CacheSummary, CacheProtocolError> {
        match self
            .call(CacheRequest::CacheStatus, self.inner.timeouts.request)
            .await?
        {
            CacheReply::Status(summary) => Ok(summary),
            other => Err(unexpected("CACHE_STATUS", &other)),
        }
    }

    async fn call(
        &self,
        request: CacheRequest,
        timeout: Duration,
    ) -> Result<CacheReply, CacheProtocolError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id.clone(), tx);
        let env = RequestEnvelope {
            id: id.clone(),
            request,
        };
        if self.inner.requests.send(env).await.is_err() {
            self.inner.pending.lock().remove(&id);
            return Err(CacheProtocolError::Disconnected);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(CacheReply::Error { message })) => Err(CacheProtocolError::Remote(message)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CacheProtocolError::Disconnected),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                Err(CacheProtocolError::Timeout(timeout))
            }
        }
    }
}

fn unexpected(request: &'static str, reply: &CacheReply) -> CacheProtocolError {
    CacheProtocolError::UnexpectedReply {
        request,
        got: reply.type_name(),
    }
}

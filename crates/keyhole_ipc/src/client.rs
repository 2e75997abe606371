//! The agent-side half of the channel (§4.6): multiplexes many in-flight
//! requests over one socket by correlation id, reconnects with backoff on
//! an unexpected close, and never lets a superseded connection's events
//! fire after `disconnect()`/`update_connection()` replace it.

use crate::framing::{read_frame, write_frame};
use crate::wire::{IpcRequest, IpcResponse};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_BACKOFF_BASE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request timed out")]
    Timeout,
    #[error("IPC client disconnected")]
    Disconnected,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<IpcResponse>>>>;

struct Connection {
    generation: u64,
    writer: Mutex<WriteHalf<UnixStream>>,
}

/// Multiplexing IPC client. Cloning shares the same pending map and
/// connection state; intended to be held behind an `Arc` by callers that
/// need to issue requests from multiple call sites concurrently.
pub struct Client {
    socket_path: Mutex<PathBuf>,
    ott: Mutex<String>,
    conn: Arc<Mutex<Option<Arc<Connection>>>>,
    pending: PendingMap,
    generation_counter: AtomicU64,
    timeout: Duration,
}

impl Client {
    pub async fn connect(socket_path: PathBuf, ott: String) -> Result<Arc<Self>, ClientError> {
        let client = Arc::new(Self {
            socket_path: Mutex::new(socket_path),
            ott: Mutex::new(ott),
            conn: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation_counter: AtomicU64::new(0),
            timeout: DEFAULT_TIMEOUT,
        });
        client.establish().await?;
        Ok(client)
    }

    async fn establish(self: &Arc<Self>) -> Result<(), ClientError> {
        let path = self.socket_path.lock().await.clone();
        let stream = UnixStream::connect(&path).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let generation = self.generation_counter.fetch_add(1, Ordering::SeqCst) + 1;

        *self.conn.lock().await = Some(Arc::new(Connection {
            generation,
            writer: Mutex::new(write_half),
        }));

        let pending = self.pending.clone();
        let conn_holder = self.conn.clone();
        let this = self.clone();
        tokio::spawn(async move {
            read_loop(read_half, pending, generation, conn_holder, this).await;
        });
        Ok(())
    }

    /// Send one request and await its matching response, or a timeout
    /// after 30s (§4.6).
    pub async fn send(self: &Arc<Self>, req: IpcRequest) -> Result<IpcResponse, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(req.id.clone(), tx);

        let conn = self.conn.lock().await.clone().ok_or(ClientError::Disconnected)?;
        let payload = serde_json::to_vec(&req).map_err(|e| ClientError::Io(e.into()))?;
        {
            let mut writer = conn.writer.lock().await;
            if write_frame(&mut *writer, &payload).await.is_err() {
                self.pending.lock().await.remove(&req.id);
                return Err(ClientError::Disconnected);
            }
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&req.id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Tear down the connection without attempting to reconnect: the
    /// connection reference is cleared first so the read loop's close
    /// path sees itself as already-superseded.
    pub async fn disconnect(self: &Arc<Self>) {
        let old = self.conn.lock().await.take();
        if let Some(conn) = old {
            let _ = conn.writer.lock().await.shutdown().await;
        }
        reject_all_pending(&self.pending).await;
    }

    /// Swap to a new sidecar socket + token after a supervised restart.
    pub async fn update_connection(self: &Arc<Self>, socket_path: PathBuf, ott: String) -> Result<(), ClientError> {
        self.disconnect().await;
        *self.socket_path.lock().await = socket_path;
        *self.ott.lock().await = ott;
        self.establish().await
    }
}

async fn reject_all_pending(pending: &PendingMap) {
    let mut map = pending.lock().await;
    map.clear(); // dropping the senders rejects every waiting `send()` with `ClientError::Disconnected`.
}

async fn read_loop(
    mut read_half: tokio::io::ReadHalf<UnixStream>,
    pending: PendingMap,
    generation: u64,
    conn_holder: Arc<Mutex<Option<Arc<Connection>>>>,
    client: Arc<Client>,
) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<IpcResponse>(&bytes) {
                Ok(resp) => {
                    if let Some(tx) = pending.lock().await.remove(&resp.id) {
                        let _ = tx.send(resp);
                    }
                }
                Err(_) => continue, // malformed frame: discard and keep reading
            },
            Ok(None) | Err(_) => break,
        }
    }

    // Only the connection that is still current triggers reconnection;
    // a read loop outlived by `disconnect()`/`update_connection()` exits quietly.
    let is_current = matches!(
        conn_holder.lock().await.as_ref(),
        Some(c) if c.generation == generation
    );
    if !is_current {
        return;
    }
    *conn_holder.lock().await = None;

    for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
        tokio::time::sleep(RECONNECT_BACKOFF_BASE * attempt).await;
        if client.establish().await.is_ok() {
            return;
        }
    }
    reject_all_pending(&pending).await;
}

//! Bidirectional call/return link over one TCP stream.
//!
//! Frames are newline-delimited JSON objects. Either side may call the other:
//!
//! ```text
//! {"kind":"call","id":7,"body":{"method":"exit","params":{"area":"1000"}}}
//! {"kind":"reply","id":7,"ok":true,"data":0}
//! {"kind":"call","body":{"method":"output","params":{...}}}      // no id: notification
//! ```
//!
//! Calls with an id are each handled on their own task so that a handler may
//! call back over the same link (SinkFS asking the Source for a blob while the
//! Source waits on `sync`). Notifications are handled one at a time, in
//! arrival order, so output chunks are never reordered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{io_err, RemexError};

/// Outbound queue depth. A full queue makes senders wait, which is what
/// throttles a chatty process when the peer reads slowly.
const OUTBOUND_QUEUE: usize = 64;
const NOTIFY_QUEUE: usize = 64;

/// One line on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Frame {
    Call {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        body: Value,
    },
    Reply {
        id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Frame {
    fn reply(id: u64, result: Result<Value, RemexError>) -> Self {
        match result {
            Ok(data) => Frame::Reply {
                id,
                ok: true,
                data: Some(data),
                error: None,
            },
            Err(err) => Frame::Reply {
                id,
                ok: false,
                data: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// The local object a link serves.
#[async_trait]
pub trait LinkHandler: Send + Sync {
    /// Handle one inbound call body and produce the reply value.
    async fn handle(&self, body: Value) -> Result<Value, RemexError>;

    /// Called exactly once when the link shuts down, from either side.
    async fn closed(&self) {}
}

type Pending = HashMap<u64, oneshot::Sender<Result<Value, RemexError>>>;

struct Shared {
    peer: String,
    outbound: mpsc::Sender<Frame>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    local: Mutex<Option<Arc<dyn LinkHandler>>>,
}

impl Shared {
    /// Mark closed, fail every pending call, and hand back the local handler
    /// if this was the first shutdown.
    fn shutdown(&self) -> Option<Arc<dyn LinkHandler>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        let drained: Vec<_> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(poisoned) => poisoned.into_inner().drain().collect(),
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(RemexError::LinkClosed));
        }
        let _ = self.closed_tx.send(true);
        match self.local.lock() {
            Ok(mut local) => local.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn take_pending(&self, id: u64) -> Option<oneshot::Sender<Result<Value, RemexError>>> {
        match self.pending.lock() {
            Ok(mut pending) => pending.remove(&id),
            Err(poisoned) => poisoned.into_inner().remove(&id),
        }
    }
}

/// Cloneable handle for calling the peer. Usable before the link is opened;
/// frames queue until the writer starts.
#[derive(Clone)]
pub struct RemoteHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("peer", &self.shared.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RemoteHandle {
    /// Call the peer and wait for its reply.
    pub async fn call(&self, body: Value) -> Result<Value, RemexError> {
        if self.is_closed() {
            return Err(RemexError::LinkClosed);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        match self.shared.pending.lock() {
            Ok(mut pending) => pending.insert(id, tx),
            Err(poisoned) => poisoned.into_inner().insert(id, tx),
        };
        // Re-check after registering: a concurrent shutdown either drained us
        // or flipped the flag before we looked.
        if self.is_closed() {
            self.shared.take_pending(id);
            return Err(RemexError::LinkClosed);
        }

        let frame = Frame::Call { id: Some(id), body };
        if self.shared.outbound.send(frame).await.is_err() {
            self.shared.take_pending(id);
            return Err(RemexError::LinkClosed);
        }
        rx.await.map_err(|_| RemexError::LinkClosed)?
    }

    /// Send a one-way call. Resolves once the frame is queued.
    pub async fn notify(&self, body: Value) -> Result<(), RemexError> {
        if self.is_closed() {
            return Err(RemexError::LinkClosed);
        }
        self.shared
            .outbound
            .send(Frame::Call { id: None, body })
            .await
            .map_err(|_| RemexError::LinkClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Peer address this link talks to.
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Resolve once the link has shut down.
    pub async fn wait_closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

enum LinkState {
    Ready {
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        outbound_rx: mpsc::Receiver<Frame>,
    },
    Open {
        tasks: Vec<JoinHandle<()>>,
    },
    Closed,
}

/// A link between a local [`LinkHandler`] and the peer on the other end of a
/// TCP stream.
pub struct Link {
    remote: RemoteHandle,
    state: Mutex<LinkState>,
}

impl Link {
    /// Wrap a connected stream. The link is inert until [`Link::open`].
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown-peer".to_string());
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (closed_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            peer,
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(10_000),
            closed: AtomicBool::new(false),
            closed_tx,
            local: Mutex::new(None),
        });

        Self {
            remote: RemoteHandle { shared },
            state: Mutex::new(LinkState::Ready {
                reader,
                writer,
                outbound_rx,
            }),
        }
    }

    /// Handle for calling the peer.
    pub fn remote(&self) -> RemoteHandle {
        self.remote.clone()
    }

    /// Start serving `local` and start delivering queued outbound frames.
    pub fn open(&self, local: Arc<dyn LinkHandler>) -> Result<(), RemexError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| RemexError::Remote("link state poisoned".to_string()))?;
        if !matches!(*state, LinkState::Ready { .. }) {
            return Err(RemexError::InvalidArgument(
                "link already opened or closed".to_string(),
            ));
        }
        let LinkState::Ready {
            reader,
            writer,
            outbound_rx,
        } = std::mem::replace(&mut *state, LinkState::Closed)
        else {
            return Err(RemexError::InvalidArgument(
                "link already opened or closed".to_string(),
            ));
        };

        let shared = self.remote.shared.clone();
        match shared.local.lock() {
            Ok(mut slot) => *slot = Some(local.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(local.clone()),
        }

        let (notify_tx, notify_rx) = mpsc::channel::<Value>(NOTIFY_QUEUE);
        let writer_task = tokio::spawn(writer_loop(shared.clone(), writer, outbound_rx));
        let notify_task = tokio::spawn(notification_loop(local.clone(), notify_rx));
        let reader_task = tokio::spawn(reader_loop(shared, reader, local, notify_tx));

        *state = LinkState::Open {
            tasks: vec![reader_task, writer_task, notify_task],
        };
        tracing::debug!(peer = %self.remote.peer(), "link opened");
        Ok(())
    }

    /// Close the link. Idempotent. Pending calls fail with
    /// [`RemexError::LinkClosed`] and the local handler is told once.
    pub async fn close(&self) -> Result<(), RemexError> {
        let previous = match self.state.lock() {
            Ok(mut state) => std::mem::replace(&mut *state, LinkState::Closed),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), LinkState::Closed),
        };
        if let LinkState::Open { tasks } = previous {
            for task in tasks {
                task.abort();
            }
        }
        if let Some(local) = self.remote.shared.shutdown() {
            local.closed().await;
        }
        tracing::debug!(peer = %self.remote.peer(), "link closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.remote.is_closed()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let LinkState::Open { tasks } = std::mem::replace(&mut *state, LinkState::Closed) {
                for task in tasks {
                    task.abort();
                }
            }
        }
        // The handler's async `closed` hook cannot run from Drop; pending
        // callers still get LinkClosed.
        let _ = self.remote.shared.shutdown();
    }
}

async fn writer_loop(
    shared: Arc<Shared>,
    mut writer: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Frame>,
) {
    let mut closed_rx = shared.closed_tx.subscribe();
    loop {
        let frame = tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = closed_rx.wait_for(|closed| *closed) => break,
        };
        let line = match serde_json::to_string(&frame) {
            Ok(line) => line,
            Err(err) => {
                tracing::error!(peer = %shared.peer, error = %err, "failed to encode link frame");
                continue;
            }
        };
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            tracing::debug!(peer = %shared.peer, error = %err, "link write failed");
            break;
        }
    }
    if let Some(local) = shared.shutdown() {
        local.closed().await;
    }
}

async fn reader_loop(
    shared: Arc<Shared>,
    reader: OwnedReadHalf,
    local: Arc<dyn LinkHandler>,
    notify_tx: mpsc::Sender<Value>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                let err = io_err(format!("link {}", shared.peer), err);
                tracing::debug!(error = %err, "link read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame: Frame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(peer = %shared.peer, error = %err, "dropping malformed link frame");
                continue;
            }
        };

        match frame {
            Frame::Call { id: Some(id), body } => {
                let local = local.clone();
                let outbound = shared.outbound.clone();
                tokio::spawn(async move {
                    let result = local.handle(body).await;
                    let _ = outbound.send(Frame::reply(id, result)).await;
                });
            }
            Frame::Call { id: None, body } => {
                if notify_tx.send(body).await.is_err() {
                    break;
                }
            }
            Frame::Reply {
                id,
                ok,
                data,
                error,
            } => {
                let Some(tx) = shared.take_pending(id) else {
                    tracing::warn!(peer = %shared.peer, id, "reply for unknown call");
                    continue;
                };
                let result = if ok {
                    Ok(data.unwrap_or(Value::Null))
                } else {
                    Err(RemexError::Remote(
                        error.unwrap_or_else(|| "unknown remote error".to_string()),
                    ))
                };
                let _ = tx.send(result);
            }
        }
    }

    if let Some(local) = shared.shutdown() {
        local.closed().await;
    }
}

async fn notification_loop(local: Arc<dyn LinkHandler>, mut notify_rx: mpsc::Receiver<Value>) {
    while let Some(body) = notify_rx.recv().await {
        if let Err(err) = local.handle(body).await {
            tracing::warn!(error = %err, "notification handler failed");
        }
    }
}

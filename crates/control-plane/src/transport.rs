//! One live WebSocket connection to the control plane.
//!
//! Implements call/completion correlation by UUID, fire-and-forget sends,
//! keep-alive pings and push dispatch. A [`Transport`] never reconnects; the
//! client replaces it with a new one, tagged with a higher generation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use fleetlink_protocol::constants::Method;
use fleetlink_protocol::envelope::Frame;

use crate::error::ClientError;

/// Calls awaiting a completion, keyed by invocation id.
pub(crate) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Frame>>>>;

/// Receives every inbound frame that is not a completion.
pub(crate) type PushCallback = Box<dyn Fn(Frame) + Send + Sync>;

/// Fires once when the connection drops without a local close.
pub(crate) type ClosedCallback = Box<dyn Fn() + Send + Sync>;

pub(crate) struct Transport {
    generation: u64,
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
    read_handle: JoinHandle<()>,
    ping_handle: JoinHandle<()>,
    _write_handle: JoinHandle<()>,
}

impl Transport {
    /// Spawns the read, write and ping pumps over an established stream.
    pub(crate) fn start<S>(
        stream: WebSocketStream<S>,
        generation: u64,
        keep_alive: Duration,
        server_timeout: Duration,
        on_push: PushCallback,
        on_closed: ClosedCallback,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (write, read) = stream.split();
        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(crate::pumps::write::write_pump(
            write,
            write_rx,
            cancel.clone(),
        ));

        let read_handle = tokio::spawn(crate::pumps::read::read_pump(
            read,
            pending.clone(),
            on_push,
            on_closed,
            closed.clone(),
            write_tx.clone(),
            cancel.clone(),
            server_timeout,
        ));

        let ping_handle = tokio::spawn(crate::pumps::ping::ping_pump(
            write_tx.clone(),
            keep_alive,
            cancel.clone(),
        ));

        Self {
            generation,
            write_tx,
            pending,
            closed,
            cancel,
            read_handle,
            ping_handle,
            _write_handle: write_handle,
        }
    }

    /// Invokes `target` and waits for its completion.
    ///
    /// Fails with [`ClientError::Timeout`] after `timeout`, with
    /// [`ClientError::Cancelled`] when `cancel` fires first, and with
    /// [`ClientError::Remote`] when the completion carries an error.
    pub(crate) async fn invoke<T: Serialize>(
        &self,
        target: Method,
        payload: &T,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Frame, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let frame = Frame::new(Some(id.clone()), target, Some(payload))?;
        let json = serde_json::to_string(&frame)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if self.is_closed() {
                return Err(ClientError::Closed);
            }
            pending.insert(id.clone(), tx);
        }

        let call = async {
            self.write_tx
                .send(tungstenite::Message::Text(json.into()))
                .await
                .map_err(|_| ClientError::Closed)?;
            rx.await.map_err(|_| ClientError::Closed)
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            r = tokio::time::timeout(timeout, call) => r.unwrap_or_else(|_| Err(ClientError::Timeout)),
        };

        // Clean up pending entry on any exit path.
        self.pending.lock().await.remove(&id);

        let resp = result?;
        if let Some(err) = &resp.error {
            return Err(ClientError::Remote {
                code: err.code,
                message: err.message.clone(),
            });
        }
        Ok(resp)
    }

    /// Queues a frame without an id; no completion is expected.
    pub(crate) async fn send<T: Serialize>(
        &self,
        target: Method,
        payload: &T,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let frame = Frame::new(None, target, Some(payload))?;
        let json = serde_json::to_string(&frame)?;
        let msg = tungstenite::Message::Text(json.into());

        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            r = tokio::time::timeout(timeout, self.write_tx.send(msg)) => match r {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(ClientError::Closed),
                Err(_) => Err(ClientError::Timeout),
            },
        }
    }

    /// Closes the connection without firing the closed callback.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.ping_handle.abort();
        // The write pump is left to flush a close frame.
    }
}

//! WebSocket read pump: routes completions and dispatches pushes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use fleetlink_protocol::constants::{Method, WS_MAX_MESSAGE_SIZE};
use fleetlink_protocol::envelope::Frame;

use crate::transport::{ClosedCallback, PendingMap, PushCallback};

/// Reads frames from the WebSocket until it closes.
///
/// Any inbound message resets the server-silence deadline; when nothing
/// arrives within `server_timeout` the connection is treated as dead.
/// On exit, outstanding calls are failed and `on_closed` fires unless the
/// shutdown was requested locally through `cancel`.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: PendingMap,
    on_push: PushCallback,
    on_closed: ClosedCallback,
    closed: Arc<AtomicBool>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
    server_timeout: Duration,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(server_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                warn!(timeout_secs = server_timeout.as_secs(), "control plane silent, closing connection");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        deadline.as_mut().reset(tokio::time::Instant::now() + server_timeout);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text_message(&text, &pending, &on_push).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(frame) => {
                                debug!(frame = ?frame, "received close frame");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every waiting call with `Closed`.
    pending.lock().await.clear();

    let requested = cancel.is_cancelled();
    cancel.cancel();
    if !requested {
        on_closed();
    }
}

/// Handles a text frame from the WebSocket.
async fn handle_text_message(text: &str, pending: &PendingMap, on_push: &PushCallback) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("frame too large ({} bytes), dropping", text.len());
        return;
    }

    let frame: Frame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!("failed to parse frame: {e}");
            return;
        }
    };

    trace!(target_method = ?frame.target, id = ?frame.id, "received frame");

    if frame.target == Method::Completion {
        let Some(id) = frame.id.as_deref() else {
            debug!("completion without id, dropping");
            return;
        };
        match pending.lock().await.remove(id) {
            Some(tx) => {
                let _ = tx.send(frame);
            }
            None => debug!(id, "completion for unknown call, dropping"),
        }
        return;
    }

    on_push(frame);
}

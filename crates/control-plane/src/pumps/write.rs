//! WebSocket write pump: serialises outbound frames.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Writes queued frames to the WebSocket until cancelled, the queue closes or
/// a write fails, then sends a normal close frame.
///
/// A write failure only stops the pump; the read pump notices the broken
/// connection and reports it.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let mut frames: u64 = 0;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = write_rx.recv() => next,
        };
        let Some(frame) = next else { break };
        if let Err(e) = write.send(frame).await {
            warn!(error = %e, frames, "control-plane write failed");
            break;
        }
        frames += 1;
    }

    let close = CloseFrame {
        code: CloseCode::Normal,
        reason: "agent closing".into(),
    };
    if let Err(e) = write.send(tungstenite::Message::Close(Some(close))).await {
        debug!(error = %e, "close frame not sent");
    }
    trace!(frames, "write pump stopped");
}

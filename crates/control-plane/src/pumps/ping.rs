//! WebSocket ping pump: periodic keep-alive pings.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Sends a keep-alive ping every `interval` until cancelled or the writer
/// goes away. Each ping carries its sequence number (big-endian `u64`).
pub(crate) async fn ping_pump(
    write_tx: mpsc::Sender<tungstenite::Message>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut seq: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        seq += 1;
        let ping = tungstenite::Message::Ping(seq.to_be_bytes().to_vec().into());
        if write_tx.send(ping).await.is_err() {
            break;
        }
        trace!(seq, "keep-alive ping queued");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_ping_each_interval() {
        tokio::time::pause();
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ping_pump(tx, Duration::from_secs(15), cancel.clone()));

        for expected in 1u64..=2 {
            match rx.recv().await.unwrap() {
                tungstenite::Message::Ping(data) => {
                    assert_eq!(data.to_vec(), expected.to_be_bytes().to_vec());
                }
                other => panic!("expected ping, got {other:?}"),
            }
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stops_when_writer_is_gone() {
        tokio::time::pause();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = tokio::spawn(ping_pump(tx, Duration::from_secs(1), CancellationToken::new()));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stops_on_cancel() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ping_pump(tx, Duration::from_secs(15), cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");
    }
}

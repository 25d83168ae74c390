//! Reconnection with exponential backoff.
//!
//! Contains the [`ReconnectPolicy`], the cancellation helper for the active
//! reconnect loop, and the loop itself.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientInner;
use crate::error::ClientError;
use crate::types::ConnectionState;

/// Maximum fraction by which a delay is inflated with random jitter.
pub const JITTER_FRACTION: f64 = 0.2;

/// Backoff between reconnect attempts.
///
/// `delay = min(base * 2^attempt, max)`, then inflated by up to 20% jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay for a zero-based `attempt`, before jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.min(62) as i32;
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Delay for `attempt` with a jitter sample `jitter` in `[0, 1)`.
    ///
    /// Pure function of its inputs; out-of-range samples are clamped.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.base_delay_for(attempt)
            .mul_f64(1.0 + JITTER_FRACTION * jitter)
    }

    /// Delay for `attempt`, drawing jitter from `rng`.
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        self.delay_with_jitter(attempt, rng.r#gen::<f64>())
    }
}

/// Slot holding the token of the running reconnect loop, tagged with the
/// loop's id so a finished loop only clears its own entry.
pub(crate) type ReconnectSlot = parking_lot::Mutex<Option<(u64, CancellationToken)>>;

/// Cancels the active reconnect loop, if any.
pub(crate) fn cancel_reconnect(slot: &ReconnectSlot) {
    if let Some((_, token)) = slot.lock().take() {
        token.cancel();
    }
}

/// Reconnection loop with exponential backoff.
///
/// Runs until a new transport is installed, the loop is cancelled (explicit
/// connect or disconnect), or `max_reconnect_attempts` is exhausted, in which
/// case the client moves to `Failed`. Reuses the certificate fetched by the
/// last explicit connect.
///
/// Returns a boxed future to break the type cycle with the transport's
/// closed callback, which spawns this function.
pub(crate) fn reconnect_loop(
    inner: Arc<ClientInner>,
    loop_id: u64,
    cancel: CancellationToken,
) -> Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        let url = match inner.endpoint_url() {
            Ok(url) => url,
            Err(e) => {
                inner.transition(ConnectionState::Failed, Some(e.to_string()));
                return;
            }
        };
        let policy = inner.options.reconnect;
        let mut attempt: u32 = 0;
        let mut last_error = String::from("connection lost");

        loop {
            if inner.state() != ConnectionState::Reconnecting {
                debug!("reconnect loop no longer needed");
                break;
            }
            if let Some(max) = inner.options.max_reconnect_attempts
                && attempt >= max
            {
                let _lifecycle = inner.lifecycle.lock().await;
                if !cancel.is_cancelled() {
                    warn!(attempts = attempt, "reconnect attempts exhausted");
                    inner.transition(ConnectionState::Failed, Some(last_error));
                }
                break;
            }

            let delay = {
                let mut rng = rand::thread_rng();
                policy.delay_for_attempt(attempt, &mut rng)
            };
            inner.metrics.reconnect_attempt();
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting to control plane"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("reconnect cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let certificate = inner.certificate.lock().clone();
            match inner.open_transport(&url, certificate.as_ref(), &cancel).await {
                Ok(transport) => {
                    let _lifecycle = inner.lifecycle.lock().await;
                    if cancel.is_cancelled() || inner.state() != ConnectionState::Reconnecting {
                        debug!("reconnect superseded, discarding transport");
                        transport.close();
                        return;
                    }
                    let generation = transport.generation();
                    let closed = transport.is_closed();
                    *inner.transport.write() = Some(transport);
                    inner.transition(ConnectionState::Connected, None);
                    info!(attempt, "reconnected to control plane");
                    if closed {
                        inner.handle_transport_closed(generation);
                    }
                    break;
                }
                Err(ClientError::Cancelled) => return,
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    last_error = e.to_string();
                }
            }

            attempt = attempt.saturating_add(1);
        }

        let mut slot = inner.reconnect_cancel.lock();
        if slot.as_ref().is_some_and(|(id, _)| *id == loop_id) {
            *slot = None;
        }
    })
}

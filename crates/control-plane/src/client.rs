//! Control-plane client.
//!
//! Owns the single duplex connection, drives the [`ConnectionState`]
//! machine, reconnects with backoff when the transport drops, validates
//! inbound commands and delivers heartbeats, command results and telemetry.

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use fleetlink_protocol::constants::{HUB_PATH, Method};
use fleetlink_protocol::envelope::Frame;
use fleetlink_protocol::messages::{CommandResult, HeartbeatPayload};
use fleetlink_protocol::telemetry::TelemetryPayload;

use crate::certificate::{CertificateStore, ClientCertificate};
use crate::connector::Connector;
use crate::error::ClientError;
use crate::metrics::{ClientMetrics, MetricsRecorder};
use crate::reconnection::{ReconnectSlot, cancel_reconnect, reconnect_loop};
use crate::transport::{ClosedCallback, PushCallback, Transport};
use crate::types::{
    AgentIdentity, ClientEvent, ConnectionState, ConnectionStateChanged, ControlPlaneOptions,
};
use crate::validation::{sanitize_command_type, validate_command};

/// State shared between the client handle, the transport callbacks and the
/// reconnect loop.
pub(crate) struct ClientInner {
    pub(crate) options: ControlPlaneOptions,
    identity: AgentIdentity,
    connector: Arc<dyn Connector>,
    certificates: Arc<dyn CertificateStore>,
    pub(crate) metrics: Arc<dyn ClientMetrics>,
    state: RwLock<ConnectionState>,
    pub(crate) transport: RwLock<Option<Arc<Transport>>>,
    /// Certificate fetched by the last explicit connect; reused on reconnect.
    pub(crate) certificate: Mutex<Option<ClientCertificate>>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    pub(crate) reconnect_cancel: ReconnectSlot,
    manual_disconnect: AtomicBool,
    /// Serialises `connect` and `disconnect`.
    pub(crate) lifecycle: tokio::sync::Mutex<()>,
    next_generation: AtomicU64,
    next_loop_id: AtomicU64,
}

impl ClientInner {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Applies a state transition and emits the change event.
    ///
    /// Illegal transitions are refused and produce no event.
    pub(crate) fn transition(&self, next: ConnectionState, error: Option<String>) -> bool {
        let mut state = self.state.write();
        let previous = *state;
        if !previous.can_transition_to(next) {
            warn!(from = %previous, to = %next, "refusing illegal connection state transition");
            return false;
        }
        *state = next;
        info!(from = %previous, to = %next, error = error.as_deref(), "connection state changed");
        // Emitted under the state lock so events arrive in transition order.
        self.emit(ClientEvent::StateChanged(ConnectionStateChanged {
            previous,
            current: next,
            error,
            timestamp: Utc::now(),
        }));
        true
    }

    fn emit(&self, event: ClientEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("client event receiver dropped");
        }
    }

    /// Resolves the hub URL from the configured endpoint.
    ///
    /// Only `wss://` is accepted; `https://` is mapped onto it.
    pub(crate) fn endpoint_url(&self) -> Result<Url, ClientError> {
        let mut url = Url::parse(self.options.endpoint.trim())
            .map_err(|e| ClientError::InvalidEndpoint(e.to_string()))?;
        match url.scheme() {
            "wss" => {}
            "https" => url
                .set_scheme("wss")
                .map_err(|()| ClientError::InvalidEndpoint("cannot map https to wss".into()))?,
            _ => return Err(ClientError::InsecureEndpoint),
        }
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}{HUB_PATH}"));
        Ok(url)
    }

    /// Opens a new transport under the handshake timeout and `cancel`.
    pub(crate) async fn open_transport(
        self: &Arc<Self>,
        url: &Url,
        certificate: Option<&ClientCertificate>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Transport>, ClientError> {
        let handshake = tokio::time::timeout(
            self.options.handshake_timeout,
            self.connector.connect(url, certificate),
        );
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            r = handshake => match r {
                Ok(stream) => stream?,
                Err(_) => return Err(ClientError::Timeout),
            },
        };

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        let on_push: PushCallback = Box::new(move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_push(frame);
            }
        });
        let weak = Arc::downgrade(self);
        let on_closed: ClosedCallback = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_transport_closed(generation);
            }
        });

        Ok(Arc::new(Transport::start(
            stream,
            generation,
            self.options.keep_alive_interval,
            self.options.server_timeout,
            on_push,
            on_closed,
        )))
    }

    fn handle_push(&self, frame: Frame) {
        match frame.target {
            Method::ReceiveCommand => self.handle_command(&frame),
            Method::ReceivePing => {
                trace!("ping from control plane");
                self.emit(ClientEvent::PingReceived);
            }
            other => debug!(target_method = ?other, "ignoring unexpected push"),
        }
    }

    fn handle_command(&self, frame: &Frame) {
        let Some(raw) = frame.payload.as_deref() else {
            warn!(reason = "empty payload", "dropping inbound command");
            return;
        };
        // The command normally travels as a JSON string argument.
        let text: Cow<'_, str> = match serde_json::from_str::<String>(raw.get()) {
            Ok(s) => Cow::Owned(s),
            Err(_) => Cow::Borrowed(raw.get()),
        };

        match validate_command(&text, &self.identity, Utc::now()) {
            Ok(command) => {
                let command_type = sanitize_command_type(&command.command_type);
                self.metrics.command_received(command_type);
                info!(command_id = %command.command_id, command_type, "command received");
                self.emit(ClientEvent::CommandReceived(command));
            }
            Err(rejection) => warn!(reason = %rejection, "dropping inbound command"),
        }
    }

    /// Called when the transport with `generation` drops on its own.
    pub(crate) fn handle_transport_closed(self: &Arc<Self>, generation: u64) {
        if self.manual_disconnect.load(Ordering::SeqCst) {
            debug!(generation, "transport closed after disconnect");
            return;
        }
        let current = self.transport.read().as_ref().map(|t| t.generation());
        if current != Some(generation) || self.state() != ConnectionState::Connected {
            debug!(generation, "ignoring close of superseded transport");
            return;
        }

        let loop_id = self.next_loop_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        if let Some((_, previous)) = self.reconnect_cancel.lock().replace((loop_id, token.clone())) {
            previous.cancel();
        }

        if !self.transition(
            ConnectionState::Reconnecting,
            Some("connection lost".to_string()),
        ) {
            token.cancel();
            let mut slot = self.reconnect_cancel.lock();
            if slot.as_ref().is_some_and(|(id, _)| *id == loop_id) {
                *slot = None;
            }
            return;
        }

        warn!(generation, "control-plane connection lost, reconnecting");
        tokio::spawn(reconnect_loop(self.clone(), loop_id, token));
    }

    /// Closes and drops the transport and the held certificate.
    fn release_connection(&self) {
        if let Some(transport) = self.transport.write().take() {
            transport.close();
        }
        self.certificate.lock().take();
    }

    /// Everything an explicit connect does after entering `Connecting`.
    async fn establish(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Transport>, ClientError> {
        let url = self.endpoint_url()?;

        self.manual_disconnect.store(false, Ordering::SeqCst);
        cancel_reconnect(&self.reconnect_cancel);
        self.release_connection();

        let certificate = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            r = self.certificates.current_certificate() => r?,
        };
        if certificate.is_none() && self.identity.is_enrolled() {
            return Err(ClientError::MissingCertificate);
        }
        self.certificate.lock().clone_from(&certificate);

        info!(host = url.host_str().unwrap_or_default(), "connecting to control plane");
        self.open_transport(&url, certificate.as_ref(), cancel).await
    }

    /// The open transport, if the client is `Connected`.
    fn connected_transport(&self) -> Option<Arc<Transport>> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        self.transport.read().clone()
    }
}

/// Moves an abandoned connect out of `Connecting`.
struct ConnectAttempt<'a> {
    inner: &'a ClientInner,
    armed: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner
                .transition(ConnectionState::Failed, Some("connect abandoned".to_string()));
        }
    }
}

/// Agent-side client of the control plane.
///
/// Connectivity is observed only through [`ClientEvent::StateChanged`]
/// events on the receiver returned by [`take_events`](Self::take_events).
pub struct ControlPlaneClient {
    inner: Arc<ClientInner>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
}

impl ControlPlaneClient {
    /// Creates a client recording counters through the `metrics` facade.
    pub fn new(
        options: ControlPlaneOptions,
        identity: AgentIdentity,
        connector: Arc<dyn Connector>,
        certificates: Arc<dyn CertificateStore>,
    ) -> Self {
        Self::with_metrics(
            options,
            identity,
            connector,
            certificates,
            Arc::new(MetricsRecorder),
        )
    }

    pub fn with_metrics(
        options: ControlPlaneOptions,
        identity: AgentIdentity,
        connector: Arc<dyn Connector>,
        certificates: Arc<dyn CertificateStore>,
        metrics: Arc<dyn ClientMetrics>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = ClientInner {
            options,
            identity,
            connector,
            certificates,
            metrics,
            state: RwLock::new(ConnectionState::Disconnected),
            transport: RwLock::new(None),
            certificate: Mutex::new(None),
            events_tx,
            reconnect_cancel: parking_lot::Mutex::new(None),
            manual_disconnect: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            next_generation: AtomicU64::new(0),
            next_loop_id: AtomicU64::new(0),
        };
        Self {
            inner: Arc::new(inner),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Takes the event receiver. Can only be called once.
    ///
    /// The channel is unbounded: events are never dropped, so the caller
    /// must keep draining it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events_rx.lock().take()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.inner.identity
    }

    /// Connects to the control plane.
    ///
    /// A no-op while already connecting, connected or reconnecting. Any
    /// failure moves the client to `Failed` and is returned; configuration
    /// errors such as [`ClientError::InsecureEndpoint`] and
    /// [`ClientError::MissingCertificate`] are never retried.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let inner = &self.inner;
        let _lifecycle = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            guard = inner.lifecycle.lock() => guard,
        };

        let state = inner.state();
        if matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            debug!(%state, "connect ignored");
            return Ok(());
        }

        inner.transition(ConnectionState::Connecting, None);
        let mut attempt = ConnectAttempt {
            inner,
            armed: true,
        };
        let result = inner.establish(cancel).await;
        attempt.armed = false;

        match result {
            Ok(transport) => {
                let generation = transport.generation();
                *inner.transport.write() = Some(transport.clone());
                inner.transition(ConnectionState::Connected, None);
                info!(generation, "connected to control plane");
                if transport.is_closed() {
                    inner.handle_transport_closed(generation);
                }
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "control-plane connect failed");
                inner.transition(ConnectionState::Failed, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Disconnects and stops reconnecting. A no-op when already disconnected.
    pub async fn disconnect(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let inner = &self.inner;
        let _lifecycle = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            guard = inner.lifecycle.lock() => guard,
        };

        if inner.state() == ConnectionState::Disconnected {
            return Ok(());
        }

        inner.manual_disconnect.store(true, Ordering::SeqCst);
        cancel_reconnect(&inner.reconnect_cancel);
        inner.release_connection();
        inner.transition(ConnectionState::Disconnected, None);
        info!("disconnected from control plane");
        Ok(())
    }

    /// Sends a heartbeat and waits for the acknowledgement.
    ///
    /// Returns `Ok(())` without sending when not connected.
    pub async fn send_heartbeat(
        &self,
        heartbeat: &HeartbeatPayload,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let Some(transport) = self.inner.connected_transport() else {
            debug!("not connected, skipping heartbeat");
            return Ok(());
        };
        transport
            .invoke(
                Method::SendHeartbeat,
                heartbeat,
                self.inner.options.call_timeout,
                cancel,
            )
            .await?;
        self.inner.metrics.heartbeat_sent();
        trace!("heartbeat acknowledged");
        Ok(())
    }

    /// Reports a command result. Returns whether the control plane
    /// acknowledged it.
    pub async fn send_command_result(
        &self,
        result: &CommandResult,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(transport) = self.inner.connected_transport() else {
            debug!(command_id = %result.command_id, "not connected, skipping command result");
            return false;
        };
        match transport
            .invoke(
                Method::SendCommandResult,
                result,
                self.inner.options.call_timeout,
                cancel,
            )
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(command_id = %result.command_id, error = %e, "failed to send command result");
                false
            }
        }
    }

    /// Best-effort telemetry; failures are logged and never retried.
    pub async fn send_telemetry(&self, telemetry: &TelemetryPayload, cancel: &CancellationToken) {
        let Some(transport) = self.inner.connected_transport() else {
            return;
        };
        if let Err(e) = transport
            .send(
                Method::SendTelemetry,
                telemetry,
                self.inner.options.call_timeout,
                cancel,
            )
            .await
        {
            debug!(error = %e, "telemetry not sent");
        }
    }
}

impl Drop for ControlPlaneClient {
    fn drop(&mut self) {
        self.inner.manual_disconnect.store(true, Ordering::SeqCst);
        cancel_reconnect(&self.inner.reconnect_cancel);
        self.inner.release_connection();
    }
}

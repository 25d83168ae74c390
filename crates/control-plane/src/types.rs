//! Public types for the control-plane client.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetlink_protocol::constants::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_KEEP_ALIVE_INTERVAL,
    DEFAULT_SERVER_TIMEOUT,
};
use fleetlink_protocol::messages::CommandEnvelope;
use uuid::Uuid;

use crate::reconnection::ReconnectPolicy;

/// Health of the outbound control-plane connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection and none requested.
    Disconnected,
    /// Explicit connect in progress.
    Connecting,
    /// Handshake completed; sends are delivered.
    Connected,
    /// Transport dropped; the reconnect loop is running.
    Reconnecting,
    /// Unrecoverable error. Terminal until the next explicit connect.
    Failed,
}

impl ConnectionState {
    /// Returns `true` if the state machine allows moving from `self` to `next`.
    ///
    /// `Disconnected` can only reach `Connected` through `Connecting`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Reconnecting) => true,
            (Reconnecting, Connected) => true,
            (Failed, Connecting) => true,
            (Connected | Reconnecting | Failed, Disconnected) => true,
            (Failed, Failed) => false,
            (_, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A single accepted state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChanged {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Events emitted by the control-plane client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The connection state changed.
    StateChanged(ConnectionStateChanged),
    /// A command passed validation.
    CommandReceived(CommandEnvelope),
    /// The control plane pinged the agent.
    PingReceived,
}

/// Identity the agent was enrolled with.
///
/// A nil id is treated as "not enrolled"; it never matches a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentIdentity {
    pub node_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
}

impl AgentIdentity {
    /// Creates an identity, discarding nil ids.
    pub fn new(node_id: Option<Uuid>, organization_id: Option<Uuid>) -> Self {
        Self {
            node_id: node_id.filter(|id| !id.is_nil()),
            organization_id: organization_id.filter(|id| !id.is_nil()),
        }
    }

    /// Returns `true` if the agent has an enrolled node identity.
    pub fn is_enrolled(&self) -> bool {
        self.node_id.is_some()
    }
}

/// Configuration for [`ControlPlaneClient`](crate::ControlPlaneClient).
#[derive(Debug, Clone)]
pub struct ControlPlaneOptions {
    /// Base URL of the control plane (`wss://` or `https://`).
    pub endpoint: String,
    /// Time allowed for the connection handshake.
    pub handshake_timeout: Duration,
    /// Time allowed for each outbound call.
    pub call_timeout: Duration,
    /// Interval between keep-alive pings.
    pub keep_alive_interval: Duration,
    /// Server silence longer than this drops the connection.
    pub server_timeout: Duration,
    /// Backoff between reconnect attempts.
    pub reconnect: ReconnectPolicy,
    /// Give up and enter `Failed` after this many reconnect attempts.
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ControlPlaneOptions {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            max_reconnect_attempts: None,
        }
    }
}

//! Agent-side control-plane client.
//!
//! Keeps a single persistent WebSocket connection to the control plane,
//! drives the [`ConnectionState`] machine, reconnects with exponential
//! backoff, validates every inbound command before dispatching it, and
//! delivers heartbeats, command results and telemetry.

pub mod certificate;
pub mod client;
pub mod connector;
pub mod error;
pub mod metrics;
mod pumps;
pub mod reconnection;
pub(crate) mod transport;
pub mod types;
pub mod validation;

pub use certificate::{CertificateFuture, CertificateStore, ClientCertificate, PemCertificateStore};
pub use client::ControlPlaneClient;
pub use connector::{ConnectFuture, Connector, TlsConnector, WsStream};
pub use error::{CertificateError, ClientError};
pub use crate::metrics::{ClientMetrics, MetricsRecorder};
pub use reconnection::ReconnectPolicy;
pub use types::{
    AgentIdentity, ClientEvent, ConnectionState, ConnectionStateChanged, ControlPlaneOptions,
};
pub use validation::{CommandRejection, sanitize_command_type, validate_command};

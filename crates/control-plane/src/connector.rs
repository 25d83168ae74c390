//! Opening the WebSocket to the control plane.
//!
//! [`TlsConnector`] dials with rustls, presenting the agent's client
//! certificate when one is available. Tests swap in their own [`Connector`].

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use fleetlink_protocol::constants::WS_MAX_MESSAGE_SIZE;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::certificate::{ClientCertificate, parse_certificates};
use crate::error::{CertificateError, ClientError};

/// WebSocket stream produced by a [`Connector`].
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Future returned by [`Connector::connect`].
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<WsStream, ClientError>> + Send + 'a>>;

/// Opens WebSocket connections to the control plane.
pub trait Connector: Send + Sync {
    /// Connects to `url`, authenticating with `certificate` when present.
    fn connect<'a>(
        &'a self,
        url: &'a Url,
        certificate: Option<&'a ClientCertificate>,
    ) -> ConnectFuture<'a>;
}

/// WebSocket limits shared by every connection.
pub(crate) fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
    config
}

/// rustls-backed [`Connector`] trusting the webpki roots plus any extra CAs.
#[derive(Debug, Clone, Default)]
pub struct TlsConnector {
    extra_roots: Vec<CertificateDer<'static>>,
}

impl TlsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additionally trusts every certificate in the PEM bundle at `path`.
    pub fn with_ca_bundle(mut self, path: &Path) -> Result<Self, CertificateError> {
        let pem = std::fs::read(path)?;
        let certs = parse_certificates(&pem)?;
        if certs.is_empty() {
            return Err(CertificateError::EmptyChain);
        }
        self.extra_roots.extend(certs);
        Ok(self)
    }

    /// Builds the rustls client configuration for one connection.
    pub(crate) fn client_config(
        &self,
        certificate: Option<&ClientCertificate>,
    ) -> Result<ClientConfig, ClientError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for ca in &self.extra_roots {
            roots.add(ca.clone())?;
        }

        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots);

        let config = match certificate {
            Some(cert) => {
                builder.with_client_auth_cert(cert.chain().to_vec(), cert.key().clone_key())?
            }
            None => builder.with_no_client_auth(),
        };
        Ok(config)
    }
}

impl Connector for TlsConnector {
    fn connect<'a>(
        &'a self,
        url: &'a Url,
        certificate: Option<&'a ClientCertificate>,
    ) -> ConnectFuture<'a> {
        Box::pin(async move {
            let config = self.client_config(certificate)?;
            debug!(
                host = url.host_str().unwrap_or_default(),
                mtls = certificate.is_some(),
                "opening control-plane connection"
            );
            let (stream, _) = tokio_tungstenite::connect_async_tls_with_config(
                url.as_str(),
                Some(ws_config()),
                false,
                Some(tokio_tungstenite::Connector::Rustls(Arc::new(config))),
            )
            .await?;
            Ok(stream)
        })
    }
}

use tokio_tungstenite::tungstenite;

/// Errors from the control-plane client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid control-plane endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("control-plane endpoint must use an encrypted transport (wss or https)")]
    InsecureEndpoint,

    #[error("a client certificate is required for an enrolled node")]
    MissingCertificate,

    #[error("certificate error: {0}")]
    Certificate(#[from] CertificateError),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("connection closed")]
    Closed,

    #[error("control plane error {code}: {message}")]
    Remote { code: i32, message: String },
}

impl ClientError {
    /// Returns `false` for configuration and security errors that a retry
    /// cannot fix.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidEndpoint(_)
                | Self::InsecureEndpoint
                | Self::MissingCertificate
                | Self::Certificate(_)
                | Self::Tls(_)
                | Self::Cancelled
        )
    }
}

/// Errors from loading the client certificate.
#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse PEM: {0}")]
    Pem(String),

    #[error("no certificates found in chain file")]
    EmptyChain,
}

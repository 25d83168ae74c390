//! Client certificates for mutual TLS with the control plane.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::debug;

use crate::error::CertificateError;

/// A client certificate chain and its private key.
///
/// Cloning is cheap and shares the underlying key material.
#[derive(Clone)]
pub struct ClientCertificate {
    inner: Arc<CertificateParts>,
}

struct CertificateParts {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ClientCertificate {
    /// Creates a certificate from DER parts. The chain must not be empty.
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, CertificateError> {
        if chain.is_empty() {
            return Err(CertificateError::EmptyChain);
        }
        Ok(Self {
            inner: Arc::new(CertificateParts { chain, key }),
        })
    }

    /// Parses a PEM certificate chain and a PEM private key.
    pub fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self, CertificateError> {
        let chain = parse_certificates(chain_pem)?;
        let key = PrivateKeyDer::from_pem_slice(key_pem)
            .map_err(|e| CertificateError::Pem(format!("private key: {e}")))?;
        Self::new(chain, key)
    }

    /// The certificate chain, leaf first.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.inner.chain
    }

    pub(crate) fn key(&self) -> &PrivateKeyDer<'static> {
        &self.inner.key
    }
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("chain_len", &self.inner.chain.len())
            .finish_non_exhaustive()
    }
}

/// Parses every certificate in a PEM bundle.
pub(crate) fn parse_certificates(
    pem: &[u8],
) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::Pem(format!("certificates: {e}")))
}

/// Future returned by [`CertificateStore::current_certificate`].
pub type CertificateFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<ClientCertificate>, CertificateError>> + Send + 'a>>;

/// Source of the agent's current client certificate.
pub trait CertificateStore: Send + Sync {
    /// Returns the current certificate, or `None` if the agent has none.
    fn current_certificate(&self) -> CertificateFuture<'_>;
}

/// Reads the certificate chain and key from PEM files on every call, so a
/// certificate rotated on disk is picked up by the next explicit connect.
#[derive(Debug, Clone, Default)]
pub struct PemCertificateStore {
    chain_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
}

impl PemCertificateStore {
    /// Creates a store. Without both paths it never returns a certificate.
    pub fn new(chain_path: Option<PathBuf>, key_path: Option<PathBuf>) -> Self {
        Self {
            chain_path,
            key_path,
        }
    }
}

impl CertificateStore for PemCertificateStore {
    fn current_certificate(&self) -> CertificateFuture<'_> {
        Box::pin(async move {
            let (Some(chain_path), Some(key_path)) = (&self.chain_path, &self.key_path) else {
                debug!("no client certificate configured");
                return Ok(None);
            };
            let chain_pem = tokio::fs::read(chain_path).await?;
            let key_pem = tokio::fs::read(key_path).await?;
            let certificate = ClientCertificate::from_pem(&chain_pem, &key_pem)?;
            debug!(
                chain_len = certificate.chain().len(),
                "loaded client certificate"
            );
            Ok(Some(certificate))
        })
    }
}

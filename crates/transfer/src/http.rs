//! HTTP side of file transfers.
//!
//! [`TransferTransport`] is the seam the service streams through;
//! [`HttpTransferTransport`] is the reqwest implementation used in
//! production.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use fleetlink_protocol::messages::FileUploadResponse;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::header::CONTENT_LENGTH;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Path of the upload endpoint, relative to the base address.
pub const UPLOAD_PATH: &str = "files/upload";

/// Errors from the HTTP transport. Never forwarded to the control plane.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("cancelled")]
    Cancelled,
}

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// An opened download: declared length plus the body as a byte stream.
pub struct DownloadStream {
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

/// A streamed upload with an explicit content length.
pub struct UploadBody {
    pub url: Url,
    pub content_length: u64,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

/// Named HTTP client profile used for transfers.
pub trait TransferTransport: Send + Sync {
    /// Base address of the control plane's file API, if configured.
    fn base_url(&self) -> Option<&Url>;

    fn open_download<'a>(
        &'a self,
        url: &'a Url,
        cancel: &'a CancellationToken,
    ) -> TransportFuture<'a, DownloadStream>;

    /// Sends `body` and returns the remote file id.
    fn upload<'a>(&'a self, body: UploadBody, cancel: &'a CancellationToken) -> TransportFuture<'a, String>;
}

/// Builds `{base}/files/upload[?destinationId=..]`.
///
/// A base without a trailing slash is treated as a directory, so
/// `https://host/api` yields `https://host/api/files/upload`.
pub fn upload_url(base: &Url, destination_id: Option<&str>) -> Result<Url, url::ParseError> {
    let mut url = join_relative(base, UPLOAD_PATH)?;
    if let Some(id) = destination_id.filter(|id| !id.is_empty()) {
        url.query_pairs_mut().append_pair("destinationId", id);
    }
    Ok(url)
}

/// Resolves `path` against `base`, treating the base as a directory.
pub fn join_relative(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let dir = format!("{}/", base.path());
        base.set_path(&dir);
    }
    base.join(path)
}

/// reqwest-backed transport over rustls.
pub struct HttpTransferTransport {
    http: reqwest::Client,
    base_url: Option<Url>,
}

impl HttpTransferTransport {
    /// Creates a transport. Only https requests are ever sent.
    ///
    /// `read_timeout` bounds each read of a response, so a body that stalls
    /// after its headers errors out instead of hanging.
    pub fn new(
        base_url: Option<Url>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .https_only(true)
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(concat!("fleetlink-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, base_url })
    }
}

async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        result = fut => result,
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(TransportError::Status(status.as_u16()))
    }
}

impl TransferTransport for HttpTransferTransport {
    fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    fn open_download<'a>(
        &'a self,
        url: &'a Url,
        cancel: &'a CancellationToken,
    ) -> TransportFuture<'a, DownloadStream> {
        Box::pin(cancellable(cancel, async move {
            let response = check_status(self.http.get(url.clone()).send().await?)?;
            let content_length = response.content_length();
            debug!(?content_length, "download response received");
            let body = response.bytes_stream().map(|r| r.map_err(io::Error::other)).boxed();
            Ok::<_, TransportError>(DownloadStream { content_length, body })
        }))
    }

    fn upload<'a>(&'a self, body: UploadBody, cancel: &'a CancellationToken) -> TransportFuture<'a, String> {
        Box::pin(cancellable(cancel, async move {
            let request = self
                .http
                .post(body.url)
                .header(CONTENT_LENGTH, body.content_length)
                .body(reqwest::Body::wrap_stream(body.body));
            let response = check_status(request.send().await?)?;
            let uploaded: FileUploadResponse = response.json().await?;
            Ok::<_, TransportError>(uploaded.file_id)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_url_appends_path() {
        let base = Url::parse("https://cp.example.com").unwrap();
        assert_eq!(
            upload_url(&base, None).unwrap().as_str(),
            "https://cp.example.com/files/upload"
        );
    }

    #[test]
    fn upload_url_keeps_base_path() {
        let base = Url::parse("https://cp.example.com/api").unwrap();
        assert_eq!(
            upload_url(&base, None).unwrap().as_str(),
            "https://cp.example.com/api/files/upload"
        );
        let base = Url::parse("https://cp.example.com/api/").unwrap();
        assert_eq!(
            upload_url(&base, None).unwrap().as_str(),
            "https://cp.example.com/api/files/upload"
        );
    }

    #[test]
    fn upload_url_encodes_destination() {
        let base = Url::parse("https://cp.example.com").unwrap();
        let url = upload_url(&base, Some("reports/a b")).unwrap();
        assert_eq!(url.query(), Some("destinationId=reports%2Fa+b"));

        let url = upload_url(&base, Some("")).unwrap();
        assert_eq!(url.query(), None);
    }

    #[tokio::test]
    async fn cancellable_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = cancellable(&cancel, std::future::pending()).await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }

    #[test]
    fn transport_exposes_base_url() {
        let base = Url::parse("https://cp.example.com").unwrap();
        let transport =
            HttpTransferTransport::new(Some(base.clone()), Duration::from_secs(5), Duration::from_secs(30))
                .unwrap();
        assert_eq!(transport.base_url(), Some(&base));
    }
}

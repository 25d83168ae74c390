//! Tracked, confined uploads and downloads.
//!
//! Each transfer is admitted against a concurrency ceiling and a unique id,
//! runs under a child of the caller's cancellation token and is cleaned up by
//! guards on every exit path: the active-map entry and semaphore permit are
//! released, and a partially written download is deleted.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::TransferError;
use crate::http::{TransferTransport, TransportError, UploadBody, join_relative, upload_url};
use crate::integrity::{compute_hash, verify_hash};
use crate::metrics::{MetricsRecorder, TransferMetrics};
use crate::path_validator::validate_path;
use crate::progress::{FileTransferProgress, ProgressCallback, ProgressMeter};
use crate::types::{
    DownloadRequest, FileTransferOptions, FileTransferResult, TransferDirection, TransferHandle,
    TransferState, TransferStatus, UploadRequest,
};

/// Runs and tracks file transfers between the agent and the control plane.
pub struct FileTransferService {
    options: FileTransferOptions,
    transport: Arc<dyn TransferTransport>,
    metrics: Arc<dyn TransferMetrics>,
    active: DashMap<Uuid, Arc<TransferHandle>>,
    slots: Arc<Semaphore>,
}

impl FileTransferService {
    pub fn new(options: FileTransferOptions, transport: Arc<dyn TransferTransport>) -> Self {
        Self::with_metrics(options, transport, Arc::new(MetricsRecorder))
    }

    pub fn with_metrics(
        options: FileTransferOptions,
        transport: Arc<dyn TransferTransport>,
        metrics: Arc<dyn TransferMetrics>,
    ) -> Self {
        let permits = options.max_concurrent_transfers.min(Semaphore::MAX_PERMITS);
        Self {
            options,
            transport,
            metrics,
            active: DashMap::new(),
            slots: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Downloads `request.source_url` into the confined destination path.
    ///
    /// The destination must not exist. On any failure the partially written
    /// file is removed.
    pub async fn download(
        &self,
        request: DownloadRequest,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<FileTransferResult, TransferError> {
        let active = self.admit(request.transfer_id, TransferDirection::Download, cancel)?;
        let result = self.run_download(&request, progress, &active.handle).await;
        active.finish(&result);
        result
    }

    /// Uploads the confined source file to `{base}/files/upload`.
    pub async fn upload(
        &self,
        request: UploadRequest,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<FileTransferResult, TransferError> {
        let active = self.admit(request.transfer_id, TransferDirection::Upload, cancel)?;
        let result = self.run_upload(&request, progress, &active.handle).await;
        active.finish(&result);
        result
    }

    /// State of an active transfer. Finished transfers are no longer tracked.
    pub fn transfer_status(&self, transfer_id: Uuid) -> Option<TransferState> {
        self.active.get(&transfer_id).map(|h| h.snapshot())
    }

    pub fn active_transfers(&self) -> Vec<TransferState> {
        self.active.iter().map(|entry| entry.value().snapshot()).collect()
    }

    /// Signals cancellation. Returns `false` if no live transfer has this id,
    /// including one that finished concurrently.
    pub fn cancel_transfer(&self, transfer_id: Uuid) -> bool {
        let Some(handle) = self.active.get(&transfer_id).map(|h| Arc::clone(h.value())) else {
            return false;
        };
        if handle.snapshot().status.is_terminal() {
            return false;
        }
        handle.cancel_token().cancel();
        info!(%transfer_id, "transfer cancellation requested");
        true
    }

    /// Reserves a slot, then the id. The ceiling is checked first.
    fn admit(
        &self,
        transfer_id: Uuid,
        direction: TransferDirection,
        cancel: &CancellationToken,
    ) -> Result<ActiveTransfer<'_>, TransferError> {
        let permit = Arc::clone(&self.slots).try_acquire_owned().map_err(|_| {
            warn!(%transfer_id, "transfer rejected: concurrency limit reached");
            TransferError::LimitReached
        })?;

        let handle = match self.active.entry(transfer_id) {
            Entry::Occupied(_) => {
                warn!(%transfer_id, "transfer rejected: duplicate id");
                return Err(TransferError::Duplicate);
            }
            Entry::Vacant(slot) => {
                let handle = Arc::new(TransferHandle::new(
                    transfer_id,
                    direction,
                    cancel.child_token(),
                ));
                slot.insert(Arc::clone(&handle));
                handle
            }
        };

        debug!(%transfer_id, direction = direction.as_str(), "transfer admitted");
        Ok(ActiveTransfer {
            map: &self.active,
            transfer_id,
            handle,
            _permit: permit,
        })
    }

    async fn run_download(
        &self,
        request: &DownloadRequest,
        progress: Option<ProgressCallback>,
        handle: &Arc<TransferHandle>,
    ) -> Result<FileTransferResult, TransferError> {
        let started = Instant::now();
        let cancel = handle.cancel_token().clone();
        let max = self.options.max_file_size;

        if request.source_url.trim().is_empty() {
            return Err(TransferError::InvalidRequest("source url is empty"));
        }
        let destination =
            validate_path(&request.destination_path, &self.options.allowed_base_paths())?;
        if request.expected_size.is_some_and(|size| size > max) {
            return Err(TransferError::TooLarge);
        }
        let url = self.resolve_source(&request.source_url)?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(internal("create destination directory"))?;
        }

        handle.advance(TransferStatus::Connecting);
        let download = self
            .transport
            .open_download(&url, &cancel)
            .await
            .map_err(from_transport)?;
        if download.content_length.is_some_and(|len| len > max) {
            return Err(TransferError::TooLarge);
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&destination)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => {
                    TransferError::InvalidRequest("destination already exists")
                }
                _ => internal("open destination")(e),
            })?;
        let mut partial = PartialFile::new(destination.clone());

        handle.advance(TransferStatus::Transferring);
        let total = download.content_length.or(request.expected_size);
        let mut reporter = ProgressReporter::new(
            ProgressMeter::new(request.transfer_id, total),
            Arc::clone(handle),
            progress,
        );
        let chunk_size = self.options.chunk_size.max(1);
        let read_timeout = self.options.read_timeout;
        let mut writer = BufWriter::with_capacity(chunk_size, file);
        let mut body = download.body;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                next = tokio::time::timeout(read_timeout, body.next()) => next,
            };
            let Ok(next) = next else {
                warn!(
                    transfer_id = %request.transfer_id,
                    timeout_ms = read_timeout.as_millis() as u64,
                    "download body stalled"
                );
                return Err(TransferError::Failed);
            };
            let Some(received) = next else { break };
            let mut received = received.map_err(internal("read download body"))?;
            while !received.is_empty() {
                let chunk = received.split_to(chunk_size.min(received.len()));
                let len = chunk.len() as u64;
                if reporter.bytes().saturating_add(len) > max {
                    return Err(TransferError::TooLarge);
                }
                writer
                    .write_all(&chunk)
                    .await
                    .map_err(internal("write destination"))?;
                self.metrics
                    .bytes_transferred(TransferDirection::Download, len);
                reporter.report(len);
            }
        }
        writer.flush().await.map_err(internal("flush destination"))?;
        writer
            .into_inner()
            .sync_all()
            .await
            .map_err(internal("sync destination"))?;
        let size = reporter.bytes();

        handle.advance(TransferStatus::Verifying);
        let content_hash = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            hash = hash_download(&destination, request.expected_hash.as_deref()) => hash?,
        };

        partial.keep();
        self.metrics.transfer_completed(TransferDirection::Download);
        info!(
            transfer_id = %request.transfer_id,
            file = %file_name(&destination),
            size,
            duration_ms = started.elapsed().as_millis() as u64,
            "download completed"
        );

        Ok(FileTransferResult {
            transfer_id: request.transfer_id,
            local_path: destination,
            remote_id: None,
            content_hash,
            size,
            duration: started.elapsed(),
            peer_to_peer: false,
        })
    }

    async fn run_upload(
        &self,
        request: &UploadRequest,
        progress: Option<ProgressCallback>,
        handle: &Arc<TransferHandle>,
    ) -> Result<FileTransferResult, TransferError> {
        let started = Instant::now();
        let cancel = handle.cancel_token().clone();

        let source = validate_path(&request.source_path, &self.options.allowed_base_paths())?;
        let size = match fs::metadata(&source).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Err(TransferError::NotFound),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(TransferError::NotFound),
            Err(e) => return Err(internal("stat upload source")(e)),
        };
        if size > self.options.max_file_size {
            return Err(TransferError::TooLarge);
        }

        let base = self
            .transport
            .base_url()
            .filter(|base| base.scheme() == "https")
            .ok_or(TransferError::InsecureTransport)?;
        let url = upload_url(base, request.destination_id.as_deref())
            .map_err(|_| TransferError::InvalidRequest("destination id is invalid"))?;

        let content_hash = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            hash = compute_hash(&source) => hash.map_err(internal("hash upload source"))?,
        };

        handle.advance(TransferStatus::Connecting);
        let file = File::open(&source)
            .await
            .map_err(internal("open upload source"))?;

        let mut reporter = ProgressReporter::new(
            ProgressMeter::new(request.transfer_id, Some(size)),
            Arc::clone(handle),
            progress,
        );
        let metrics = Arc::clone(&self.metrics);
        // Bounded by the measured size so the body matches the declared length.
        let body = ReaderStream::with_capacity(file.take(size), self.options.chunk_size.max(1))
            .map(move |chunk| {
                if let Ok(bytes) = &chunk {
                    let len = bytes.len() as u64;
                    metrics.bytes_transferred(TransferDirection::Upload, len);
                    reporter.report(len);
                }
                chunk
            })
            .boxed();

        handle.advance(TransferStatus::Transferring);
        let remote_id = self
            .transport
            .upload(
                UploadBody {
                    url,
                    content_length: size,
                    body,
                },
                &cancel,
            )
            .await
            .map_err(from_transport)?;

        self.metrics.transfer_completed(TransferDirection::Upload);
        info!(
            transfer_id = %request.transfer_id,
            file = %file_name(&source),
            size,
            duration_ms = started.elapsed().as_millis() as u64,
            "upload completed"
        );

        Ok(FileTransferResult {
            transfer_id: request.transfer_id,
            local_path: source,
            remote_id: Some(remote_id),
            content_hash,
            size,
            duration: started.elapsed(),
            peer_to_peer: false,
        })
    }

    /// Resolves the source against the base address. Both must be https.
    fn resolve_source(&self, source: &str) -> Result<Url, TransferError> {
        let base = self.transport.base_url();
        if base.is_some_and(|base| base.scheme() != "https") {
            return Err(TransferError::InsecureTransport);
        }
        match Url::parse(source) {
            Ok(url) if url.scheme() == "https" => Ok(url),
            Ok(_) => Err(TransferError::InsecureTransport),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = base.ok_or(TransferError::InvalidRequest("source url must be absolute"))?;
                join_relative(base, source)
                    .map_err(|_| TransferError::InvalidRequest("source url is invalid"))
            }
            Err(_) => Err(TransferError::InvalidRequest("source url is invalid")),
        }
    }
}

async fn hash_download(path: &Path, expected: Option<&str>) -> Result<String, TransferError> {
    match expected {
        Some(expected) => verify_hash(path, expected).await,
        None => compute_hash(path).await.map_err(internal("hash download")),
    }
}

/// Logs an unexpected I/O failure and replaces it with a generic error.
fn internal(context: &'static str) -> impl FnOnce(io::Error) -> TransferError {
    move |e| {
        error!(error = %e, context, "transfer I/O failure");
        TransferError::Failed
    }
}

fn from_transport(e: TransportError) -> TransferError {
    match e {
        TransportError::Cancelled => TransferError::Cancelled,
        other => {
            error!(error = %other, "transfer transport failure");
            TransferError::Failed
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Holds a transfer's map entry and concurrency permit until dropped.
struct ActiveTransfer<'a> {
    map: &'a DashMap<Uuid, Arc<TransferHandle>>,
    transfer_id: Uuid,
    handle: Arc<TransferHandle>,
    _permit: OwnedSemaphorePermit,
}

impl ActiveTransfer<'_> {
    fn finish(&self, result: &Result<FileTransferResult, TransferError>) {
        match result {
            Ok(_) => {
                self.handle.advance(TransferStatus::Completed);
            }
            Err(e) => {
                warn!(transfer_id = %self.transfer_id, code = e.code(), "transfer ended with error");
                self.handle.fail(e);
            }
        }
    }
}

impl Drop for ActiveTransfer<'_> {
    fn drop(&mut self) {
        self.map
            .remove_if(&self.transfer_id, |_, h| Arc::ptr_eq(h, &self.handle));
    }
}

/// Deletes a file created by this transfer unless told to keep it.
struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(error = %e, file = %file_name(&self.path), "failed to remove partial file");
        }
    }
}

/// Feeds the meter, the tracked state and the caller's callback.
struct ProgressReporter {
    meter: ProgressMeter,
    handle: Arc<TransferHandle>,
    callback: Option<ProgressCallback>,
}

impl ProgressReporter {
    fn new(meter: ProgressMeter, handle: Arc<TransferHandle>, callback: Option<ProgressCallback>) -> Self {
        Self {
            meter,
            handle,
            callback,
        }
    }

    fn bytes(&self) -> u64 {
        self.meter.bytes()
    }

    fn report(&mut self, n: u64) {
        let snapshot: FileTransferProgress = self.meter.advance(n);
        self.handle.record_progress(snapshot.clone());
        if let Some(callback) = &self.callback {
            callback(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{DownloadStream, TransportFuture};
    use crate::integrity::hash_bytes;
    use bytes::Bytes;
    use futures_util::{TryStreamExt, stream};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct RecordedUpload {
        url: Url,
        content_length: u64,
        data: Vec<u8>,
    }

    #[derive(Default)]
    struct FakeTransport {
        base: Option<Url>,
        chunks: Vec<Bytes>,
        content_length: Option<u64>,
        /// Body never ends after the chunks.
        hang: bool,
        requested: parking_lot::Mutex<Vec<Url>>,
        uploads: parking_lot::Mutex<Vec<RecordedUpload>>,
    }

    impl FakeTransport {
        fn serving(chunks: &[&'static [u8]]) -> Self {
            Self {
                base: Some(Url::parse("https://cp.example.com/api/").unwrap()),
                chunks: chunks.iter().map(|c| Bytes::from_static(c)).collect(),
                ..Self::default()
            }
        }
    }

    impl TransferTransport for FakeTransport {
        fn base_url(&self) -> Option<&Url> {
            self.base.as_ref()
        }

        fn open_download<'a>(
            &'a self,
            url: &'a Url,
            _cancel: &'a CancellationToken,
        ) -> TransportFuture<'a, DownloadStream> {
            self.requested.lock().push(url.clone());
            let head = stream::iter(self.chunks.clone().into_iter().map(Ok::<_, io::Error>));
            let body = if self.hang {
                head.chain(stream::pending()).boxed()
            } else {
                head.boxed()
            };
            let content_length = self.content_length;
            Box::pin(async move { Ok::<_, TransportError>(DownloadStream { content_length, body }) })
        }

        fn upload<'a>(
            &'a self,
            body: UploadBody,
            _cancel: &'a CancellationToken,
        ) -> TransportFuture<'a, String> {
            Box::pin(async move {
                let chunks: Vec<Bytes> = body.body.try_collect().await.unwrap();
                self.uploads.lock().push(RecordedUpload {
                    url: body.url,
                    content_length: body.content_length,
                    data: chunks.concat(),
                });
                Ok::<_, TransportError>("file-42".to_string())
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        service: Arc<FileTransferService>,
        transport: Arc<FakeTransport>,
    }

    fn fixture(transport: FakeTransport, tweak: impl FnOnce(&mut FileTransferOptions)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let mut options = FileTransferOptions {
            temp_dir: root.clone(),
            ..FileTransferOptions::default()
        };
        tweak(&mut options);
        let transport = Arc::new(transport);
        let service = Arc::new(FileTransferService::new(options, transport.clone()));
        Fixture {
            _dir: dir,
            root,
            service,
            transport,
        }
    }

    fn download_request(root: &Path, name: &str) -> DownloadRequest {
        DownloadRequest {
            transfer_id: Uuid::new_v4(),
            source_url: "files/1".into(),
            destination_path: root.join(name).display().to_string(),
            expected_size: None,
            expected_hash: None,
        }
    }

    fn collect_progress() -> (ProgressCallback, mpsc::UnboundedReceiver<FileTransferProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: ProgressCallback = Arc::new(move |p: FileTransferProgress| {
            let _ = tx.send(p);
        });
        (callback, rx)
    }

    #[tokio::test]
    async fn download_writes_file_and_reports_progress() {
        let f = fixture(FakeTransport::serving(&[b"hello ", b"world"]), |_| {});
        let mut request = download_request(&f.root, "sub/out.bin");
        request.expected_hash = Some(hash_bytes(b"hello world").to_uppercase());
        let (callback, mut rx) = collect_progress();

        let result = f
            .service
            .download(request.clone(), Some(callback), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.size, 11);
        assert_eq!(result.content_hash, hash_bytes(b"hello world"));
        assert_eq!(result.local_path, f.root.join("sub").join("out.bin"));
        assert!(!result.peer_to_peer);
        assert_eq!(std::fs::read(&result.local_path).unwrap(), b"hello world");

        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push(p.bytes_transferred);
        }
        assert_eq!(seen, vec![6, 11]);
        assert!(f.service.active_transfers().is_empty());
        assert!(f.service.transfer_status(request.transfer_id).is_none());
    }

    #[tokio::test]
    async fn relative_source_resolves_against_base() {
        let f = fixture(FakeTransport::serving(&[b"x"]), |_| {});
        f.service
            .download(download_request(&f.root, "a.bin"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            f.transport.requested.lock()[0].as_str(),
            "https://cp.example.com/api/files/1"
        );
    }

    #[tokio::test]
    async fn insecure_sources_are_rejected() {
        let cancel = CancellationToken::new();

        let f = fixture(FakeTransport::serving(&[b"x"]), |_| {});
        let mut request = download_request(&f.root, "a.bin");
        request.source_url = "http://cp.example.com/files/1".into();
        assert_eq!(
            f.service.download(request, None, &cancel).await.unwrap_err(),
            TransferError::InsecureTransport
        );

        let mut transport = FakeTransport::serving(&[b"x"]);
        transport.base = Some(Url::parse("http://cp.example.com/").unwrap());
        let f = fixture(transport, |_| {});
        assert_eq!(
            f.service
                .download(download_request(&f.root, "a.bin"), None, &cancel)
                .await
                .unwrap_err(),
            TransferError::InsecureTransport
        );
        assert!(f.transport.requested.lock().is_empty());
    }

    #[tokio::test]
    async fn relative_source_without_base_is_invalid() {
        let mut transport = FakeTransport::serving(&[b"x"]);
        transport.base = None;
        let f = fixture(transport, |_| {});
        let err = f
            .service
            .download(download_request(&f.root, "a.bin"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Transfer.InvalidRequest");
    }

    #[tokio::test]
    async fn destination_must_be_confined() {
        let f = fixture(FakeTransport::serving(&[b"x"]), |_| {});
        let outside = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let mut request = download_request(&f.root, "a.bin");
        request.destination_path = outside.path().join("a.bin").display().to_string();
        assert_eq!(
            f.service.download(request, None, &cancel).await.unwrap_err(),
            TransferError::PathNotAllowed
        );

        let mut request = download_request(&f.root, "a.bin");
        request.destination_path = format!("{}/../a.bin", f.root.display());
        assert_eq!(
            f.service.download(request, None, &cancel).await.unwrap_err(),
            TransferError::UnsafePath
        );
    }

    #[tokio::test]
    async fn declared_length_over_limit_is_rejected() {
        let mut transport = FakeTransport::serving(&[b"0123456789"]);
        transport.content_length = Some(10);
        let f = fixture(transport, |o| o.max_file_size = 8);
        let request = download_request(&f.root, "big.bin");

        let err = f
            .service
            .download(request, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::TooLarge);
        assert!(!f.root.join("big.bin").exists());
    }

    #[tokio::test]
    async fn running_total_over_limit_deletes_partial_file() {
        let f = fixture(FakeTransport::serving(&[b"01234", b"56789"]), |o| {
            o.max_file_size = 8
        });
        let err = f
            .service
            .download(download_request(&f.root, "big.bin"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::TooLarge);
        assert!(!f.root.join("big.bin").exists());
        assert!(f.service.active_transfers().is_empty());
    }

    #[tokio::test]
    async fn hash_mismatch_deletes_file() {
        let f = fixture(FakeTransport::serving(&[b"hello"]), |_| {});
        let mut request = download_request(&f.root, "h.bin");
        request.expected_hash = Some(hash_bytes(b"goodbye"));

        let err = f
            .service
            .download(request, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::HashMismatch);
        assert!(!f.root.join("h.bin").exists());
    }

    #[tokio::test]
    async fn existing_destination_is_left_alone() {
        let f = fixture(FakeTransport::serving(&[b"new"]), |_| {});
        let path = f.root.join("keep.bin");
        std::fs::write(&path, b"original").unwrap();

        let err = f
            .service
            .download(download_request(&f.root, "keep.bin"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Transfer.InvalidRequest");
        assert_eq!(std::fs::read(&path).unwrap(), b"original");
    }

    async fn start_hanging_download(
        f: &Fixture,
        name: &str,
        transfer_id: Uuid,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<Result<FileTransferResult, TransferError>> {
        let mut request = download_request(&f.root, name);
        request.transfer_id = transfer_id;
        let (callback, mut rx) = collect_progress();
        let service = Arc::clone(&f.service);
        let task =
            tokio::spawn(async move { service.download(request, Some(callback), &cancel).await });
        rx.recv().await.unwrap();
        task
    }

    fn hanging() -> FakeTransport {
        FakeTransport {
            hang: true,
            ..FakeTransport::serving(&[b"partial"])
        }
    }

    #[tokio::test]
    async fn cancel_transfer_stops_download_and_cleans_up() {
        let f = fixture(hanging(), |_| {});
        let id = Uuid::new_v4();
        let task = start_hanging_download(&f, "c.bin", id, CancellationToken::new()).await;

        let state = f.service.transfer_status(id).unwrap();
        assert_eq!(state.status, TransferStatus::Transferring);
        assert_eq!(state.progress.unwrap().bytes_transferred, 7);

        assert!(f.service.cancel_transfer(id));
        assert_eq!(task.await.unwrap().unwrap_err(), TransferError::Cancelled);
        assert!(!f.root.join("c.bin").exists());
        assert!(f.service.active_transfers().is_empty());
        assert!(!f.service.cancel_transfer(id));
    }

    #[tokio::test]
    async fn caller_token_cancels_transfer() {
        let f = fixture(hanging(), |_| {});
        let cancel = CancellationToken::new();
        let task = start_hanging_download(&f, "c.bin", Uuid::new_v4(), cancel.clone()).await;

        cancel.cancel();
        assert_eq!(task.await.unwrap().unwrap_err(), TransferError::Cancelled);
        assert!(!f.root.join("c.bin").exists());
    }

    #[tokio::test]
    async fn limit_is_enforced_before_admission() {
        let f = fixture(hanging(), |o| o.max_concurrent_transfers = 1);
        let first = Uuid::new_v4();
        let task = start_hanging_download(&f, "one.bin", first, CancellationToken::new()).await;

        let err = f
            .service
            .download(download_request(&f.root, "two.bin"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::LimitReached);
        let active = f.service.active_transfers();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].transfer_id, first);

        f.service.cancel_transfer(first);
        task.await.unwrap().unwrap_err();
        assert_eq!(f.service.slots.available_permits(), 1);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let f = fixture(hanging(), |_| {});
        let id = Uuid::new_v4();
        let task = start_hanging_download(&f, "one.bin", id, CancellationToken::new()).await;

        let mut request = download_request(&f.root, "two.bin");
        request.transfer_id = id;
        let err = f
            .service
            .download(request, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::Duplicate);
        assert!(!f.root.join("two.bin").exists());
        assert_eq!(f.service.active_transfers().len(), 1);

        f.service.cancel_transfer(id);
        task.await.unwrap().unwrap_err();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_registrations_with_same_id_admit_one() {
        let f = fixture(hanging(), |_| {});
        let id = Uuid::new_v4();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let tasks: Vec<_> = ["one.bin", "two.bin"]
            .into_iter()
            .map(|name| {
                let mut request = download_request(&f.root, name);
                request.transfer_id = id;
                let service = Arc::clone(&f.service);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    service.download(request, None, &CancellationToken::new()).await
                })
            })
            .collect();

        // The loser returns at once; the winner hangs until cancelled.
        let (first, _, rest) = futures_util::future::select_all(tasks).await;
        assert_eq!(first.unwrap().unwrap_err(), TransferError::Duplicate);
        assert_eq!(f.service.active_transfers().len(), 1);

        assert!(f.service.cancel_transfer(id));
        for task in rest {
            assert_eq!(task.await.unwrap().unwrap_err(), TransferError::Cancelled);
        }
        assert!(f.service.active_transfers().is_empty());
    }

    #[tokio::test]
    async fn stalled_body_fails_and_releases_slot() {
        let f = fixture(hanging(), |o| {
            o.read_timeout = Duration::from_millis(100);
            o.max_concurrent_transfers = 1;
        });
        let request = download_request(&f.root, "stall.bin");

        let err = f
            .service
            .download(request, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::Failed);
        assert_eq!(err.code(), "Transfer.Failed");
        assert!(!f.root.join("stall.bin").exists());
        assert!(f.service.active_transfers().is_empty());
        assert_eq!(f.service.slots.available_permits(), 1);
    }

    #[tokio::test]
    async fn download_is_processed_in_configured_chunks() {
        let f = fixture(FakeTransport::serving(&[b"hello world"]), |o| o.chunk_size = 4);
        let (callback, mut rx) = collect_progress();

        let result = f
            .service
            .download(download_request(&f.root, "c.bin"), Some(callback), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&result.local_path).unwrap(), b"hello world");

        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push(p.bytes_transferred);
        }
        assert_eq!(seen, vec![4, 8, 11]);
    }

    #[tokio::test]
    async fn oversized_piece_is_rejected_at_chunk_boundary() {
        let f = fixture(FakeTransport::serving(&[b"0123456789"]), |o| {
            o.chunk_size = 4;
            o.max_file_size = 6;
        });
        let (callback, mut rx) = collect_progress();

        let err = f
            .service
            .download(download_request(&f.root, "big.bin"), Some(callback), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::TooLarge);
        assert_eq!(rx.try_recv().unwrap().bytes_transferred, 4);
        assert!(rx.try_recv().is_err());
        assert!(!f.root.join("big.bin").exists());
    }

    #[tokio::test]
    async fn cancel_unknown_transfer_returns_false() {
        let f = fixture(FakeTransport::default(), |_| {});
        assert!(!f.service.cancel_transfer(Uuid::new_v4()));
    }

    fn upload_request(path: &Path) -> UploadRequest {
        UploadRequest {
            transfer_id: Uuid::new_v4(),
            source_path: path.display().to_string(),
            destination_id: Some("reports".into()),
        }
    }

    #[tokio::test]
    async fn upload_streams_file_with_hash() {
        let f = fixture(FakeTransport::serving(&[]), |o| o.chunk_size = 4);
        let path = f.root.join("report.txt");
        std::fs::write(&path, b"hello world").unwrap();
        let (callback, mut rx) = collect_progress();

        let result = f
            .service
            .upload(upload_request(&path), Some(callback), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.remote_id.as_deref(), Some("file-42"));
        assert_eq!(result.content_hash, hash_bytes(b"hello world"));
        assert_eq!(result.size, 11);

        let uploads = f.transport.uploads.lock();
        assert_eq!(
            uploads[0].url.as_str(),
            "https://cp.example.com/api/files/upload?destinationId=reports"
        );
        assert_eq!(uploads[0].content_length, 11);
        assert_eq!(uploads[0].data, b"hello world");

        let mut last = None;
        while let Ok(p) = rx.try_recv() {
            assert!(p.bytes_transferred <= 11);
            last = Some(p);
        }
        let last = last.unwrap();
        assert_eq!(last.bytes_transferred, 11);
        assert_eq!(last.percent(), Some(100.0));
    }

    #[tokio::test]
    async fn upload_of_missing_file_is_not_found() {
        let f = fixture(FakeTransport::serving(&[]), |_| {});
        let err = f
            .service
            .upload(upload_request(&f.root.join("missing.txt")), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::NotFound);
    }

    #[tokio::test]
    async fn upload_requires_https_base() {
        let cancel = CancellationToken::new();
        for base in [None, Some(Url::parse("http://cp.example.com/").unwrap())] {
            let mut transport = FakeTransport::serving(&[]);
            transport.base = base;
            let f = fixture(transport, |_| {});
            let path = f.root.join("r.txt");
            std::fs::write(&path, b"data").unwrap();

            let err = f.service.upload(upload_request(&path), None, &cancel).await.unwrap_err();
            assert_eq!(err, TransferError::InsecureTransport);
            assert!(f.transport.uploads.lock().is_empty());
        }
    }

    #[tokio::test]
    async fn upload_over_limit_is_rejected() {
        let f = fixture(FakeTransport::serving(&[]), |o| o.max_file_size = 3);
        let path = f.root.join("r.txt");
        std::fs::write(&path, b"data").unwrap();

        let err = f
            .service
            .upload(upload_request(&path), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::TooLarge);
    }
}

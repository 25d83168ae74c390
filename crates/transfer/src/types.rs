use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetlink_protocol::messages::{DownloadFileCommand, UploadFileCommand};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TransferError;
use crate::progress::FileTransferProgress;

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default ceiling on a single file: 10 GiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Default number of transfers allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 4;

/// Longest wait for the next piece of a download body.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Which way the bytes flow, seen from the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransferDirection {
    Download,
    Upload,
}

impl TransferDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Upload => "upload",
        }
    }
}

/// Lifecycle of a transfer.
///
/// Pending → Connecting → Transferring → Verifying → Completed, with
/// Cancelled and Failed reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    Pending,
    Connecting,
    Transferring,
    Verifying,
    Completed,
    Cancelled,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Returns `true` if `next` may follow `self`. States are never revisited.
    pub fn can_advance_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Cancelled | Self::Failed => true,
            _ => next.rank() > self.rank(),
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Connecting => 1,
            Self::Transferring => 2,
            Self::Verifying => 3,
            Self::Completed | Self::Cancelled | Self::Failed => 4,
        }
    }
}

/// Point-in-time view of a tracked transfer.
#[derive(Debug, Clone)]
pub struct TransferState {
    pub transfer_id: Uuid,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub progress: Option<FileTransferProgress>,
    pub error: Option<TransferError>,
    pub started_at: DateTime<Utc>,
}

/// Live bookkeeping for one transfer, shared between the worker and the
/// status/cancel queries.
pub(crate) struct TransferHandle {
    state: RwLock<TransferState>,
    cancel: CancellationToken,
}

impl TransferHandle {
    pub(crate) fn new(
        transfer_id: Uuid,
        direction: TransferDirection,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state: RwLock::new(TransferState {
                transfer_id,
                direction,
                status: TransferStatus::Pending,
                progress: None,
                error: None,
                started_at: Utc::now(),
            }),
            cancel,
        }
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Moves to `next`; ignored if the lifecycle forbids it.
    pub(crate) fn advance(&self, next: TransferStatus) -> bool {
        let mut s = self.state.write();
        if s.status.can_advance_to(next) {
            s.status = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn record_progress(&self, progress: FileTransferProgress) {
        self.state.write().progress = Some(progress);
    }

    /// Records a terminal error. Cancellation maps to `Cancelled`, anything
    /// else to `Failed`.
    pub(crate) fn fail(&self, error: &TransferError) {
        let mut s = self.state.write();
        let next = if *error == TransferError::Cancelled {
            TransferStatus::Cancelled
        } else {
            TransferStatus::Failed
        };
        if s.status.can_advance_to(next) {
            s.status = next;
            s.error = Some(error.clone());
        }
    }

    pub(crate) fn snapshot(&self) -> TransferState {
        self.state.read().clone()
    }
}

/// Fetch a remote file into a confined local path.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub transfer_id: Uuid,
    /// Absolute https URL, or a path relative to the transport's base address.
    pub source_url: String,
    pub destination_path: String,
    pub expected_size: Option<u64>,
    /// Hex SHA-256; compared case-insensitively.
    pub expected_hash: Option<String>,
}

impl From<DownloadFileCommand> for DownloadRequest {
    fn from(cmd: DownloadFileCommand) -> Self {
        Self {
            transfer_id: cmd.transfer_id,
            source_url: cmd.source_url,
            destination_path: cmd.destination_path,
            expected_size: cmd.expected_size,
            expected_hash: cmd.expected_hash,
        }
    }
}

/// Push a confined local file to the control plane.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub transfer_id: Uuid,
    pub source_path: String,
    pub destination_id: Option<String>,
}

impl From<UploadFileCommand> for UploadRequest {
    fn from(cmd: UploadFileCommand) -> Self {
        Self {
            transfer_id: cmd.transfer_id,
            source_path: cmd.source_path,
            destination_id: cmd.destination_id,
        }
    }
}

/// Outcome of a completed transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferResult {
    pub transfer_id: Uuid,
    /// Destination for downloads, source for uploads.
    #[serde(skip)]
    pub local_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub content_hash: String,
    pub size: u64,
    #[serde(serialize_with = "serialize_millis", rename = "durationMs")]
    pub duration: Duration,
    /// Always `false`: transfers go through the control plane.
    pub peer_to_peer: bool,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Tuning for [`FileTransferService`](crate::FileTransferService).
#[derive(Debug, Clone, PartialEq)]
pub struct FileTransferOptions {
    pub chunk_size: usize,
    pub max_file_size: u64,
    pub max_concurrent_transfers: usize,
    /// A download whose body stalls longer than this fails.
    pub read_timeout: Duration,
    /// Always an allowed base.
    pub temp_dir: PathBuf,
    /// Additional allowed base, if configured.
    pub server_base_path: Option<PathBuf>,
}

impl Default for FileTransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            read_timeout: DEFAULT_READ_TIMEOUT,
            temp_dir: std::env::temp_dir(),
            server_base_path: None,
        }
    }
}

impl FileTransferOptions {
    pub(crate) fn allowed_base_paths(&self) -> Vec<PathBuf> {
        let mut bases = vec![self.temp_dir.clone()];
        bases.extend(self.server_base_path.clone());
        bases
    }
}

//! Confined, integrity-checked file transfers between the agent and the
//! control plane.
//!
//! Paths from the control plane are validated by [`validate_path`] before any
//! file-system access; content is hashed with SHA-256 by the
//! [`integrity`] helpers; [`FileTransferService`] runs tracked downloads and
//! uploads over a [`TransferTransport`].

mod error;
pub mod http;
pub mod integrity;
mod metrics;
mod path_validator;
mod progress;
mod service;
mod types;

pub use crate::metrics::{MetricsRecorder, TransferMetrics};
pub use error::TransferError;
pub use http::{HttpTransferTransport, TransferTransport, TransportError};
pub use integrity::{compute_hash, hash_bytes, verify_hash};
pub use path_validator::validate_path;
pub use progress::{FileTransferProgress, ProgressCallback};
pub use service::FileTransferService;
pub use types::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT_TRANSFERS, DEFAULT_MAX_FILE_SIZE,
    DEFAULT_READ_TIMEOUT, DownloadRequest,
    FileTransferOptions, FileTransferResult, TransferDirection, TransferState, TransferStatus,
    UploadRequest,
};

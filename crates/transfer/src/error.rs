/// Errors returned by transfer operations.
///
/// Messages are safe to send back to the control plane: they never carry
/// file-system paths or the text of underlying I/O or HTTP errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("path contains unsafe characters or traversal")]
    UnsafePath,

    #[error("path is outside the allowed directories")]
    PathNotAllowed,

    #[error("too many concurrent transfers")]
    LimitReached,

    #[error("a transfer with this id is already active")]
    Duplicate,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer failed")]
    Failed,

    #[error("transfer requires an encrypted (https) endpoint")]
    InsecureTransport,

    #[error("invalid transfer request: {0}")]
    InvalidRequest(&'static str),

    #[error("file exceeds the maximum transfer size")]
    TooLarge,

    #[error("file not found")]
    NotFound,

    #[error("content hash does not match")]
    HashMismatch,
}

impl TransferError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsafePath => "Path.Unsafe",
            Self::PathNotAllowed => "Path.NotAllowed",
            Self::LimitReached => "Transfer.LimitReached",
            Self::Duplicate => "Transfer.Duplicate",
            Self::Cancelled => "Transfer.Cancelled",
            Self::Failed => "Transfer.Failed",
            Self::InsecureTransport => "Transfer.InsecureTransport",
            Self::InvalidRequest(_) => "Transfer.InvalidRequest",
            Self::TooLarge => "File.TooLarge",
            Self::NotFound => "File.NotFound",
            Self::HashMismatch => "File.HashMismatch",
        }
    }
}

//! SHA-256 content hashing for transferred files.

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::error;

use crate::error::TransferError;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Computes SHA-256 of `data` and returns the lowercase hex digest.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Streams the file at `path` through SHA-256 and returns the lowercase hex
/// digest. Memory use is bounded by a fixed buffer.
pub async fn compute_hash(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hashes the file and compares against `expected`, ignoring case.
///
/// Returns the computed digest on a match and
/// [`TransferError::HashMismatch`] otherwise. I/O failures are logged and
/// reported as [`TransferError::NotFound`] or [`TransferError::Failed`].
pub async fn verify_hash(path: &Path, expected: &str) -> Result<String, TransferError> {
    let actual = compute_hash(path).await.map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            TransferError::NotFound
        } else {
            error!(error = %e, "failed to hash file");
            TransferError::Failed
        }
    })?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(actual)
    } else {
        Err(TransferError::HashMismatch)
    }
}

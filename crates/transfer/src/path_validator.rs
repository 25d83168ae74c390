//! Confinement of untrusted file-system paths.
//!
//! Every path received from the control plane is normalised, screened for
//! unsafe characters and traversal, resolved to an absolute path (following
//! symlinks in the parts that exist) and then required to sit inside one of
//! the allowed base directories.

use std::ffi::OsString;
use std::io;
use std::path::{MAIN_SEPARATOR, Path, PathBuf};

use crate::error::TransferError;

/// Characters never accepted in a transfer path. `:` is additionally
/// accepted as the drive-letter colon on Windows.
const UNSAFE_CHARS: &[char] = &['<', '>', '"', '|', '?', '*', ':'];

#[cfg(windows)]
const ALT_SEPARATOR: char = '/';
#[cfg(not(windows))]
const ALT_SEPARATOR: char = '\\';

/// Validates `path` and returns its confined absolute form.
///
/// Fails with [`TransferError::UnsafePath`] for unsafe characters, `..`
/// traversal, NUL bytes or control characters other than tab, and with
/// [`TransferError::PathNotAllowed`] when the resolved path is not equal to
/// or nested under one of `allowed_base_paths`.
pub fn validate_path(path: &str, allowed_base_paths: &[PathBuf]) -> Result<PathBuf, TransferError> {
    if path.trim().is_empty() {
        return Err(TransferError::InvalidRequest("path is empty"));
    }

    let normalized = normalize(path);
    check_safe(&normalized)?;

    let resolved = resolve(Path::new(&normalized)).map_err(|_| TransferError::PathNotAllowed)?;

    let allowed = allowed_base_paths
        .iter()
        .filter_map(|base| resolve(base).ok())
        .any(|base| is_within(&resolved, &base));

    if allowed {
        Ok(resolved)
    } else {
        Err(TransferError::PathNotAllowed)
    }
}

/// Converts alternate separators, collapses runs of separators and trims a
/// trailing separator unless the path is a root.
fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for (i, c) in path.chars().enumerate() {
        let c = if c == ALT_SEPARATOR { MAIN_SEPARATOR } else { c };
        // A leading double separator is a UNC prefix on Windows.
        let unc_prefix = cfg!(windows) && i == 1;
        if c == MAIN_SEPARATOR && out.ends_with(MAIN_SEPARATOR) && !unc_prefix {
            continue;
        }
        out.push(c);
    }
    while out.len() > 1 && out.ends_with(MAIN_SEPARATOR) && !is_root(&out) {
        out.pop();
    }
    out
}

fn is_root(path: &str) -> bool {
    if path.len() == 1 {
        return path.starts_with(MAIN_SEPARATOR);
    }
    cfg!(windows) && path.len() == 3 && has_drive_prefix(path) && path.ends_with(MAIN_SEPARATOR)
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn check_safe(path: &str) -> Result<(), TransferError> {
    if path.contains("..") {
        return Err(TransferError::UnsafePath);
    }
    for (i, c) in path.char_indices() {
        if c == '\t' {
            continue;
        }
        if c.is_control() {
            return Err(TransferError::UnsafePath);
        }
        if c == ':' && cfg!(windows) && i == 1 && has_drive_prefix(path) {
            continue;
        }
        if UNSAFE_CHARS.contains(&c) {
            return Err(TransferError::UnsafePath);
        }
    }
    Ok(())
}

/// Makes `path` absolute and canonicalises its longest existing ancestor,
/// re-appending the components that do not exist yet.
fn resolve(path: &Path) -> io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;

    let mut existing = absolute.as_path();
    let mut missing: Vec<OsString> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(mut resolved) => {
                for name in missing.iter().rev() {
                    resolved.push(name);
                }
                return Ok(resolved);
            }
            Err(_) => match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    missing.push(name.to_os_string());
                    existing = parent;
                }
                _ => return Ok(absolute),
            },
        }
    }
}

/// Equal to `base`, or nested under it. The base gets a trailing separator
/// so `/allowed/path` does not admit `/allowed/pathological`.
fn is_within(path: &Path, base: &Path) -> bool {
    let path = comparable(path);
    let mut base = comparable(base);
    if path == base {
        return true;
    }
    if !base.ends_with(MAIN_SEPARATOR) {
        base.push(MAIN_SEPARATOR);
    }
    path.starts_with(&base)
}

fn comparable(path: &Path) -> String {
    let s = path.to_string_lossy().into_owned();
    if cfg!(windows) { s.to_lowercase() } else { s }
}

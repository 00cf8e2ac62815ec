//! Error taxonomy (spec §7). Errors local to a page (decode, upload,
//! oversize bitmap) never propagate past the worker that raised them; they
//! are logged and surfaced as observable events instead. Only `open()`
//! returns a user-facing `Result`.

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned from [`crate::core::ReaderCore::open`].
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("path not found: {0}")]
    NotFound(PathBuf),
    #[error("unsupported file type: {0}")]
    Unsupported(PathBuf),
    #[error("failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no images found at {0}")]
    Empty(PathBuf),
}

/// Internal errors raised while reading archive members or decoding pages.
/// These never cross a worker boundary as a `Result` — each site converts
/// them into a logged message and an observable event.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("archive read failed for '{name}': {message}")]
    ArchiveReadFailed { name: String, message: String },
    #[error("decode failed for page {page}: {message}")]
    DecodeFailed { page: usize, message: String },
    #[error("decoded bitmap for page {page} ({bytes} bytes) exceeds L2 capacity")]
    OversizeBitmap { page: usize, bytes: u64 },
    #[error("texture upload failed for page {page}: {message}")]
    UploadFailed { page: usize, message: String },
}

//! Error types for filesystem storage.

use std::path::PathBuf;
use thiserror::Error;

/// Filesystem storage errors
#[derive(Debug, Error)]
pub enum FileIoError {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Path exists but is not a regular file
    #[error("not a regular file: {}", .0.display())]
    NotAFile(PathBuf),

    /// File changed size between hashing and opening
    #[error("file changed while being opened: {}", .0.display())]
    Changed(PathBuf),
}

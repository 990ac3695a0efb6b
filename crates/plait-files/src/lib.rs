//! # PLAIT Files
//!
//! Filesystem storage for PLAIT file transfers.
//!
//! This crate provides:
//! - [`FsWriter`]: a resumable download destination keeping its control
//!   block in a `<file>.plait-resume` sidecar
//! - [`FsReader`]: a positioned reader for shared files
//! - BLAKE3 content hashing of files on disk
//!
//! A download interrupted at any point leaves the partial file and its
//! sidecar behind; opening an [`FsWriter`] on the same path hands the saved
//! control block back to the engine, which resumes where it stopped.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hasher;
pub mod reader;
pub mod writer;

pub use error::FileIoError;
pub use hasher::{hash_bytes, hash_file};
pub use reader::FsReader;
pub use writer::FsWriter;

use plait_core::FileHash;
use std::path::Path;
use std::sync::Arc;

/// Suffix appended to a download path for its resume sidecar
pub const SIDECAR_SUFFIX: &str = ".plait-resume";

/// File metadata for sharing
#[derive(Debug, Clone)]
pub struct SharedFileInfo {
    /// BLAKE3 hash of the contents
    pub hash: FileHash,
    /// File size in bytes
    pub size: u64,
}

/// Hash a file and open a reader over it, ready for `Registry::share_file`
///
/// # Errors
///
/// Fails when the path is not a regular file or cannot be read.
pub fn open_shared<P: AsRef<Path>>(path: P) -> Result<(SharedFileInfo, Arc<FsReader>), FileIoError> {
    let path = path.as_ref();
    let (hash, size) = hash_file(path)?;
    let reader = FsReader::open(path)?;
    if reader.size() != size {
        return Err(FileIoError::Changed(path.to_path_buf()));
    }
    Ok((SharedFileInfo { hash, size }, Arc::new(reader)))
}

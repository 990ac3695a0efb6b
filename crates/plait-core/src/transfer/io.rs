//! Storage boundary for file transfers.
//!
//! Downloads write through a [`FileWriter`] owned by the transfer; uploads
//! read through a shared [`FileReader`] registered in the [`FileCatalog`].
//! In-memory implementations are provided for tests and small payloads.

use crate::ids::FileHash;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

/// Destination of a download
pub trait FileWriter: Send {
    /// Persist the opaque control block
    ///
    /// # Errors
    ///
    /// Any storage failure.
    fn set_control_data(&mut self, data: &[u8]) -> io::Result<()>;

    /// Return the last persisted control block, if any
    ///
    /// # Errors
    ///
    /// Any storage failure.
    fn get_control_data(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Write `data` at `offset`
    ///
    /// # Errors
    ///
    /// Any storage failure.
    fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Make the completed file durable and drop resume state
    ///
    /// # Errors
    ///
    /// Any storage failure.
    fn finalize_write(&mut self) -> io::Result<()>;

    /// Give up the destination without finalizing
    fn release(&mut self);
}

/// Source of an upload
pub trait FileReader: Send + Sync {
    /// Read exactly `len` bytes at `offset`
    ///
    /// # Errors
    ///
    /// Any storage failure, including a short read.
    fn read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;
}

/// Shared file registered for upload
#[derive(Clone)]
pub struct SharedFile {
    /// Total size in bytes
    pub size: u64,
    /// Data source
    pub reader: Arc<dyn FileReader>,
}

impl std::fmt::Debug for SharedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFile")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Registry-wide table of files peers may download
#[derive(Debug, Default)]
pub struct FileCatalog {
    files: RwLock<HashMap<FileHash, SharedFile>>,
}

impl FileCatalog {
    /// Empty catalog
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a file; replaces an earlier entry with the same hash
    pub fn share(&self, hash: FileHash, size: u64, reader: Arc<dyn FileReader>) {
        self.files.write().insert(hash, SharedFile { size, reader });
    }

    /// Stop offering a file
    pub fn unshare(&self, hash: &FileHash) -> bool {
        self.files.write().remove(hash).is_some()
    }

    /// Look up a shared file
    #[must_use]
    pub fn get(&self, hash: &FileHash) -> Option<SharedFile> {
        self.files.read().get(hash).cloned()
    }

    /// Number of shared files
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    /// Whether nothing is shared
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

/// Observable state of a [`MemoryWriter`]
#[derive(Debug, Default, Clone)]
pub struct MemoryFile {
    /// Written bytes
    pub data: Vec<u8>,
    /// Stored control block
    pub control: Option<Vec<u8>>,
    /// Whether `finalize_write` ran
    pub finalized: bool,
    /// Whether `release` ran
    pub released: bool,
    /// Number of `write` calls
    pub writes: usize,
}

/// In-memory [`FileWriter`]; clones share the same [`MemoryFile`]
#[derive(Debug, Default, Clone)]
pub struct MemoryWriter {
    inner: Arc<Mutex<MemoryFile>>,
    fail_writes: bool,
}

impl MemoryWriter {
    /// Empty destination
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Destination resuming from an earlier state
    #[must_use]
    pub fn from_file(file: MemoryFile) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryFile {
                finalized: false,
                released: false,
                ..file
            })),
            fail_writes: false,
        }
    }

    /// Writer whose data writes always fail
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    /// Snapshot of the current state
    #[must_use]
    pub fn snapshot(&self) -> MemoryFile {
        self.inner.lock().clone()
    }
}

impl FileWriter for MemoryWriter {
    fn set_control_data(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.lock().control = Some(data.to_vec());
        Ok(())
    }

    fn get_control_data(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().control.clone())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::Error::other("write refused"));
        }
        let mut file = self.inner.lock();
        let start = usize::try_from(offset).map_err(io::Error::other)?;
        let end = start + data.len();
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[start..end].copy_from_slice(data);
        file.writes += 1;
        Ok(())
    }

    fn finalize_write(&mut self) -> io::Result<()> {
        let mut file = self.inner.lock();
        file.finalized = true;
        file.control = None;
        Ok(())
    }

    fn release(&mut self) {
        self.inner.lock().released = true;
    }
}

/// In-memory [`FileReader`]
#[derive(Debug, Clone)]
pub struct MemoryReader {
    data: Arc<[u8]>,
}

impl MemoryReader {
    /// Reader over `data`
    #[must_use]
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }
}

impl FileReader for MemoryReader {
    fn read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let start = usize::try_from(offset).map_err(io::Error::other)?;
        self.data
            .get(start..start.saturating_add(len))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "read past end"))
    }
}

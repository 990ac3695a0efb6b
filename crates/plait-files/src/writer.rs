//! Resumable download destination.
//!
//! Data goes straight to its final path with positioned writes. The control
//! block lives next to it in `<file>.plait-resume` until `finalize_write`
//! syncs the data and removes the sidecar.

use crate::SIDECAR_SUFFIX;
use crate::error::FileIoError;
use plait_core::FileWriter;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Download destination on disk
#[derive(Debug)]
pub struct FsWriter {
    path: PathBuf,
    sidecar: PathBuf,
    file: Option<File>,
}

impl FsWriter {
    /// Open (or create) the destination without truncating it
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened for writing.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, FileIoError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let sidecar = sidecar_path(&path);
        debug!(path = %path.display(), resumable = sidecar.exists(), "download destination opened");
        Ok(Self {
            path,
            sidecar,
            file: Some(file),
        })
    }

    /// Destination path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resume sidecar path
    #[must_use]
    pub fn sidecar(&self) -> &Path {
        &self.sidecar
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("destination already released"))
    }
}

/// Sidecar path for a download destination
#[must_use]
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

impl FileWriter for FsWriter {
    fn set_control_data(&mut self, data: &[u8]) -> io::Result<()> {
        // atomic replace
        let tmp = self.sidecar.with_extension("plait-resume.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.sidecar)
    }

    fn get_control_data(&mut self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.sidecar) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }

    fn finalize_write(&mut self) -> io::Result<()> {
        self.file()?.sync_all()?;
        self.file = None;
        match fs::remove_file(&self.sidecar) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        debug!(path = %self.path.display(), "download finalized");
        Ok(())
    }

    fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_data() {
                warn!(path = %self.path.display(), error = %e, "sync on release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positioned_writes_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut w = FsWriter::create(&path).unwrap();
        w.write(4, b"4567").unwrap();
        w.write(0, b"0123").unwrap();
        w.finalize_write().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"01234567");
    }

    #[test]
    fn test_control_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");

        let mut w = FsWriter::create(&path).unwrap();
        assert_eq!(w.get_control_data().unwrap(), None);
        w.write(0, &[1; 100]).unwrap();
        w.set_control_data(&[9; 12]).unwrap();
        w.release();
        assert!(w.write(0, b"x").is_err());

        let mut again = FsWriter::create(&path).unwrap();
        assert_eq!(again.get_control_data().unwrap(), Some(vec![9; 12]));
        assert_eq!(fs::read(&path).unwrap(), vec![1; 100]);
    }

    #[test]
    fn test_finalize_removes_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.bin");
        let mut w = FsWriter::create(&path).unwrap();
        w.set_control_data(&[1; 12]).unwrap();
        assert!(w.sidecar().exists());
        w.finalize_write().unwrap();
        assert!(!sidecar_path(&path).exists());
    }
}

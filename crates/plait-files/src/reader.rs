//! Positioned reader over a shared file.

use crate::error::FileIoError;
use parking_lot::Mutex;
use plait_core::FileReader;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Shared file opened for upload
#[derive(Debug)]
pub struct FsReader {
    path: PathBuf,
    size: u64,
    file: Mutex<File>,
}

impl FsReader {
    /// Open `path` for reading
    ///
    /// # Errors
    ///
    /// Fails when the path cannot be opened or is not a regular file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FileIoError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(FileIoError::NotAFile(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
            size: meta.len(),
            file: Mutex::new(file),
        })
    }

    /// Size at open time
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path of the file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileReader for FsReader {
    fn read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        if offset.saturating_add(len as u64) > self.size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of shared file",
            ));
        }
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_positioned_reads() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"0123456789").unwrap();
        temp.flush().unwrap();

        let reader = FsReader::open(temp.path()).unwrap();
        assert_eq!(reader.size(), 10);
        assert_eq!(reader.read(3, 4).unwrap(), b"3456");
        assert_eq!(reader.read(0, 2).unwrap(), b"01");
        assert!(reader.read(8, 4).is_err());
    }
}

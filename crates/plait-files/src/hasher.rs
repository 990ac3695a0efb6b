//! BLAKE3 content hashing.

use crate::error::FileIoError;
use plait_core::FileHash;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read buffer for streaming hashes
const HASH_BUFFER: usize = 256 * 1024;

/// Files at least this large are hashed on all cores
#[cfg(feature = "rayon")]
const PARALLEL_THRESHOLD: usize = 1024 * 1024;

/// Hash an in-memory buffer
#[must_use]
pub fn hash_bytes(data: &[u8]) -> FileHash {
    *blake3::hash(data).as_bytes()
}

/// Hash a file, returning its hash and size
///
/// # Errors
///
/// Fails when the path is not a regular file or a read fails.
pub fn hash_file<P: AsRef<Path>>(path: P) -> Result<(FileHash, u64), FileIoError> {
    let path = path.as_ref();
    let mut file = File::open(path)?;
    if !file.metadata()?.is_file() {
        return Err(FileIoError::NotAFile(path.to_path_buf()));
    }

    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; HASH_BUFFER];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        update(&mut hasher, &buffer[..n]);
        size += n as u64;
    }
    tracing::debug!(path = %path.display(), size, "hashed file");
    Ok((*hasher.finalize().as_bytes(), size))
}

#[cfg(feature = "rayon")]
fn update(hasher: &mut blake3::Hasher, data: &[u8]) {
    if data.len() >= PARALLEL_THRESHOLD {
        hasher.update_rayon(data);
    } else {
        hasher.update(data);
    }
}

#[cfg(not(feature = "rayon"))]
fn update(hasher: &mut blake3::Hasher, data: &[u8]) {
    hasher.update(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_hash_file_matches_hash_bytes() {
        let mut temp = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..700_000u32).map(|i| (i % 253) as u8).collect();
        temp.write_all(&data).unwrap();
        temp.flush().unwrap();

        let (hash, size) = hash_file(temp.path()).unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(hash, hash_bytes(&data));
    }

    #[test]
    fn test_hash_empty_file() {
        let temp = NamedTempFile::new().unwrap();
        let (hash, size) = hash_file(temp.path()).unwrap();
        assert_eq!(size, 0);
        assert_eq!(hash, hash_bytes(&[]));
    }

    #[test]
    fn test_hash_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(hash_file(dir.path()).is_err());
    }
}

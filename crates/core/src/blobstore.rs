//! Content-addressable blob store.
//!
//! Blobs are keyed by the lowercase SHA-256 hex digest of their bytes. The
//! filesystem implementation fans keys out into two-character directories
//! (`blobs/ab/cdef…`) and writes through a temporary file plus rename, so a
//! reader never observes a partial blob.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::BlobError;

/// Hash `bytes` the way blob keys are computed.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash a file's content without reading it into memory at once.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn check_hid(hid: &str) -> Result<(), BlobError> {
    if hid.len() == 64 && hid.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        Ok(())
    } else {
        Err(BlobError::MalformedHash(hid.to_string()))
    }
}

/// Storage for file and symlink content.
pub trait BlobStore: Send + Sync {
    /// Store `bytes` and return their key. Storing the same bytes twice is a
    /// no-op.
    fn store(&self, bytes: &[u8]) -> Result<String, BlobError>;

    /// Fetch and verify the bytes stored under `hid`.
    fn fetch(&self, hid: &str) -> Result<Vec<u8>, BlobError>;

    fn contains(&self, hid: &str) -> bool;

    /// Store the content of a file on disk.
    fn store_file(&self, path: &Path) -> Result<String, BlobError> {
        let bytes = fs::read(path)?;
        self.store(&bytes)
    }

    /// Write the blob's bytes to `dest`, replacing any existing file.
    fn fetch_to_file(&self, hid: &str, dest: &Path) -> Result<(), BlobError> {
        let bytes = self.fetch(hid)?;
        fs::write(dest, bytes)?;
        Ok(())
    }
}

/// [`BlobStore`] backed by a directory tree.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<Self, BlobError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, hid: &str) -> PathBuf {
        self.root.join(&hid[..2]).join(&hid[2..])
    }
}

impl BlobStore for FsBlobStore {
    fn store(&self, bytes: &[u8]) -> Result<String, BlobError> {
        let hid = hash_bytes(bytes);
        let path = self.blob_path(&hid);
        if path.exists() {
            return Ok(hid);
        }
        let dir = self.root.join(&hid[..2]);
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(hid = %hid, size = bytes.len(), "stored blob");
        Ok(hid)
    }

    fn fetch(&self, hid: &str) -> Result<Vec<u8>, BlobError> {
        check_hid(hid)?;
        let path = self.blob_path(hid);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobError::NotFound(hid.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let actual = hash_bytes(&bytes);
        if actual != hid {
            return Err(BlobError::HashMismatch {
                expected: hid.to_string(),
                actual,
            });
        }
        Ok(bytes)
    }

    fn contains(&self, hid: &str) -> bool {
        check_hid(hid).is_ok() && self.blob_path(hid).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("blobs")).unwrap();

        let hid = store.store(b"hello\n").unwrap();
        assert_eq!(hid, hash_bytes(b"hello\n"));
        assert!(store.contains(&hid));
        assert_eq!(store.fetch(&hid).unwrap(), b"hello\n");
        // Idempotent.
        assert_eq!(store.store(b"hello\n").unwrap(), hid);
    }

    #[test]
    fn test_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        let absent = hash_bytes(b"never stored");
        assert!(matches!(store.fetch(&absent), Err(BlobError::NotFound(_))));
        assert!(matches!(store.fetch("xyz"), Err(BlobError::MalformedHash(_))));
        assert!(!store.contains("xyz"));
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        let hid = store.store(b"original").unwrap();
        fs::write(store.blob_path(&hid), b"tampered").unwrap();
        assert!(matches!(store.fetch(&hid), Err(BlobError::HashMismatch { .. })));
    }

    #[test]
    fn test_hash_file_matches_hash_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, b"some content").unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"some content"));

        let store = FsBlobStore::new(dir.path().join("blobs")).unwrap();
        let hid = store.store_file(&path).unwrap();
        let out = dir.path().join("out.txt");
        store.fetch_to_file(&hid, &out).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"some content");
    }
}

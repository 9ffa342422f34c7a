//! Primary blob storage capability interface
//!
//! [`BlobStorage`] is the full surface of a primary backend. The tiered
//! store implements the same trait, so it can stand in wherever a primary
//! backend is expected.

mod filesystem;

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::cache::{CacheDirError, LockError};
use crate::key::BlobKey;
use crate::remote::RemoteError;

pub use filesystem::FileBlobStorage;

/// Storage result type
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors from blob storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// The blob does not exist (locally, or anywhere for the tiered store)
    #[error("no blob file for {0}")]
    NotFound(BlobKey),

    #[error("storage is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("remote fetch failed: {0}")]
    Remote(#[source] RemoteError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("cache directory error: {0}")]
    Cache(#[from] CacheDirError),
}

impl StorageError {
    /// Whether this error means the blob does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Blob storage backend.
pub trait BlobStorage: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Number of committed blobs.
    fn blob_count(&self) -> StorageResult<usize>;

    /// Local path of a committed blob's content.
    fn load_blob(&self, key: &BlobKey) -> StorageResult<PathBuf>;

    /// Open a committed blob for reading.
    ///
    /// When `handle` is given the returned file is registered as one of its
    /// open readers until dropped.
    fn open_committed_blob_file(
        &self,
        key: &BlobKey,
        handle: Option<&BlobHandle>,
    ) -> StorageResult<CommittedBlob>;

    /// Size in bytes of a committed blob.
    fn blob_size(&self, key: &BlobKey) -> StorageResult<u64>;

    /// Keys of all committed blobs.
    fn iter_blobs(&self) -> StorageResult<Vec<BlobKey>>;

    /// Commit a blob revision from `data`, returning its path.
    fn store_blob(&self, key: &BlobKey, data: &mut dyn Read) -> StorageResult<PathBuf>;

    /// Release the backend. Later calls fail with [`StorageError::Closed`].
    fn close(&self) -> StorageResult<()>;
}

/// Tracks the open readers of one blob.
///
/// Cloning shares the same registry.
#[derive(Debug, Clone, Default)]
pub struct BlobHandle {
    readers: Arc<AtomicUsize>,
}

impl BlobHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed files currently open through this handle.
    pub fn open_readers(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }
}

/// Read-only file of a committed blob.
#[derive(Debug)]
pub struct CommittedBlob {
    key: BlobKey,
    path: PathBuf,
    file: File,
    handle: Option<BlobHandle>,
}

impl CommittedBlob {
    /// Open `path` for reading, registering with `handle` if given.
    pub fn open(key: BlobKey, path: PathBuf, handle: Option<&BlobHandle>) -> io::Result<Self> {
        let file = File::open(&path)?;
        let handle = handle.cloned();
        if let Some(h) = &handle {
            h.readers.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Self {
            key,
            path,
            file,
            handle,
        })
    }

    pub fn key(&self) -> &BlobKey {
        &self.key
    }

    /// Path the file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the remaining content into a vector.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl Read for CommittedBlob {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Drop for CommittedBlob {
    fn drop(&mut self) {
        if let Some(h) = &self.handle {
            h.readers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_committed_blob_reads_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("blob");
        fs::write(&path, b"hello").unwrap();

        let mut blob = CommittedBlob::open(BlobKey::new(1, 1), path.clone(), None).unwrap();
        assert_eq!(blob.path(), path);
        assert_eq!(blob.key(), &BlobKey::new(1, 1));
        assert_eq!(blob.read_all().unwrap(), b"hello");
    }

    #[test]
    fn test_handle_counts_open_readers() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("blob");
        fs::write(&path, b"x").unwrap();
        let handle = BlobHandle::new();

        let first = CommittedBlob::open(BlobKey::new(1, 1), path.clone(), Some(&handle)).unwrap();
        let second = CommittedBlob::open(BlobKey::new(1, 1), path.clone(), Some(&handle)).unwrap();
        assert_eq!(handle.open_readers(), 2);

        drop(first);
        assert_eq!(handle.open_readers(), 1);
        drop(second);
        assert_eq!(handle.open_readers(), 0);
    }

    #[test]
    fn test_failed_open_does_not_register() {
        let temp_dir = TempDir::new().unwrap();
        let handle = BlobHandle::new();

        let result = CommittedBlob::open(
            BlobKey::new(1, 1),
            temp_dir.path().join("missing"),
            Some(&handle),
        );
        assert!(result.is_err());
        assert_eq!(handle.open_readers(), 0);
    }
}

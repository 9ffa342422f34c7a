//! Read-through tiered blob store.
//!
//! Wraps a primary [`BlobStorage`]: reads try the primary first, then the
//! local cache, then the remote object store. Every other operation is
//! forwarded to the primary unchanged.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Instant;

use tracing::debug;

use crate::cache::{CacheDirectory, DownloadCoordinator};
use crate::key::BlobKey;
use crate::remote::RemoteObjectStore;
use crate::storage::{
    BlobHandle, BlobStorage, CommittedBlob, StorageError, StorageResult,
};

/// Primary backend with a remote-backed read-through cache behind it.
pub struct TieredBlobStore<S: BlobStorage> {
    storage: S,
    downloads: DownloadCoordinator,
}

impl<S: BlobStorage> TieredBlobStore<S> {
    /// Compose a primary backend, a cache directory and a remote store.
    ///
    /// `cache_size` bounds the cache directory; `None` disables eviction.
    pub fn new(
        storage: S,
        cache: CacheDirectory,
        remote: impl RemoteObjectStore + 'static,
        cache_size: Option<u64>,
    ) -> Self {
        Self {
            storage,
            downloads: DownloadCoordinator::new(cache, remote, cache_size),
        }
    }

    /// The wrapped primary backend.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn downloads(&self) -> &DownloadCoordinator {
        &self.downloads
    }

    /// Whether the primary backend holds the blob. Never consults the cache
    /// or the remote store.
    pub fn is_blob_local(&self, key: &BlobKey) -> StorageResult<bool> {
        match self.storage.load_blob(key) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Load a blob from the cache or the remote store, skipping the primary.
    pub fn load_remote_blob(&self, key: &BlobKey) -> StorageResult<PathBuf> {
        self.downloads.load_remote_blob(key)
    }

    /// Second attempt of [`BlobStorage::open_committed_blob_file`], made
    /// while holding the entry lock so eviction cannot remove the file
    /// between load and open.
    fn reopen_locked(
        &self,
        key: &BlobKey,
        handle: Option<&BlobHandle>,
    ) -> StorageResult<CommittedBlob> {
        let lock = self.downloads.lock_entry(key)?;

        let path = match self.storage.load_blob(key) {
            Ok(path) => path,
            Err(StorageError::NotFound(_)) => {
                self.downloads.load_remote_blob_locked(key, &lock)?
            }
            Err(e) => return Err(e),
        };

        CommittedBlob::open(*key, path, handle).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(*key),
            _ => StorageError::Io(e),
        })
    }
}

impl<S: BlobStorage> BlobStorage for TieredBlobStore<S> {
    fn name(&self) -> &str {
        self.storage.name()
    }

    fn blob_count(&self) -> StorageResult<usize> {
        self.storage.blob_count()
    }

    /// Load a blob: primary first, then the cache / remote store.
    fn load_blob(&self, key: &BlobKey) -> StorageResult<PathBuf> {
        let start = Instant::now();
        match self.storage.load_blob(key) {
            Ok(path) => {
                debug!(
                    key = %key,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "fetched blob from primary storage"
                );
                Ok(path)
            }
            Err(StorageError::NotFound(_)) => {
                let path = self.downloads.load_remote_blob(key)?;
                debug!(
                    key = %key,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "fetched blob from remote tier"
                );
                Ok(path)
            }
            Err(e) => Err(e),
        }
    }

    fn open_committed_blob_file(
        &self,
        key: &BlobKey,
        handle: Option<&BlobHandle>,
    ) -> StorageResult<CommittedBlob> {
        let path = self.load_blob(key)?;
        match CommittedBlob::open(*key, path, handle) {
            Ok(blob) => Ok(blob),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Removed between load and open (eviction or another process)
                debug!(key = %key, "blob file vanished before open, retrying under lock");
                self.reopen_locked(key, handle)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn blob_size(&self, key: &BlobKey) -> StorageResult<u64> {
        self.storage.blob_size(key)
    }

    fn iter_blobs(&self) -> StorageResult<Vec<BlobKey>> {
        self.storage.iter_blobs()
    }

    fn store_blob(&self, key: &BlobKey, data: &mut dyn io::Read) -> StorageResult<PathBuf> {
        self.storage.store_blob(key, data)
    }

    /// Close the primary backend, then wait for any running eviction.
    fn close(&self) -> StorageResult<()> {
        let result = self.storage.close();
        self.downloads.shutdown();
        result
    }
}

impl<S: BlobStorage> fmt::Debug for TieredBlobStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<TieredBlobStore proxy for {} at {}>",
            self.storage.name(),
            self.downloads.layout().root().display()
        )
    }
}

//! Remote download coordination
//!
//! Protocol for a cache miss on the primary backend:
//! 1. Compute the cache path; if present, return it (no lock)
//! 2. Create the bucket directory and take the entry's path lock (blocking)
//! 3. Re-check under the lock: another thread or process may have
//!    downloaded it while we waited
//! 4. Fetch into `<entry>.<pid>.tmp`, mark read-only, rename into place,
//!    account the bytes
//! 5. Re-check; still absent means the remote object was missing
//!
//! The lock is released on every exit path when the guard drops.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::budget::SizeBudgetTracker;
use super::evict::{EvictionScheduler, EvictionWorker};
use super::layout::{mark_accessed, CacheDirectory};
use super::lock::PathLock;
use crate::key::{remote_object_key, BlobKey};
use crate::remote::{RemoteError, RemoteObjectStore};
use crate::storage::{StorageError, StorageResult};

/// Fetches remote blobs into the cache directory at most once.
pub struct DownloadCoordinator {
    layout: CacheDirectory,
    remote: Box<dyn RemoteObjectStore>,
    budget: SizeBudgetTracker,
    evictions: EvictionScheduler,
}

impl DownloadCoordinator {
    /// Create a coordinator.
    ///
    /// With a size limit, one eviction run is started right away to trim a
    /// cache left oversized by earlier processes.
    pub fn new(
        layout: CacheDirectory,
        remote: impl RemoteObjectStore + 'static,
        cache_size: Option<u64>,
    ) -> Self {
        let budget = SizeBudgetTracker::new(cache_size);
        let evictions =
            EvictionScheduler::new(layout.root(), budget.target().unwrap_or(u64::MAX));
        if budget.limit().is_some() {
            evictions.trigger();
        }

        Self {
            layout,
            remote: Box::new(remote),
            budget,
            evictions,
        }
    }

    pub fn layout(&self) -> &CacheDirectory {
        &self.layout
    }

    pub fn budget(&self) -> &SizeBudgetTracker {
        &self.budget
    }

    pub fn evictions(&self) -> &EvictionScheduler {
        &self.evictions
    }

    /// Cache path for `key`. Does not touch the filesystem.
    pub fn cache_path(&self, key: &BlobKey) -> PathBuf {
        self.layout.blob_path(key)
    }

    /// Load a blob through the cache, downloading it on a miss.
    pub fn load_remote_blob(&self, key: &BlobKey) -> StorageResult<PathBuf> {
        let path = self.cache_path(key);
        if path.exists() {
            return Ok(accessed(path));
        }

        let lock = self.lock_entry(key)?;
        self.load_remote_blob_locked(key, &lock)
    }

    /// Take the path lock of `key`'s cache entry, creating its directory.
    pub fn lock_entry(&self, key: &BlobKey) -> StorageResult<PathLock> {
        let path = self.layout.create_path_for(key)?;
        Ok(PathLock::acquire(&path)?)
    }

    /// Steps 3-5 of the protocol, for a caller already holding `key`'s lock.
    pub fn load_remote_blob_locked(
        &self,
        key: &BlobKey,
        _lock: &PathLock,
    ) -> StorageResult<PathBuf> {
        let path = self.cache_path(key);

        // Someone else downloaded it while we waited for the lock
        if path.exists() {
            return Ok(accessed(path));
        }

        self.download(key, &path)?;

        if path.exists() {
            return Ok(accessed(path));
        }
        Err(StorageError::NotFound(*key))
    }

    /// Fetch `key` into `path`. A missing remote object is not an error here.
    fn download(&self, key: &BlobKey, path: &Path) -> StorageResult<()> {
        let remote_key = remote_object_key(key);
        let temp_path = temp_path_for(path);

        match self.remote.fetch_to_path(&remote_key, &temp_path) {
            Ok(_) => {}
            Err(RemoteError::NotFound(_)) => {
                let _ = fs::remove_file(&temp_path);
                debug!(key = %key, remote_key = %remote_key, "blob not in remote store");
                return Ok(());
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(StorageError::Remote(e));
            }
        }

        if let Err(e) = materialize(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        let size = fs::metadata(path)?.len();
        if self.budget.record(size) {
            self.evictions.trigger();
        }
        Ok(())
    }

    /// Wait for any in-flight eviction and stop starting new ones.
    pub fn shutdown(&self) {
        self.evictions.shutdown();
    }
}

fn accessed(path: PathBuf) -> PathBuf {
    // Best effort; the entry may be evicted concurrently
    let _ = mark_accessed(&path);
    path
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".{}{}", std::process::id(), EvictionWorker::TEMP_SUFFIX));
    PathBuf::from(name)
}

/// Mark the download read-only and move it into place.
fn materialize(temp_path: &Path, path: &Path) -> std::io::Result<()> {
    set_readonly(temp_path)?;
    fs::rename(temp_path, path)
}

#[cfg(unix)]
fn set_readonly(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o400))
}

#[cfg(not(unix))]
fn set_readonly(path: &Path) -> std::io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{ObjectStoreRemote, RemoteResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Remote that always fails with a transport-level error.
    struct BrokenRemote;

    impl RemoteObjectStore for BrokenRemote {
        fn fetch_to_path(&self, _key: &str, dest: &Path) -> RemoteResult<u64> {
            fs::write(dest, b"partial")?;
            Err(RemoteError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            )))
        }
    }

    struct Counting<R> {
        inner: R,
        calls: AtomicUsize,
    }

    impl<R: RemoteObjectStore> RemoteObjectStore for Counting<R> {
        fn fetch_to_path(&self, key: &str, dest: &Path) -> RemoteResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch_to_path(key, dest)
        }
    }

    fn setup(temp_dir: &TempDir) -> (CacheDirectory, ObjectStoreRemote) {
        let layout = CacheDirectory::open(temp_dir.path().join("cache")).unwrap();
        let remote = ObjectStoreRemote::in_memory().unwrap();
        (layout, remote)
    }

    #[test]
    fn test_miss_downloads_into_cache() {
        let temp_dir = TempDir::new().unwrap();
        let (layout, remote) = setup(&temp_dir);
        let key = BlobKey::new(1, 2);
        remote.put_bytes(&remote_object_key(&key), b"abc".to_vec()).unwrap();

        let coordinator = DownloadCoordinator::new(layout, remote, None);
        let path = coordinator.load_remote_blob(&key).unwrap();

        assert_eq!(path, coordinator.cache_path(&key));
        assert_eq!(fs::read(&path).unwrap(), b"abc");
        assert!(fs::metadata(&path).unwrap().permissions().readonly());
        assert!(!PathLock::token_path(&path).exists());
    }

    #[test]
    fn test_hit_skips_remote() {
        let temp_dir = TempDir::new().unwrap();
        let (layout, remote) = setup(&temp_dir);
        let key = BlobKey::new(1, 2);
        remote.put_bytes(&remote_object_key(&key), b"abc".to_vec()).unwrap();
        let counting = Arc::new(Counting {
            inner: remote,
            calls: AtomicUsize::new(0),
        });

        let coordinator = DownloadCoordinator::new(layout, Arc::clone(&counting), None);
        for _ in 0..5 {
            coordinator.load_remote_blob(&key).unwrap();
        }
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_remote_object_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let (layout, remote) = setup(&temp_dir);
        let key = BlobKey::new(7, 7);

        let coordinator = DownloadCoordinator::new(layout, remote, None);
        let err = coordinator.load_remote_blob(&key).unwrap_err();

        assert!(matches!(err, StorageError::NotFound(k) if k == key));
        let path = coordinator.cache_path(&key);
        assert!(!path.exists());
        assert!(!PathLock::token_path(&path).exists());
    }

    #[test]
    fn test_transport_failure_preserved_and_cleaned_up() {
        let temp_dir = TempDir::new().unwrap();
        let layout = CacheDirectory::open(temp_dir.path().join("cache")).unwrap();
        let key = BlobKey::new(3, 3);

        let coordinator = DownloadCoordinator::new(layout, BrokenRemote, None);
        let err = coordinator.load_remote_blob(&key).unwrap_err();
        assert!(matches!(err, StorageError::Remote(RemoteError::Io(_))), "got {err:?}");

        // No partial entry, no temp file, no lock token left behind
        let bucket = coordinator.layout().bucket_dir(&key);
        assert_eq!(fs::read_dir(&bucket).unwrap().count(), 0);
    }

    #[test]
    fn test_locked_variant_uses_held_lock() {
        let temp_dir = TempDir::new().unwrap();
        let (layout, remote) = setup(&temp_dir);
        let key = BlobKey::new(4, 4);
        remote.put_bytes(&remote_object_key(&key), b"locked".to_vec()).unwrap();

        let coordinator = DownloadCoordinator::new(layout, remote, None);
        let lock = coordinator.lock_entry(&key).unwrap();
        let path = coordinator.load_remote_blob_locked(&key, &lock).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"locked");
        drop(lock);
        assert!(!PathLock::token_path(&path).exists());
    }

    #[test]
    fn test_downloads_are_accounted() {
        let temp_dir = TempDir::new().unwrap();
        let (layout, remote) = setup(&temp_dir);
        let key = BlobKey::new(5, 5);
        remote.put_bytes(&remote_object_key(&key), vec![1u8; 30]).unwrap();

        let coordinator = DownloadCoordinator::new(layout, remote, Some(1000));
        coordinator.load_remote_blob(&key).unwrap();
        assert_eq!(coordinator.budget().loaded(), 30);
        coordinator.shutdown();
    }
}

//! Directory-backed primary blob storage.
//!
//! Layout: `<root>/0x<oid hex16>/0x<serial hex16>.blob`
//!
//! Commits write to `<root>/.tmp/` and rename into place, so a committed
//! path is either absent or complete. Committed files are read-only.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use tracing::debug;

use super::{BlobHandle, BlobStorage, CommittedBlob, StorageError, StorageResult};
use crate::key::{parse_hex_u64, BlobKey};

/// Primary blob storage rooted at a local directory.
#[derive(Debug)]
pub struct FileBlobStorage {
    name: String,
    root: PathBuf,
    closed: AtomicBool,
}

impl FileBlobStorage {
    const BLOB_SUFFIX: &'static str = ".blob";
    const TEMP_DIR: &'static str = ".tmp";

    /// Open (creating if needed) a blob storage directory.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            name: format!("FileBlobStorage({})", root.display()),
            root,
            closed: AtomicBool::new(false),
        })
    }

    /// Storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the committed file for `key`. Does not touch the filesystem.
    pub fn blob_path(&self, key: &BlobKey) -> PathBuf {
        self.root
            .join(format!("0x{}", key.oid_hex()))
            .join(format!("0x{}{}", key.serial_hex(), Self::BLOB_SUFFIX))
    }

    /// Recover the blob key from a committed file path.
    pub fn split_blob_filename(path: &Path) -> Option<BlobKey> {
        let serial = path
            .file_name()?
            .to_str()?
            .strip_suffix(Self::BLOB_SUFFIX)?;
        let oid = path.parent()?.file_name()?.to_str()?;
        if !oid.starts_with("0x") || !serial.starts_with("0x") {
            return None;
        }
        Some(BlobKey::new(parse_hex_u64(oid)?, parse_hex_u64(serial)?))
    }

    /// All committed blob files with their keys.
    pub fn list_blob_files(&self) -> StorageResult<Vec<(BlobKey, PathBuf)>> {
        self.ensure_open()?;

        let mut files = Vec::new();
        for oid_entry in fs::read_dir(&self.root)? {
            let oid_dir = oid_entry?.path();

            // Skip non-directories and special directories
            if !oid_dir.is_dir() {
                continue;
            }
            if let Some(name) = oid_dir.file_name().and_then(|n| n.to_str()) {
                if name.starts_with('.') {
                    continue;
                }
            }

            for blob_entry in fs::read_dir(&oid_dir)? {
                let path = blob_entry?.path();
                if let Some(key) = Self::split_blob_filename(&path) {
                    files.push((key, path));
                }
            }
        }

        files.sort();
        Ok(files)
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn temp_path(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        self.root
            .join(Self::TEMP_DIR)
            .join(format!(".tmp.{}.{}", std::process::id(), nanos))
    }
}

impl BlobStorage for FileBlobStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn blob_count(&self) -> StorageResult<usize> {
        Ok(self.list_blob_files()?.len())
    }

    fn load_blob(&self, key: &BlobKey) -> StorageResult<PathBuf> {
        self.ensure_open()?;
        let path = self.blob_path(key);
        if path.is_file() {
            Ok(path)
        } else {
            Err(StorageError::NotFound(*key))
        }
    }

    fn open_committed_blob_file(
        &self,
        key: &BlobKey,
        handle: Option<&BlobHandle>,
    ) -> StorageResult<CommittedBlob> {
        let path = self.load_blob(key)?;
        CommittedBlob::open(*key, path, handle).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(*key),
            _ => StorageError::Io(e),
        })
    }

    fn blob_size(&self, key: &BlobKey) -> StorageResult<u64> {
        let path = self.load_blob(key)?;
        Ok(fs::metadata(path)?.len())
    }

    fn iter_blobs(&self) -> StorageResult<Vec<BlobKey>> {
        Ok(self
            .list_blob_files()?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    fn store_blob(&self, key: &BlobKey, data: &mut dyn Read) -> StorageResult<PathBuf> {
        self.ensure_open()?;

        // Revisions are immutable; an existing commit wins
        let final_path = self.blob_path(key);
        if final_path.is_file() {
            return Ok(final_path);
        }

        let temp_path = self.temp_path();
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let written = match write_readonly(&temp_path, data) {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e.into());
            }
        };

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Err(e) = fs::rename(&temp_path, &final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        debug!(key = %key, bytes = written, "committed blob");
        Ok(final_path)
    }

    fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn write_readonly(path: &Path, data: &mut dyn Read) -> io::Result<u64> {
    let mut file = File::create(path)?;
    let written = io::copy(data, &mut file)?;
    file.sync_all()?;

    let mut perms = file.metadata()?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn commit(storage: &FileBlobStorage, key: BlobKey, data: &[u8]) -> PathBuf {
        storage.store_blob(&key, &mut &data[..]).unwrap()
    }

    #[test]
    fn test_store_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileBlobStorage::open(temp_dir.path().join("blobs")).unwrap();
        let key = BlobKey::new(1, 2);

        let path = commit(&storage, key, b"abc");
        assert_eq!(storage.load_blob(&key).unwrap(), path);
        assert_eq!(fs::read(&path).unwrap(), b"abc");
        assert_eq!(storage.blob_size(&key).unwrap(), 3);
        assert!(fs::metadata(&path).unwrap().permissions().readonly());
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileBlobStorage::open(temp_dir.path()).unwrap();

        let err = storage.load_blob(&BlobKey::new(9, 9)).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_store_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileBlobStorage::open(temp_dir.path()).unwrap();
        let key = BlobKey::new(1, 2);

        commit(&storage, key, b"first");
        commit(&storage, key, b"second");
        assert_eq!(fs::read(storage.load_blob(&key).unwrap()).unwrap(), b"first");
        assert_eq!(storage.blob_count().unwrap(), 1);
    }

    #[test]
    fn test_iter_blobs_and_split() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileBlobStorage::open(temp_dir.path()).unwrap();
        commit(&storage, BlobKey::new(2, 1), b"a");
        commit(&storage, BlobKey::new(1, 2), b"b");
        commit(&storage, BlobKey::new(1, 1), b"c");

        assert_eq!(
            storage.iter_blobs().unwrap(),
            vec![BlobKey::new(1, 1), BlobKey::new(1, 2), BlobKey::new(2, 1)]
        );

        let path = storage.blob_path(&BlobKey::new(0xff, 0x10));
        assert_eq!(
            FileBlobStorage::split_blob_filename(&path),
            Some(BlobKey::new(0xff, 0x10))
        );
        assert_eq!(
            FileBlobStorage::split_blob_filename(Path::new("0x01/notablob.txt")),
            None
        );
    }

    #[test]
    fn test_temp_dir_not_listed() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileBlobStorage::open(temp_dir.path()).unwrap();
        commit(&storage, BlobKey::new(1, 1), b"a");
        assert!(temp_dir.path().join(".tmp").is_dir());

        assert_eq!(storage.blob_count().unwrap(), 1);
    }

    #[test]
    fn test_open_committed_with_handle() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileBlobStorage::open(temp_dir.path()).unwrap();
        let key = BlobKey::new(3, 4);
        commit(&storage, key, b"content");
        let handle = BlobHandle::new();

        let mut blob = storage.open_committed_blob_file(&key, Some(&handle)).unwrap();
        assert_eq!(handle.open_readers(), 1);
        assert_eq!(blob.read_all().unwrap(), b"content");
        drop(blob);
        assert_eq!(handle.open_readers(), 0);
    }

    #[test]
    fn test_closed_storage_rejects_calls() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileBlobStorage::open(temp_dir.path()).unwrap();
        let key = BlobKey::new(1, 1);
        commit(&storage, key, b"a");

        storage.close().unwrap();
        assert!(matches!(storage.load_blob(&key), Err(StorageError::Closed)));
        assert!(matches!(storage.iter_blobs(), Err(StorageError::Closed)));
        assert!(matches!(
            storage.store_blob(&BlobKey::new(2, 2), &mut &b"b"[..]),
            Err(StorageError::Closed)
        ));
    }
}

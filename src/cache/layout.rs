//! On-disk layout of the blob cache directory
//!
//! Two-level fan-out: `<root>/<oid % 997>/<oid hex16>.<serial hex16>.blob`
//!
//! The bucket level bounds the number of entries per directory. The root
//! carries a `.layout` marker naming the layout so a directory written by
//! an incompatible layout is rejected instead of silently missing.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use filetime::FileTime;
use thiserror::Error;
use tracing::warn;

use crate::key::{parse_hex_u64, BlobKey};

/// Cache directory result type
pub type CacheDirResult<T> = Result<T, CacheDirError>;

/// Errors from cache directory operations
#[derive(Debug, Error)]
pub enum CacheDirError {
    #[error("cache directory {} has insecure permissions {mode:o}", path.display())]
    InsecureDirectory { path: PathBuf, mode: u32 },

    #[error("cache directory {} uses layout {found:?}, expected {expected:?}", path.display())]
    LayoutMismatch {
        path: PathBuf,
        found: String,
        expected: &'static str,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Deterministic mapping from blob keys to cache file paths.
#[derive(Debug, Clone)]
pub struct CacheDirectory {
    root: PathBuf,
}

impl CacheDirectory {
    /// Name recorded in the layout marker.
    pub const LAYOUT_NAME: &'static str = "fanout-997";
    /// Layout marker file name.
    pub const LAYOUT_MARKER: &'static str = ".layout";
    /// Suffix of materialized cache entries.
    pub const BLOB_SUFFIX: &'static str = ".blob";
    /// Number of first-level buckets.
    const FANOUT: u64 = 997;

    /// Open (creating if needed) a cache directory.
    ///
    /// Fails with [`CacheDirError::InsecureDirectory`] if the root is group-
    /// or world-writable, and with [`CacheDirError::LayoutMismatch`] if the
    /// root was initialized with a different layout.
    pub fn open(root: impl Into<PathBuf>) -> CacheDirResult<Self> {
        let dir = Self { root: root.into() };
        dir.create()?;
        dir.check_secure()?;
        Ok(dir)
    }

    fn create(&self) -> CacheDirResult<()> {
        if !self.root.exists() {
            create_private_dir_all(&self.root)?;
        }

        let marker = self.root.join(Self::LAYOUT_MARKER);
        match fs::read_to_string(&marker) {
            Ok(found) => {
                let found = found.trim();
                if found != Self::LAYOUT_NAME {
                    return Err(CacheDirError::LayoutMismatch {
                        path: self.root.clone(),
                        found: found.to_string(),
                        expected: Self::LAYOUT_NAME,
                    });
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Concurrent openers must never read a partial marker
                static SEQ: AtomicU64 = AtomicU64::new(0);
                let temp = self.root.join(format!(
                    "{}.{}.{}.tmp",
                    Self::LAYOUT_MARKER,
                    std::process::id(),
                    SEQ.fetch_add(1, Ordering::Relaxed)
                ));
                fs::write(&temp, format!("{}\n", Self::LAYOUT_NAME))?;
                fs::rename(&temp, &marker)?;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    /// Verify the root is not writable by group or others.
    ///
    /// Readable-by-others is tolerated with a warning.
    #[cfg(unix)]
    pub fn check_secure(&self) -> CacheDirResult<()> {
        use std::os::unix::fs::PermissionsExt;

        let mode = fs::metadata(&self.root)?.permissions().mode() & 0o777;
        if mode & 0o022 != 0 {
            return Err(CacheDirError::InsecureDirectory {
                path: self.root.clone(),
                mode,
            });
        }
        if mode & 0o077 != 0 {
            warn!(
                dir = %self.root.display(),
                mode = %format_args!("{:o}", mode),
                "cache directory is readable by other users"
            );
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn check_secure(&self) -> CacheDirResult<()> {
        fs::metadata(&self.root)?;
        Ok(())
    }

    /// Cache root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bucket directory holding the entries of `key`'s object.
    pub fn bucket_dir(&self, key: &BlobKey) -> PathBuf {
        self.root.join(format!("{:03}", key.oid % Self::FANOUT))
    }

    /// Path of the cache entry for `key`. Does not touch the filesystem.
    pub fn blob_path(&self, key: &BlobKey) -> PathBuf {
        self.bucket_dir(key).join(format!(
            "{}.{}{}",
            key.oid_hex(),
            key.serial_hex(),
            Self::BLOB_SUFFIX
        ))
    }

    /// Create the bucket directory for `key` if missing and return the entry path.
    pub fn create_path_for(&self, key: &BlobKey) -> CacheDirResult<PathBuf> {
        create_private_dir_all(&self.bucket_dir(key))?;
        Ok(self.blob_path(key))
    }

    /// Recover the blob key from a cache entry path.
    pub fn split_blob_filename(path: &Path) -> Option<BlobKey> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_suffix(Self::BLOB_SUFFIX)?;
        let (oid, serial) = stem.split_once('.')?;
        Some(BlobKey::new(parse_hex_u64(oid)?, parse_hex_u64(serial)?))
    }

    /// Whether `path` names a materialized cache entry (not a lock or temp file).
    pub fn is_blob_file(path: &Path) -> bool {
        Self::split_blob_filename(path).is_some()
    }
}

/// Record an access on a cache entry.
///
/// Sets the access time explicitly so oldest-accessed-first eviction works
/// on filesystems mounted with `noatime`.
pub fn mark_accessed(path: &Path) -> io::Result<()> {
    filetime::set_file_atime(path, FileTime::now())
}

#[cfg(unix)]
fn create_private_dir_all(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir_all(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

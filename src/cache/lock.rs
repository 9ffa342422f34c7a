//! Path-scoped inter-process lock for cache entries
//!
//! Every cache entry `<name>.blob` has a transient lock token
//! `<name>.blob.lock` next to it. The token exists only while some thread
//! (in any process sharing the cache directory) is inside the entry's
//! download critical section.
//!
//! This module implements advisory file locking with:
//! - Blocking acquisition (no timeout)
//! - Contention logging
//! - Token removal on release, with a re-check after acquisition so a
//!   waiter that locked an already-unlinked token tries again
//!
//! Without `flock` (non-unix) the token's exclusive creation is the lock,
//! so a holder that dies without dropping its `PathLock` leaves the token
//! behind. Tokens older than [`STALE_TOKEN_AGE`] are treated as abandoned
//! and replaced; a live holder must not keep one entry locked that long.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("I/O error on lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg_attr(unix, allow(dead_code))]
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Age past which an exclusive-create token is taken as abandoned.
pub const STALE_TOKEN_AGE: Duration = Duration::from_secs(60 * 60);

/// Whether the token at `lock_path` was last written at least `max_age` ago.
#[cfg_attr(unix, allow(dead_code))]
fn is_stale_token(lock_path: &Path, max_age: Duration) -> bool {
    fs::metadata(lock_path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age >= max_age)
}

/// Exclusive lock on one cache path, shared across threads and processes.
///
/// The lock is released (and its token removed) when this struct is dropped.
#[derive(Debug)]
pub struct PathLock {
    /// Path to the lock token
    lock_path: PathBuf,
    /// The opened token (held for the lock duration)
    lock_file: File,
}

impl PathLock {
    /// Lock token suffix appended to the guarded path.
    pub const LOCK_SUFFIX: &'static str = ".lock";

    /// Lock token path guarding `target`.
    pub fn token_path(target: &Path) -> PathBuf {
        let mut name = OsString::from(target.as_os_str());
        name.push(Self::LOCK_SUFFIX);
        PathBuf::from(name)
    }

    /// Acquire the lock guarding `target`, blocking until it is available.
    ///
    /// The parent directory of `target` must already exist.
    pub fn acquire(target: &Path) -> LockResult<Self> {
        let lock_path = Self::token_path(target);
        let start = Instant::now();
        let mut contended = false;

        loop {
            let file = match open_token(&lock_path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Exclusive-create fallback: the token itself is the lock.
                    contended = true;
                    std::thread::sleep(POLL_INTERVAL);
                    continue;
                }
                Err(e) => return Err(LockError::io(&lock_path, e)),
            };

            match sys::try_lock(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !contended {
                        debug!(lock = %lock_path.display(), "lock contention, waiting");
                        contended = true;
                    }
                    sys::lock(&file).map_err(|e| LockError::io(&lock_path, e))?;
                }
                Err(e) => return Err(LockError::io(&lock_path, e)),
            }

            // The previous holder unlinks the token before unlocking, so the
            // inode we hold may no longer be the one at `lock_path`.
            if sys::is_current(&file, &lock_path).map_err(|e| LockError::io(&lock_path, e))? {
                if contended {
                    debug!(
                        lock = %lock_path.display(),
                        waited_ms = start.elapsed().as_millis() as u64,
                        "lock acquired after contention"
                    );
                }
                return Ok(Self::held(lock_path, file));
            }
        }
    }

    /// Try to acquire the lock guarding `target` without waiting.
    ///
    /// Returns `Ok(None)` when another holder has it.
    pub fn try_acquire(target: &Path) -> LockResult<Option<Self>> {
        let lock_path = Self::token_path(target);
        let file = match open_token(&lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(LockError::io(&lock_path, e)),
        };

        match sys::try_lock(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(LockError::io(&lock_path, e)),
        }

        if sys::is_current(&file, &lock_path).map_err(|e| LockError::io(&lock_path, e))? {
            Ok(Some(Self::held(lock_path, file)))
        } else {
            // Lost a race with a releasing holder; someone else owns the fresh token.
            Ok(None)
        }
    }

    fn held(lock_path: PathBuf, mut lock_file: File) -> Self {
        // Holder pid, for diagnostics only.
        let _ = lock_file.set_len(0);
        let _ = writeln!(lock_file, "{}", std::process::id());
        Self {
            lock_path,
            lock_file,
        }
    }

    /// Get the lock token path.
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        // Unlink while still holding the lock; waiters re-check the inode.
        let _ = fs::remove_file(&self.lock_path);
        sys::unlock(&self.lock_file);
    }
}

#[cfg(unix)]
fn open_token(lock_path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(lock_path)
}

#[cfg(not(unix))]
fn open_token(lock_path: &Path) -> io::Result<File> {
    let create = || {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(lock_path)
    };

    match create() {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if !is_stale_token(lock_path, STALE_TOKEN_AGE) {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"));
            }
            debug!(lock = %lock_path.display(), "removing abandoned lock token");
            match fs::remove_file(lock_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            // Another waiter may have replaced it first.
            create().map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    io::Error::new(io::ErrorKind::WouldBlock, "lock held")
                } else {
                    e
                }
            })
        }
        other => other,
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::{self, File};
    use std::io;
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    fn flock(file: &File, op: libc::c_int) -> io::Result<()> {
        loop {
            let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EWOULDBLOCK) => {
                    return Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
                }
                _ => return Err(err),
            }
        }
    }

    pub fn try_lock(file: &File) -> io::Result<()> {
        flock(file, libc::LOCK_EX | libc::LOCK_NB)
    }

    pub fn lock(file: &File) -> io::Result<()> {
        flock(file, libc::LOCK_EX)
    }

    pub fn unlock(file: &File) {
        let _ = flock(file, libc::LOCK_UN);
    }

    /// Whether `file` is still the inode linked at `path`.
    pub fn is_current(file: &File, path: &Path) -> io::Result<bool> {
        let held = file.metadata()?;
        match fs::metadata(path) {
            Ok(linked) => Ok(held.dev() == linked.dev() && held.ino() == linked.ino()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use std::fs::File;
    use std::io;
    use std::path::Path;

    // Exclusive creation is the lock; opening already failed if it is held.
    pub fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn unlock(_file: &File) {}

    pub fn is_current(_file: &File, _path: &Path) -> io::Result<bool> {
        Ok(true)
    }
}

//! Size-bounded cache eviction
//!
//! - Removes entries oldest-accessed first until the total size is at or
//!   below the target
//! - Eviction MUST NOT delete entries whose download lock is held
//! - Only one evictor runs per cache directory at a time, across processes
//!   (`<root>/.evict.lock`); a run that finds it held does nothing
//! - Orphaned download temp files from crashed processes are removed

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::layout::CacheDirectory;
use super::lock::{LockError, PathLock};

/// Eviction result type
pub type EvictionResult<T> = Result<T, EvictionError>;

/// Errors that abort an eviction run
#[derive(Debug, Error)]
pub enum EvictionError {
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to scan cache directory: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Result of one eviction run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvictionReport {
    /// Number of entries scanned
    pub scanned: usize,
    /// Number of entries deleted
    pub deleted: usize,
    /// Bytes reclaimed
    pub bytes_reclaimed: u64,
    /// Entries skipped because a download held their lock
    pub skipped: usize,
    /// Cache size after the run
    pub remaining_bytes: u64,
    /// Orphaned temp files removed
    pub orphans_removed: usize,
    /// Errors encountered (non-fatal)
    pub errors: Vec<String>,
}

/// Cache entry info for eviction decisions.
#[derive(Debug, Clone)]
struct CacheEntryInfo {
    path: PathBuf,
    size_bytes: u64,
    last_accessed: SystemTime,
}

/// Trims a cache directory down to a target size.
#[derive(Debug, Clone)]
pub struct EvictionWorker {
    root: PathBuf,
    target: u64,
    orphan_threshold: Duration,
}

impl EvictionWorker {
    /// Name of the per-directory evictor lock target (token is `.evict.lock`).
    const EVICT_LOCK_TARGET: &'static str = ".evict";
    /// Suffix of in-flight download files.
    pub const TEMP_SUFFIX: &'static str = ".tmp";

    /// Create an eviction worker for `root` with the given target size.
    pub fn new(root: impl Into<PathBuf>, target: u64) -> Self {
        Self {
            root: root.into(),
            target,
            orphan_threshold: Duration::from_secs(3600), // 1 hour default
        }
    }

    /// Override the age after which temp files count as orphaned.
    pub fn with_orphan_threshold(mut self, threshold: Duration) -> Self {
        self.orphan_threshold = threshold;
        self
    }

    /// Target size in bytes.
    pub fn target(&self) -> u64 {
        self.target
    }

    /// One pass with its outcome logged instead of returned.
    fn run_logged(&self) {
        match self.run() {
            Ok(Some(_)) => {}
            Ok(None) => debug!(dir = %self.root.display(), "eviction already running elsewhere"),
            Err(e) => warn!(dir = %self.root.display(), error = %e, "cache eviction failed"),
        }
    }

    /// Run one eviction pass on the calling thread.
    ///
    /// Returns `Ok(None)` if another evictor holds the directory.
    pub fn run(&self) -> EvictionResult<Option<EvictionReport>> {
        if !self.root.is_dir() {
            return Ok(Some(EvictionReport::default()));
        }

        let Some(_evict_lock) = PathLock::try_acquire(&self.root.join(Self::EVICT_LOCK_TARGET))?
        else {
            return Ok(None);
        };

        let mut report = EvictionReport::default();
        let mut entries = Vec::new();
        self.collect_entries(&mut entries, &mut report)?;
        report.scanned = entries.len();

        let mut current_size: u64 = entries.iter().map(|e| e.size_bytes).sum();
        if current_size <= self.target {
            report.remaining_bytes = current_size;
            debug!(
                dir = %self.root.display(),
                size = current_size,
                target = self.target,
                "cache within target, nothing to evict"
            );
            return Ok(Some(report));
        }

        // Oldest accessed first
        entries.sort_by_key(|e| e.last_accessed);

        for entry in &entries {
            if current_size <= self.target {
                break;
            }

            // An entry being downloaded is not evictable
            let Some(_lock) = PathLock::try_acquire(&entry.path)? else {
                report.skipped += 1;
                continue;
            };

            match fs::remove_file(&entry.path) {
                Ok(()) => {
                    debug!(path = %entry.path.display(), bytes = entry.size_bytes, "evicted");
                    report.deleted += 1;
                    report.bytes_reclaimed += entry.size_bytes;
                }
                // Removed by someone else in the meantime
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "failed to evict cache entry");
                    report
                        .errors
                        .push(format!("Failed to delete {}: {}", entry.path.display(), e));
                    continue;
                }
            }
            current_size = current_size.saturating_sub(entry.size_bytes);
        }

        report.remaining_bytes = current_size;
        info!(
            dir = %self.root.display(),
            deleted = report.deleted,
            reclaimed = report.bytes_reclaimed,
            skipped = report.skipped,
            remaining = report.remaining_bytes,
            target = self.target,
            "cache eviction finished"
        );
        Ok(Some(report))
    }

    /// Collect cache entries, removing orphaned temp files along the way.
    fn collect_entries(
        &self,
        entries: &mut Vec<CacheEntryInfo>,
        report: &mut EvictionReport,
    ) -> EvictionResult<()> {
        for dir_entry in WalkDir::new(&self.root).min_depth(1).max_depth(2) {
            let dir_entry = match dir_entry {
                Ok(e) => e,
                // Bucket removed or entry vanished mid-scan
                Err(e) if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) => {
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            if !dir_entry.file_type().is_file() {
                continue;
            }

            let path = dir_entry.path();
            let meta = match dir_entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };

            if CacheDirectory::is_blob_file(path) {
                entries.push(CacheEntryInfo {
                    path: path.to_path_buf(),
                    size_bytes: meta.len(),
                    last_accessed: meta
                        .accessed()
                        .or_else(|_| meta.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH),
                });
            } else if self.is_orphaned_temp(path, &meta) && fs::remove_file(path).is_ok() {
                debug!(path = %path.display(), "removed orphaned download");
                report.orphans_removed += 1;
            }
        }

        Ok(())
    }

    fn is_orphaned_temp(&self, path: &Path, meta: &fs::Metadata) -> bool {
        let is_temp = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(Self::TEMP_SUFFIX))
            .unwrap_or(false);
        if !is_temp {
            return false;
        }
        meta.modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .map(|age| age > self.orphan_threshold)
            .unwrap_or(false)
    }
}

/// Dispatches background eviction runs for one cache directory.
///
/// At most one eviction thread is tracked. A trigger that arrives while
/// that thread is still running is folded into it: the thread makes one
/// more pass before exiting, so downloads that landed after its scan are
/// still accounted for. Evictors in other processes are excluded by the
/// directory's evictor lock.
#[derive(Debug)]
pub struct EvictionScheduler {
    root: PathBuf,
    target: u64,
    state: Arc<Mutex<RunState>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

#[derive(Debug, Default)]
struct RunState {
    /// An eviction thread is between spawn and its final pass
    running: bool,
    /// A trigger arrived while running; make another pass
    rerun: bool,
}

impl EvictionScheduler {
    pub fn new(root: impl Into<PathBuf>, target: u64) -> Self {
        Self {
            root: root.into(),
            target,
            state: Arc::new(Mutex::new(RunState::default())),
            task: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Request an eviction run.
    ///
    /// Returns whether a new thread was started. When a run is already in
    /// progress it is asked to make another pass instead.
    pub fn trigger(&self) -> bool {
        if self.shut_down.load(Ordering::SeqCst) {
            return false;
        }

        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.running {
                debug!(dir = %self.root.display(), "eviction in progress, queueing another pass");
                state.rerun = true;
                return false;
            }
            state.running = true;
        }
        if let Some(finished) = task.take() {
            let _ = finished.join();
        }

        let worker = EvictionWorker::new(&self.root, self.target);
        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name("blob-cache-evict".to_string())
            .spawn(move || run_until_settled(&worker, &state));

        match spawned {
            Ok(handle) => {
                debug!(dir = %self.root.display(), target = self.target, "eviction triggered");
                *task = Some(handle);
                true
            }
            Err(e) => {
                self.state.lock().unwrap_or_else(|e| e.into_inner()).running = false;
                warn!(error = %e, "failed to start eviction thread");
                false
            }
        }
    }

    /// Whether an eviction run is in progress.
    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).running
    }

    /// Stop accepting triggers and wait for the tracked run to finish.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(dir = %self.root.display(), "eviction thread panicked");
            }
        }
    }
}

/// Body of the eviction thread: pass until no rerun was requested.
///
/// `running` is cleared under the same lock that observes `rerun`, so a
/// trigger either queues a pass here or starts a new thread.
fn run_until_settled(worker: &EvictionWorker, state: &Mutex<RunState>) {
    let _reset = ResetOnPanic(state);
    loop {
        worker.run_logged();

        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        if state.rerun {
            state.rerun = false;
            continue;
        }
        state.running = false;
        return;
    }
}

struct ResetOnPanic<'a>(&'a Mutex<RunState>);

impl Drop for ResetOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
            state.running = false;
            state.rerun = false;
        }
    }
}

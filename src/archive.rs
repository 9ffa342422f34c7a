//! Upload aged primary blobs to the remote object store.
//!
//! Counterpart of the read path: blobs archived here are the ones the
//! tiered store later downloads on demand.

use std::fs;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::key::remote_object_key;
use crate::remote::{ObjectStoreRemote, RemoteError};
use crate::storage::{FileBlobStorage, StorageError};

/// Archive errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to scan primary storage: {0}")]
    Storage(#[from] StorageError),

    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),
}

/// Which blobs to archive and what to do with them afterwards.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Only blobs last modified at least this long ago
    pub min_age: Duration,
    /// Only blobs at least this many bytes
    pub min_size: u64,
    /// Delete the local copy once it is known to be in the remote store
    pub destroy: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            min_age: Duration::from_secs(SECS_PER_DAY),
            min_size: 0,
            destroy: false,
        }
    }
}

impl ArchiveOptions {
    /// Set `min_age` to a whole number of days, saturating on overflow.
    pub fn with_min_age_days(mut self, days: u64) -> Self {
        self.min_age = Duration::from_secs(days.saturating_mul(SECS_PER_DAY));
        self
    }
}

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Outcome of one archive run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchiveSummary {
    pub scanned: usize,
    pub uploaded: usize,
    pub uploaded_bytes: u64,
    /// Already present in the remote store
    pub already_archived: usize,
    pub skipped_too_new: usize,
    pub skipped_too_small: usize,
    pub destroyed: usize,
    /// Per-file failures; the run continues past them
    pub errors: Vec<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Archive the primary's eligible blobs into `remote`.
pub fn archive_blobs(
    primary: &FileBlobStorage,
    remote: &ObjectStoreRemote,
    opts: &ArchiveOptions,
) -> Result<ArchiveSummary, ArchiveError> {
    let mut summary = ArchiveSummary::default();
    let existing = remote.list_keys()?;
    let cutoff = SystemTime::now()
        .checked_sub(opts.min_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    for (key, path) in primary.list_blob_files()? {
        summary.scanned += 1;

        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                summary.errors.push(format!("{}: {}", path.display(), e));
                continue;
            }
        };
        if meta.modified().map(|m| m > cutoff).unwrap_or(true) {
            summary.skipped_too_new += 1;
            continue;
        }
        if meta.len() < opts.min_size {
            summary.skipped_too_small += 1;
            continue;
        }

        let remote_key = remote_object_key(&key);
        if existing.contains(&remote_key) {
            summary.already_archived += 1;
        } else {
            match remote.upload_file(&remote_key, &path) {
                Ok(size) => {
                    debug!(key = %key, remote_key = %remote_key, bytes = size, "uploaded blob");
                    summary.uploaded += 1;
                    summary.uploaded_bytes += size;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to upload blob");
                    summary.errors.push(format!("{}: {}", path.display(), e));
                    continue;
                }
            }
        }

        if opts.destroy {
            match fs::remove_file(&path) {
                Ok(()) => summary.destroyed += 1,
                Err(e) => summary.errors.push(format!("{}: {}", path.display(), e)),
            }
        }
    }

    summary.completed_at = Some(Utc::now());
    info!(
        scanned = summary.scanned,
        uploaded = summary.uploaded,
        bytes = summary.uploaded_bytes,
        already_archived = summary.already_archived,
        destroyed = summary.destroyed,
        errors = summary.errors.len(),
        "archive run complete"
    );
    Ok(summary)
}

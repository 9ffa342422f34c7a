//! Download accounting that decides when to trim the cache
//!
//! Bytes fetched from the remote store accumulate until they reach 10% of
//! the cache size limit. At that point the accumulator is reset to zero
//! *before* the caller dispatches eviction, so a slow eviction run never
//! lets the counter grow without bound.

use std::sync::Mutex;

/// Process-wide counter of bytes downloaded since the last eviction trigger.
#[derive(Debug)]
pub struct SizeBudgetTracker {
    /// Cache size limit in bytes (`None` disables tracking)
    limit: Option<u64>,
    /// Bytes loaded since the last trigger
    loaded: Mutex<u64>,
}

impl SizeBudgetTracker {
    /// Create a tracker for the given cache size limit.
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            loaded: Mutex::new(0),
        }
    }

    /// Configured cache size limit.
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Download volume that triggers an eviction check: 10% of the limit.
    pub fn check_threshold(&self) -> Option<u64> {
        self.limit.map(|limit| limit / 10)
    }

    /// Size an eviction run trims the cache down to.
    pub fn target(&self) -> Option<u64> {
        let limit = self.limit?;
        Some(limit.saturating_sub(limit / 10))
    }

    /// Record a completed download.
    ///
    /// Returns `true` when the caller must dispatch an eviction run; the
    /// accumulator is already zero when this returns `true`.
    pub fn record(&self, bytes: u64) -> bool {
        let Some(threshold) = self.check_threshold() else {
            return false;
        };

        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        *loaded = loaded.saturating_add(bytes);
        if *loaded >= threshold {
            *loaded = 0;
            true
        } else {
            false
        }
    }

    /// Bytes accumulated since the last trigger.
    pub fn loaded(&self) -> u64 {
        *self.loaded.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//! Local cache of blobs downloaded from the remote object store
//!
//! - Deterministic two-level fan-out layout under a private root directory
//! - Path-scoped `flock` locks so a blob is downloaded at most once across
//!   every thread of every process sharing the directory
//! - Download accounting with background, size-bounded eviction
//!
//! ## Locking
//!
//! The entry lock is the only mutual-exclusion primitive on the download
//! path. Existence is re-checked after acquiring it; callers that lost the
//! race observe the winner's file.

mod budget;
mod download;
mod evict;
mod layout;
mod lock;

pub use budget::SizeBudgetTracker;
pub use download::DownloadCoordinator;
pub use evict::{EvictionError, EvictionReport, EvictionResult, EvictionScheduler, EvictionWorker};
pub use layout::{mark_accessed, CacheDirError, CacheDirResult, CacheDirectory};
pub use lock::{LockError, LockResult, PathLock};

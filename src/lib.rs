//! Tiered Blobs - read-through tiered blob storage
//!
//! Wraps a primary blob backend so that blobs missing locally are served
//! from a local on-disk cache, populated on demand from a remote object
//! store. Downloads are coordinated across threads and processes sharing
//! the cache directory, and the cache is kept under a size budget by
//! background eviction.

pub mod archive;
pub mod cache;
pub mod config;
pub mod key;
pub mod remote;
pub mod storage;
pub mod tiered;

pub use archive::{archive_blobs, ArchiveError, ArchiveOptions, ArchiveSummary};
pub use cache::{CacheDirectory, DownloadCoordinator, EvictionReport, EvictionWorker};
pub use config::{ConfigError, TieredConfig};
pub use key::{remote_object_key, BlobKey};
pub use remote::{ObjectStoreRemote, RemoteError, RemoteObjectStore};
pub use storage::{BlobHandle, BlobStorage, CommittedBlob, FileBlobStorage, StorageError, StorageResult};
pub use tiered::TieredBlobStore;

//! Remote object store holding archived blobs
//!
//! From the cache's point of view the remote tier is read-only: a single
//! operation fetches one object into a local file.

mod store;

use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

pub use store::{ObjectStoreRemote, S3Settings};

/// Remote result type
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors from the remote object store
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote object not found: {0}")]
    NotFound(String),

    #[error("object store error: {0}")]
    Backend(#[source] object_store::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to start remote runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("invalid remote configuration: {0}")]
    Config(String),
}

impl From<object_store::Error> for RemoteError {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => Self::NotFound(path),
            other => Self::Backend(other),
        }
    }
}

/// Read access to the remote object store.
pub trait RemoteObjectStore: Send + Sync {
    /// Download the object at `key` into `dest`, returning the bytes written.
    ///
    /// A missing object is reported as [`RemoteError::NotFound`].
    fn fetch_to_path(&self, key: &str, dest: &Path) -> RemoteResult<u64>;
}

impl<T: RemoteObjectStore + ?Sized> RemoteObjectStore for Arc<T> {
    fn fetch_to_path(&self, key: &str, dest: &Path) -> RemoteResult<u64> {
        (**self).fetch_to_path(key, dest)
    }
}

impl<T: RemoteObjectStore + ?Sized> RemoteObjectStore for Box<T> {
    fn fetch_to_path(&self, key: &str, dest: &Path) -> RemoteResult<u64> {
        (**self).fetch_to_path(key, dest)
    }
}

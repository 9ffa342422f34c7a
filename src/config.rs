//! Tiered store configuration.
//!
//! Loaded from TOML:
//!
//! ```toml
//! cache_dir = "/var/cache/blobs"
//! cache_size = 1073741824        # bytes; default 20 MiB
//! bucket_name = "archived-blobs"
//! primary_dir = "/var/lib/blobs"
//! # region, endpoint, aws_access_key_id, aws_secret_access_key: optional
//! # unlimited = true             # disable eviction
//! # remote_root = "/srv/buckets"  # serve the bucket from a local directory
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheDirError, CacheDirectory};
use crate::remote::{ObjectStoreRemote, RemoteError, RemoteResult, S3Settings};
use crate::storage::{FileBlobStorage, StorageError};
use crate::tiered::TieredBlobStore;

/// Default cache size limit: 20 MiB.
pub const DEFAULT_CACHE_SIZE: u64 = 20 * 1024 * 1024;

/// Errors from loading or applying configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("cache directory error: {0}")]
    Cache(#[from] CacheDirError),

    #[error("primary storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),
}

/// Recognized configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TieredConfig {
    /// Cache root directory
    pub cache_dir: PathBuf,
    /// Cache size limit in bytes
    #[serde(default = "default_cache_size")]
    pub cache_size: u64,
    /// Disable size tracking and eviction
    #[serde(default)]
    pub unlimited: bool,
    /// Remote bucket holding archived blobs
    pub bucket_name: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub aws_access_key_id: Option<String>,
    #[serde(default)]
    pub aws_secret_access_key: Option<String>,
    /// Primary blob storage directory
    pub primary_dir: PathBuf,
    /// Serve the bucket from `<remote_root>/<bucket_name>` instead of S3
    #[serde(default)]
    pub remote_root: Option<PathBuf>,
}

fn default_cache_size() -> u64 {
    DEFAULT_CACHE_SIZE
}

impl TieredConfig {
    /// Load and validate a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML config text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_name.trim().is_empty() {
            return Err(ConfigError::Invalid("bucket_name cannot be empty".to_string()));
        }
        if self.cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("cache_dir cannot be empty".to_string()));
        }
        if self.aws_access_key_id.is_some() != self.aws_secret_access_key.is_some() {
            return Err(ConfigError::Invalid(
                "aws_access_key_id and aws_secret_access_key must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective cache size limit (`None` when unlimited).
    pub fn cache_limit(&self) -> Option<u64> {
        if self.unlimited {
            None
        } else {
            Some(self.cache_size)
        }
    }

    /// S3 settings, filling credentials from the environment when unset.
    pub fn s3_settings(&self) -> S3Settings {
        S3Settings {
            bucket: self.bucket_name.clone(),
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            access_key_id: self.aws_access_key_id.clone(),
            secret_access_key: self.aws_secret_access_key.clone(),
        }
        .with_env_credentials()
    }

    /// Open the configured remote object store.
    pub fn open_remote(&self) -> RemoteResult<ObjectStoreRemote> {
        match &self.remote_root {
            Some(root) => ObjectStoreRemote::local(&root.join(&self.bucket_name)),
            None => ObjectStoreRemote::s3(&self.s3_settings()),
        }
    }

    /// Wire primary storage, cache directory and remote store together.
    pub fn open(&self) -> Result<TieredBlobStore<FileBlobStorage>, ConfigError> {
        let storage = FileBlobStorage::open(&self.primary_dir)?;
        let cache = CacheDirectory::open(&self.cache_dir)?;
        let remote = self.open_remote()?;
        Ok(TieredBlobStore::new(storage, cache, remote, self.cache_limit()))
    }
}

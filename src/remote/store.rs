//! `object_store`-backed remote: in-memory, local filesystem, or Amazon S3.
//!
//! The read path is synchronous, so the wrapper owns a small tokio runtime
//! and blocks on it. Object bodies are streamed to disk chunk by chunk.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Runtime;
use tracing::debug;

use super::{RemoteError, RemoteObjectStore, RemoteResult};

/// S3 connection settings.
///
/// Credentials left unset are resolved from the environment.
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    /// Bucket name
    pub bucket: String,
    /// AWS region (optional, will use the environment default if not specified)
    pub region: Option<String>,
    /// Custom endpoint URL (e.g. for MinIO or localstack)
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl S3Settings {
    /// Variables consulted for credentials missing from the settings.
    ///
    /// Lower-case names as exported for the archival tooling; the upper-case
    /// `AWS_*` variables are read by the S3 client itself.
    pub const ACCESS_KEY_VAR: &'static str = "aws_access_key_id";
    pub const SECRET_KEY_VAR: &'static str = "aws_secret_access_key";

    /// Fill unset credentials from the process environment.
    pub fn with_env_credentials(self) -> Self {
        self.with_credentials_from(|name| std::env::var(name).ok())
    }

    /// Fill unset credentials from `lookup`; only a complete pair is used.
    pub fn with_credentials_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if self.access_key_id.is_some() && self.secret_access_key.is_some() {
            return self;
        }
        if let (Some(id), Some(secret)) =
            (lookup(Self::ACCESS_KEY_VAR), lookup(Self::SECRET_KEY_VAR))
        {
            self.access_key_id = Some(id);
            self.secret_access_key = Some(secret);
        }
        self
    }
}

/// Read size for streamed uploads.
pub const UPLOAD_CHUNK: usize = 1024 * 1024;

/// Remote object store over any [`ObjectStore`] implementation.
pub struct ObjectStoreRemote {
    store: Arc<dyn ObjectStore>,
    runtime: Runtime,
}

impl ObjectStoreRemote {
    /// Wrap an existing object store.
    pub fn new(store: Arc<dyn ObjectStore>) -> RemoteResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("blob-remote")
            .enable_all()
            .build()
            .map_err(RemoteError::Runtime)?;
        Ok(Self { store, runtime })
    }

    /// Purely in-memory store (tests and demos).
    pub fn in_memory() -> RemoteResult<Self> {
        Self::new(Arc::new(object_store::memory::InMemory::new()))
    }

    /// Store rooted at a local directory.
    pub fn local(root: &Path) -> RemoteResult<Self> {
        fs::create_dir_all(root)?;
        let store = object_store::local::LocalFileSystem::new_with_prefix(root)?;
        Self::new(Arc::new(store))
    }

    /// Amazon S3 bucket.
    #[cfg(feature = "s3")]
    pub fn s3(settings: &S3Settings) -> RemoteResult<Self> {
        use object_store::aws::AmazonS3Builder;

        if settings.bucket.is_empty() {
            return Err(RemoteError::Config("bucket name cannot be empty".to_string()));
        }

        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&settings.bucket);
        if let Some(region) = &settings.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }
        if let (Some(id), Some(secret)) = (&settings.access_key_id, &settings.secret_access_key) {
            builder = builder
                .with_access_key_id(id)
                .with_secret_access_key(secret);
        }

        Self::new(Arc::new(builder.build()?))
    }

    #[cfg(not(feature = "s3"))]
    pub fn s3(settings: &S3Settings) -> RemoteResult<Self> {
        Err(RemoteError::Config(format!(
            "bucket {:?} requires S3 support; rebuild with --features s3",
            settings.bucket
        )))
    }

    /// All object keys currently in the store.
    pub fn list_keys(&self) -> RemoteResult<HashSet<String>> {
        self.runtime.block_on(async {
            let mut keys = HashSet::new();
            let mut listing = self.store.list(None);
            while let Some(meta) = listing.next().await {
                keys.insert(meta?.location.to_string());
            }
            Ok(keys)
        })
    }

    /// Upload a local file under `key`, returning its size.
    ///
    /// The file is streamed in [`UPLOAD_CHUNK`] pieces; large files go up as
    /// a multipart upload without being held in memory. No content type is
    /// attached: blobs are opaque and the read path never consults one.
    pub fn upload_file(&self, key: &str, src: &Path) -> RemoteResult<u64> {
        let mut file = File::open(src)?;
        let location = ObjectPath::from(key);

        self.runtime.block_on(async {
            let mut writer = BufWriter::new(Arc::clone(&self.store), location);
            let mut buf = vec![0u8; UPLOAD_CHUNK];
            let mut uploaded = 0u64;
            loop {
                let n = match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = writer.abort().await;
                        return Err(e.into());
                    }
                };
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    let _ = writer.abort().await;
                    return Err(e.into());
                }
                uploaded += n as u64;
            }
            writer.shutdown().await?;
            Ok::<_, RemoteError>(uploaded)
        })
    }

    /// Store `data` under `key`.
    pub fn put_bytes(&self, key: &str, data: impl Into<Vec<u8>>) -> RemoteResult<()> {
        let location = ObjectPath::from(key);
        let payload = PutPayload::from(data.into());
        self.runtime.block_on(self.store.put(&location, payload))?;
        Ok(())
    }
}

impl RemoteObjectStore for ObjectStoreRemote {
    fn fetch_to_path(&self, key: &str, dest: &Path) -> RemoteResult<u64> {
        let location = ObjectPath::from(key);

        let written = self.runtime.block_on(async {
            let result = self.store.get(&location).await?;
            let mut body = result.into_stream();
            let mut file = File::create(dest)?;
            let mut written = 0u64;
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                file.write_all(&chunk)?;
                written += chunk.len() as u64;
            }
            file.sync_all()?;
            Ok::<_, RemoteError>(written)
        })?;

        debug!(key, bytes = written, store = %self.store, "fetched remote object");
        Ok(written)
    }
}

impl fmt::Debug for ObjectStoreRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreRemote")
            .field("store", &self.store.to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fetch_existing_object() {
        let temp_dir = TempDir::new().unwrap();
        let remote = ObjectStoreRemote::in_memory().unwrap();
        remote.put_bytes("a/b.blob", b"abc".to_vec()).unwrap();

        let dest = temp_dir.path().join("out");
        let written = remote.fetch_to_path("a/b.blob", &dest).unwrap();
        assert_eq!(written, 3);
        assert_eq!(fs::read(&dest).unwrap(), b"abc");
    }

    #[test]
    fn test_fetch_missing_object_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let remote = ObjectStoreRemote::in_memory().unwrap();

        let dest = temp_dir.path().join("out");
        let err = remote.fetch_to_path("missing/key.blob", &dest).unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(_)), "got {err:?}");
        assert!(!dest.exists());
    }

    #[test]
    fn test_upload_and_list() {
        let temp_dir = TempDir::new().unwrap();
        let remote = ObjectStoreRemote::in_memory().unwrap();
        let src = temp_dir.path().join("src.bin");
        fs::write(&src, vec![7u8; 1024]).unwrap();

        assert_eq!(remote.upload_file("x/y.blob", &src).unwrap(), 1024);
        remote.put_bytes("x/z.blob", b"z".to_vec()).unwrap();

        let keys = remote.list_keys().unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains("x/y.blob"));
        assert!(keys.contains("x/z.blob"));
    }

    #[test]
    fn test_upload_large_file_in_parts() {
        let temp_dir = TempDir::new().unwrap();
        let remote = ObjectStoreRemote::local(&temp_dir.path().join("bucket")).unwrap();

        // Past the writer's buffer, so this goes up as a multipart upload
        let len = 11 * UPLOAD_CHUNK + 3;
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let src = temp_dir.path().join("big.bin");
        fs::write(&src, &data).unwrap();

        assert_eq!(remote.upload_file("big/one.blob", &src).unwrap(), len as u64);

        let dest = temp_dir.path().join("out");
        assert_eq!(remote.fetch_to_path("big/one.blob", &dest).unwrap(), len as u64);
        assert_eq!(fs::read(&dest).unwrap(), data);
    }

    #[test]
    fn test_uploaded_objects_carry_no_content_type() {
        use object_store::Attribute;

        let temp_dir = TempDir::new().unwrap();
        let remote = ObjectStoreRemote::in_memory().unwrap();
        let src = temp_dir.path().join("page.html");
        fs::write(&src, "<html></html>").unwrap();
        remote.upload_file("h/1.blob", &src).unwrap();

        let result = remote
            .runtime
            .block_on(remote.store.get(&ObjectPath::from("h/1.blob")))
            .unwrap();
        assert!(result.attributes.get(&Attribute::ContentType).is_none());
    }

    #[test]
    fn test_upload_missing_source() {
        let temp_dir = TempDir::new().unwrap();
        let remote = ObjectStoreRemote::in_memory().unwrap();
        assert!(remote
            .upload_file("a/b.blob", &temp_dir.path().join("absent"))
            .is_err());
        assert!(remote.list_keys().unwrap().is_empty());
    }

    #[test]
    fn test_local_filesystem_remote() {
        let temp_dir = TempDir::new().unwrap();
        let remote = ObjectStoreRemote::local(&temp_dir.path().join("bucket")).unwrap();
        remote.put_bytes("k/v.blob", b"payload".to_vec()).unwrap();
        assert!(temp_dir.path().join("bucket/k/v.blob").exists());

        let dest = temp_dir.path().join("out");
        remote.fetch_to_path("k/v.blob", &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
    }

    fn lookup(name: &str) -> Option<String> {
        match name {
            "aws_access_key_id" => Some("AKIAENV".to_string()),
            "aws_secret_access_key" => Some("env-secret".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_credentials_filled_from_lowercase_vars() {
        let settings = S3Settings {
            bucket: "blobs".to_string(),
            ..Default::default()
        }
        .with_credentials_from(lookup);
        assert_eq!(settings.access_key_id.as_deref(), Some("AKIAENV"));
        assert_eq!(settings.secret_access_key.as_deref(), Some("env-secret"));
    }

    #[test]
    fn test_explicit_credentials_not_overridden() {
        let settings = S3Settings {
            bucket: "blobs".to_string(),
            access_key_id: Some("AKIA".to_string()),
            secret_access_key: Some("shh".to_string()),
            ..Default::default()
        }
        .with_credentials_from(lookup);
        assert_eq!(settings.access_key_id.as_deref(), Some("AKIA"));
        assert_eq!(settings.secret_access_key.as_deref(), Some("shh"));
    }

    #[test]
    fn test_incomplete_env_pair_ignored() {
        let settings = S3Settings::default().with_credentials_from(|name| {
            (name == S3Settings::ACCESS_KEY_VAR).then(|| "AKIAENV".to_string())
        });
        assert!(settings.access_key_id.is_none());
        assert!(settings.secret_access_key.is_none());
    }

    #[test]
    #[cfg(not(feature = "s3"))]
    fn test_s3_requires_feature() {
        let settings = S3Settings {
            bucket: "blobs".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            ObjectStoreRemote::s3(&settings),
            Err(RemoteError::Config(_))
        ));
    }
}

//! Blobs archived out of primary storage stay readable through the tiered store.

use std::fs;
use std::process::Command;
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use tempfile::TempDir;
use tiered_blobs::{
    archive_blobs, ArchiveOptions, BlobKey, BlobStorage, CacheDirectory, FileBlobStorage,
    ObjectStoreRemote, TieredBlobStore,
};

fn store_aged(primary: &FileBlobStorage, key: BlobKey, data: &[u8]) {
    let path = primary.store_blob(&key, &mut &data[..]).unwrap();
    let week_ago = SystemTime::now() - Duration::from_secs(7 * 24 * 60 * 60);
    filetime::set_file_mtime(&path, FileTime::from_system_time(week_ago)).unwrap();
}

#[test]
fn test_destroyed_blobs_are_served_from_remote() {
    let temp_dir = TempDir::new().unwrap();
    let primary_dir = temp_dir.path().join("primary");
    let bucket_dir = temp_dir.path().join("remote/blobs");
    let key = BlobKey::new(0x1234, 0x5678);

    {
        let primary = FileBlobStorage::open(&primary_dir).unwrap();
        store_aged(&primary, key, b"cold data");
        let remote = ObjectStoreRemote::local(&bucket_dir).unwrap();
        let opts = ArchiveOptions {
            destroy: true,
            ..Default::default()
        };
        let summary = archive_blobs(&primary, &remote, &opts).unwrap();
        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.destroyed, 1);
    }

    let store = TieredBlobStore::new(
        FileBlobStorage::open(&primary_dir).unwrap(),
        CacheDirectory::open(temp_dir.path().join("cache")).unwrap(),
        ObjectStoreRemote::local(&bucket_dir).unwrap(),
        None,
    );
    assert!(!store.is_blob_local(&key).unwrap());

    let mut blob = store.open_committed_blob_file(&key, None).unwrap();
    assert_eq!(blob.read_all().unwrap(), b"cold data");
    store.close().unwrap();
}

#[test]
fn test_archive_cli() {
    let temp_dir = TempDir::new().unwrap();
    let primary_dir = temp_dir.path().join("primary");
    let primary = FileBlobStorage::open(&primary_dir).unwrap();
    store_aged(&primary, BlobKey::new(1, 1), b"one");
    store_aged(&primary, BlobKey::new(2, 1), &[0u8; 4096]);

    let output = Command::new(env!("CARGO_BIN_EXE_tiered-blobs"))
        .arg("archive")
        .arg(&primary_dir)
        .arg("blobs")
        .arg("--size")
        .arg("100")
        .arg("--remote-root")
        .arg(temp_dir.path().join("remote"))
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "archive failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["uploaded"], 1);
    assert_eq!(summary["skipped_too_small"], 1);
    assert!(temp_dir
        .path()
        .join("remote/blobs/0000000000000002/0000000000000001.blob")
        .exists());

    // Local copies kept without --destroy
    assert!(fs::metadata(primary.blob_path(&BlobKey::new(2, 1))).is_ok());
}

//! Unit tests for snapvault-blobstore

use std::{sync::Arc, thread};

use bytes::Bytes;
use test_case::test_case;

use crate::{BlobStore, BlobStoreError, FsBlobStore, MemoryBlobStore, is_temp_blob, validate_name};

fn stores() -> Vec<(Arc<dyn BlobStore>, Option<tempfile::TempDir>)> {
    let dir = tempfile::tempdir().unwrap();
    let fs = FsBlobStore::open(dir.path().join("repo")).unwrap();
    vec![
        (Arc::new(MemoryBlobStore::new()), None),
        (Arc::new(fs), Some(dir)),
    ]
}

// ============================================================================
// Name Validation
// ============================================================================

#[test_case("index-0", true)]
#[test_case("indices/abc/0/index-1", true)]
#[test_case("", false)]
#[test_case("/etc/passwd", false)]
#[test_case("../outside", false)]
#[test_case("indices/../../x", false)]
#[test_case("a//b", false)]
#[test_case("a\\b", false)]
#[test_case("dir/", false)]
fn name_validation(name: &str, valid: bool) {
    assert_eq!(validate_name(name).is_ok(), valid);
}

#[test]
fn temp_blob_detection_uses_last_segment() {
    assert!(is_temp_blob(".tmp-abc"));
    assert!(is_temp_blob("indices/x/.tmp-abc"));
    assert!(!is_temp_blob(".tmp-dir/index-0"));
}

// ============================================================================
// Contract Tests (run against every implementation)
// ============================================================================

#[test]
fn put_get_delete() {
    for (store, _dir) in stores() {
        store.put("a/b", Bytes::from_static(b"hello"), false).unwrap();
        assert_eq!(store.get("a/b").unwrap(), Bytes::from_static(b"hello"));
        assert!(store.exists("a/b").unwrap());
        assert_eq!(store.size("a/b").unwrap(), 5);

        store.delete("a/b").unwrap();
        assert!(!store.exists("a/b").unwrap());
        assert!(matches!(store.get("a/b"), Err(BlobStoreError::NotFound { .. })));

        // Deleting again is fine.
        store.delete("a/b").unwrap();
    }
}

#[test]
fn create_if_absent_rejects_existing() {
    for (store, _dir) in stores() {
        store.put("index-0", Bytes::from_static(b"one"), true).unwrap();
        let err = store.put("index-0", Bytes::from_static(b"two"), true).unwrap_err();
        assert!(matches!(err, BlobStoreError::AlreadyExists { .. }));
        assert_eq!(store.get("index-0").unwrap(), Bytes::from_static(b"one"));

        // Plain put overwrites.
        store.put("index-0", Bytes::from_static(b"three"), false).unwrap();
        assert_eq!(store.get("index-0").unwrap(), Bytes::from_static(b"three"));
    }
}

#[test]
fn list_filters_by_full_name_prefix() {
    for (store, _dir) in stores() {
        for name in ["index-0", "index-1", "index.latest", "indices/i1/0/index-x", "snap-a.dat"] {
            store.put(name, Bytes::from_static(b"x"), false).unwrap();
        }

        assert_eq!(store.list("index-").unwrap(), vec!["index-0", "index-1"]);
        assert_eq!(store.list("indices/").unwrap(), vec!["indices/i1/0/index-x"]);
        assert_eq!(store.list("").unwrap().len(), 5);
        assert!(store.list("missing/").unwrap().is_empty());
    }
}

#[test]
fn concurrent_creates_have_single_winner() {
    for (store, _dir) in stores() {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.put("index-5", Bytes::from(vec![i]), true).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}

// ============================================================================
// Filesystem Specifics
// ============================================================================

#[test]
fn fs_delete_prunes_empty_directories() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsBlobStore::open(dir.path()).unwrap();
    store
        .put("indices/i1/0/__data", Bytes::from_static(b"d"), false)
        .unwrap();
    store.delete("indices/i1/0/__data").unwrap();

    assert!(!store.root().join("indices").exists());
    assert!(store.root().exists());
}

#[test]
fn fs_rejects_traversal() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsBlobStore::open(dir.path()).unwrap();
    let err = store
        .put("../escape", Bytes::from_static(b"x"), false)
        .unwrap_err();
    assert!(matches!(err, BlobStoreError::InvalidName { .. }));
}

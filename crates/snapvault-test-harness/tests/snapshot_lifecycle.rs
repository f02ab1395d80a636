//! End-to-end snapshot lifecycle against real filesystem repositories.

use std::collections::BTreeMap;

use anyhow::Result;
use snapvault_blobstore::{BlobStore, FsBlobStore};
use snapvault_repository::{LOCATION_SETTING, READONLY_SETTING, RepositoryError};
use snapvault_snapshots::{FS_TYPE, SnapshotError};
use snapvault_test_harness::{HarnessError, SnapshotTestHarness, init_test_logging};
use snapvault_types::{Settings, SnapshotState, Version};

fn start(data_nodes: usize) -> Result<SnapshotTestHarness> {
    init_test_logging();
    Ok(SnapshotTestHarness::start(data_nodes)?.with_seed(7))
}

#[test]
fn snapshot_then_delete_leaves_no_index_data() -> Result<()> {
    let harness = start(1)?;
    let location = harness.create_repository("repo", FS_TYPE)?;
    harness.create_index_with_random_docs("idx", 1, 5)?;

    let info = harness.create_full_snapshot("repo", "s1")?;
    assert_eq!(info.state, SnapshotState::Success);
    assert_eq!(info.total_shards, 1);
    assert_eq!(harness.get_repository_data("repo")?.snapshot_count(), 1);

    let deleted = harness.delete_snapshot("repo", "s1")?;
    assert_eq!(deleted, vec![info.snapshot_id.clone()]);
    harness.assert_repo_consistency("repo")?;

    let store = FsBlobStore::open(&location)?;
    assert!(store.list("indices/")?.is_empty());
    assert_eq!(harness.get_repository_data("repo")?.snapshot_count(), 0);
    harness.finish()?;
    Ok(())
}

#[test]
fn generation_increases_with_every_change() -> Result<()> {
    let harness = start(2)?;
    harness.create_repository("repo", FS_TYPE)?;
    harness.create_index_with_random_docs("logs", 2, 30)?;

    let mut last = harness.repository_generation("repo");
    for name in ["a", "b", "c"] {
        harness.index_random_docs("logs", 10)?;
        harness.create_full_snapshot("repo", name)?;
        let generation = harness.repository_generation("repo");
        assert!(generation > last, "{generation} after {last}");
        last = generation;
    }
    harness.delete_snapshot("repo", "b")?;
    assert!(harness.repository_generation("repo") > last);

    let names: Vec<String> = harness
        .get_repository_data("repo")?
        .snapshot_ids()
        .map(|id| id.name().to_string())
        .collect();
    assert_eq!(names.len(), 2);
    assert!(!names.contains(&"b".to_string()));
    harness.finish()?;
    Ok(())
}

#[test]
fn unchanged_shards_share_data_blobs() -> Result<()> {
    let harness = start(1)?;
    let location = harness.create_repository("repo", FS_TYPE)?;
    harness.create_index_with_random_docs("idx", 1, 20)?;

    harness.create_full_snapshot("repo", "first")?;
    let after_first = SnapshotTestHarness::number_of_files(&location)?;
    harness.create_full_snapshot("repo", "second")?;
    let after_second = SnapshotTestHarness::number_of_files(&location)?;

    // New shard snapshot, shard generation, snap and global metadata blobs;
    // no data blobs and the replaced shard generation is removed.
    assert!(after_second > after_first);
    assert!(after_second - after_first <= 4, "{after_first} -> {after_second}");
    harness.finish()?;
    Ok(())
}

#[test]
fn cleanup_removes_stray_blobs() -> Result<()> {
    let harness = start(1)?;
    let location = harness.create_repository("repo", FS_TYPE)?;
    harness.create_index_with_content("idx")?;
    harness.create_full_snapshot("repo", "snap")?;

    let store = FsBlobStore::open(&location)?;
    store.put("indices/stray-index/0/__leftover", bytes::Bytes::from_static(b"junk"), false)?;

    let cleaned = harness.cluster().cleanup_repository("repo")?;
    assert!(cleaned.blobs >= 1, "{cleaned:?}");
    assert!(!store.exists("indices/stray-index/0/__leftover")?);
    harness.assert_repo_consistency("repo")?;
    harness.finish()?;
    Ok(())
}

#[test]
fn delete_from_untracked_repository_is_rejected() -> Result<()> {
    let harness = start(1)?;
    let location = harness.create_repository("repo", FS_TYPE)?;
    harness.create_index_with_content("idx")?;
    harness.create_full_snapshot("repo", "s1")?;

    let settings = Settings::builder().put(LOCATION_SETTING, location.display()).build();
    harness.cluster().put_repository("other", FS_TYPE, settings, false)?;
    assert_eq!(harness.get_repository_data("other")?.snapshot_count(), 1);
    assert!(!harness.repository_generation("other").is_known());

    let err = harness.delete_snapshot("other", "s1").unwrap_err();
    assert!(
        matches!(
            err,
            HarnessError::Snapshot(SnapshotError::Repository(RepositoryError::IllegalRepositoryState { .. }))
        ),
        "{err}"
    );
    assert!(!harness.repository_generation("other").is_known());
    assert!(harness.state().deletions().is_empty());
    assert_eq!(harness.get_repository_data("repo")?.snapshot_count(), 1);

    harness.cluster().delete_repository("other")?;
    harness.finish()?;
    Ok(())
}

#[test]
fn readonly_repository_rejects_writes() -> Result<()> {
    let harness = start(1)?;
    let location = harness.create_repository("repo", FS_TYPE)?;
    harness.create_index_with_content("idx")?;
    harness.create_full_snapshot("repo", "snap")?;

    let settings = Settings::builder()
        .put(LOCATION_SETTING, location.display())
        .put(READONLY_SETTING, true)
        .build();
    harness.cluster().put_repository("ro", FS_TYPE, settings, false)?;

    let data = harness.get_repository_data("ro")?;
    assert_eq!(data.snapshot_count(), 1);
    assert_eq!(harness.get_snapshot("ro", "snap")?.state, SnapshotState::Success);

    let err = harness.start_full_snapshot("ro", "other", false).unwrap_err();
    assert!(matches!(err, HarnessError::Snapshot(_)), "{err}");
    let err = harness.delete_snapshot("ro", "snap").unwrap_err();
    assert!(matches!(err, HarnessError::Snapshot(SnapshotError::Repository(_))), "{err}");

    harness.cluster().delete_repository("ro")?;
    harness.finish()?;
    Ok(())
}

#[test]
fn injected_failed_snapshot_is_listed_and_deletable() -> Result<()> {
    let harness = start(1)?;
    harness.create_repository("repo", FS_TYPE)?;
    assert!(!harness.repository_generation("repo").is_known());

    let metadata = BTreeMap::from([("reason".to_string(), "test".to_string())]);
    let snapshot = harness.bwc().add_failed_snapshot("repo", "broken", metadata.clone())?;
    assert!(harness.repository_generation("repo").is_known());

    let info = harness.get_snapshot("repo", "broken")?;
    assert_eq!(info.snapshot_id, snapshot);
    assert_eq!(info.state, SnapshotState::Failed);
    assert_eq!(info.version, Version::OLD_SNAPSHOT_FORMAT);
    assert_eq!(info.user_metadata, metadata);

    let err = harness
        .bwc()
        .add_failed_snapshot("repo", "again", BTreeMap::new())
        .unwrap_err();
    assert!(matches!(err, HarnessError::IllegalState(_)), "{err}");

    harness.delete_snapshot("repo", "broken")?;
    assert_eq!(harness.get_repository_data("repo")?.snapshot_count(), 0);
    harness.finish()?;
    Ok(())
}

#[test]
fn file_counts_follow_repository_contents() -> Result<()> {
    let harness = start(1)?;
    let location = harness.create_repository("repo", FS_TYPE)?;
    harness.create_index_with_content("idx")?;
    harness.create_full_snapshot("repo", "snap")?;
    let count = SnapshotTestHarness::number_of_files(&location)?;
    assert!(count > 0);

    SnapshotTestHarness::assert_file_count(&location, count)?;
    let err = SnapshotTestHarness::assert_file_count(&location, count + 1).unwrap_err();
    assert!(matches!(err, HarnessError::IllegalState(_)), "{err}");
    harness.finish()?;
    Ok(())
}

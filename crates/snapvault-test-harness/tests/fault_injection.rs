//! Snapshots and deletions against the fault-injecting `mock` repository.

use std::time::Duration;

use anyhow::Result;
use snapvault_blobstore::{BlobStore, FsBlobStore};
use snapvault_repository::{Faultable, paths};
use snapvault_snapshots::SnapshotError;
use snapvault_test_harness::{
    MOCK_TYPE, RANDOM_DATA_FILE_IO_EXCEPTION_RATE, SEED_SETTING, SnapshotTestHarness, init_test_logging,
    is_injected,
};
use snapvault_types::{Settings, SnapshotState};
use test_case::test_case;

const TIMEOUT: Duration = Duration::from_secs(30);

fn start(data_nodes: usize) -> Result<SnapshotTestHarness> {
    init_test_logging();
    let harness = SnapshotTestHarness::start(data_nodes)?.with_seed(11);
    harness.create_repository("repo", MOCK_TYPE)?;
    Ok(harness)
}

#[test]
fn blocked_root_write_delays_publication() -> Result<()> {
    let harness = start(1)?;
    let location = harness.repo_path("repo");
    harness.create_index_with_random_docs("idx", 1, 10)?;
    harness.create_full_snapshot("repo", "snap-1")?;
    let before = harness.repository_generation("repo");

    let master = harness.block_master_on_write_index_file("repo")?;
    harness.index_random_docs("idx", 10)?;
    let future = harness.start_full_snapshot("repo", "snap-2", false)?;
    harness.wait_for_block(&master, "repo")?;

    assert!(harness.is_blocked(&master, "repo")?);
    assert_eq!(harness.repository_generation("repo"), before);
    let store = FsBlobStore::open(&location)?;
    assert!(!store.exists(&paths::root_index_blob(before.next()))?);
    assert_eq!(harness.state().snapshots().len(), 1);

    harness.unblock_node("repo", &master)?;
    let info = future.wait(TIMEOUT)?;
    assert_eq!(info.state, SnapshotState::Success);
    assert!(harness.repository_generation("repo") > before);
    harness.finish()?;
    Ok(())
}

#[test_case(true ; "on the root index blob")]
#[test_case(false ; "on the snapshot info blob")]
fn failed_finalization_fails_only_that_snapshot(on_index_file: bool) -> Result<()> {
    let harness = start(1)?;
    harness.create_index_with_random_docs("idx", 1, 10)?;
    harness.create_full_snapshot("repo", "before")?;

    let master = if on_index_file {
        harness.block_master_from_finalizing_snapshot_on_index_file("repo")?
    } else {
        harness.block_master_from_finalizing_snapshot_on_snap_file("repo")?
    };
    harness.index_random_docs("idx", 5)?;
    let future = harness.start_full_snapshot("repo", "doomed", false)?;
    harness.wait_for_block(&master, "repo")?;
    harness.unblock_node("repo", &master)?;

    let err = future.wait(TIMEOUT).unwrap_err();
    assert!(err.io_source().is_some_and(is_injected), "{err}");
    harness.await_no_more_running_operations()?;
    assert!(harness.get_snapshot("repo", "doomed").is_err());

    harness.create_full_snapshot("repo", "after")?;
    let data = harness.get_repository_data("repo")?;
    assert_eq!(data.snapshot_count(), 2);
    assert!(harness.failure_count("repo") >= 1);
    harness.finish()?;
    Ok(())
}

#[test]
fn blocked_data_node_holds_snapshot_in_progress() -> Result<()> {
    let harness = start(1)?;
    let node = harness.data_node_names().remove(0);
    harness.create_index_with_random_docs("idx", 1, 10)?;

    let future = harness.start_full_snapshot_blocked_on_data_node("repo", "snap", &node)?;
    let info = harness.get_snapshot("repo", "snap")?;
    assert_eq!(info.state, SnapshotState::InProgress);
    harness.await_number_of_snapshots_in_progress(1)?;
    assert!(!future.is_done());

    harness.unblock_node("repo", &node)?;
    assert_eq!(future.wait(TIMEOUT)?.state, SnapshotState::Success);
    harness.await_number_of_snapshots_in_progress(0)?;
    harness.finish()?;
    Ok(())
}

#[test]
fn block_node_with_index_finds_shard_owner() -> Result<()> {
    let harness = start(2)?;
    harness.create_index_with_random_docs("idx", 1, 10)?;

    let node = harness.block_node_with_index("repo", "idx")?;
    let future = harness.start_full_snapshot("repo", "snap", false)?;
    assert_eq!(harness.wait_for_block_on_any_data_node("repo")?, node);

    harness.unblock_all_data_nodes("repo")?;
    assert_eq!(future.wait(TIMEOUT)?.state, SnapshotState::Success);
    harness.finish()?;
    Ok(())
}

#[test]
fn blocked_stale_generation_delete_after_publication() -> Result<()> {
    let harness = start(1)?;
    harness.create_index_with_random_docs("idx", 1, 10)?;
    harness.create_full_snapshot("repo", "snap-1")?;
    harness.index_random_docs("idx", 10)?;
    harness.create_full_snapshot("repo", "snap-2")?;
    let before = harness.repository_generation("repo");

    let master = harness.block_master_from_deleting_index_n_file("repo")?;
    let deletion = harness.start_delete_snapshot("repo", "snap-1")?;
    harness.wait_for_block(&master, "repo")?;

    assert_eq!(harness.repository_generation("repo"), before.next());
    assert!(!deletion.is_done());

    harness.unblock_node("repo", &master)?;
    assert_eq!(deletion.wait(TIMEOUT)?.len(), 1);
    harness.await_master_finish_repo_operations()?;
    harness.finish()?;
    Ok(())
}

#[test]
fn random_data_failures_never_corrupt_the_repository() -> Result<()> {
    init_test_logging();
    let harness = SnapshotTestHarness::start(2)?.with_seed(3);
    harness.create_repository_with(
        "repo",
        MOCK_TYPE,
        Settings::builder()
            .put(RANDOM_DATA_FILE_IO_EXCEPTION_RATE, 0.5)
            .put(SEED_SETTING, 42)
            .build(),
    )?;
    harness.create_index("idx", 4)?;

    for round in 0..5 {
        harness.index_random_docs("idx", 40)?;
        let info = harness.cluster().create_snapshot(
            snapvault_snapshots::CreateSnapshotRequest::new("repo", format!("snap-{round}")).with_partial(true),
        )?;
        assert_ne!(info.state, SnapshotState::InProgress);
        assert_eq!(info.total_shards, 4);
        assert_eq!(info.successful_shards as usize + info.shard_failures.len(), 4);
    }

    assert!(harness.failure_count("repo") > 0);
    assert_eq!(harness.get_repository_data("repo")?.snapshot_count(), 5);
    harness.finish()?;
    Ok(())
}

#[test]
fn reads_fail_after_unblock_when_requested() -> Result<()> {
    let harness = start(1)?;
    let node = harness.data_node_names().remove(0);
    harness.create_index_with_random_docs("idx", 1, 10)?;

    let future = harness.start_full_snapshot_blocked_on_data_node("repo", "first", &node)?;
    harness.fail_reads_all_data_nodes("repo")?;
    harness.unblock_all_data_nodes("repo")?;
    assert_eq!(future.wait(TIMEOUT)?.state, SnapshotState::Success);

    harness.index_random_docs("idx", 10)?;
    let info = harness.cluster().create_snapshot(
        snapvault_snapshots::CreateSnapshotRequest::new("repo", "second").with_partial(true),
    )?;
    assert_eq!(info.state, SnapshotState::Failed);
    assert_eq!(info.shard_failures.len(), 1);

    harness.with_faultable(&node, "repo", |f| f.set_fail_reads_after_unblock(false))?;
    harness.finish()?;
    Ok(())
}

#[test]
fn unknown_node_is_not_faultable() -> Result<()> {
    let harness = start(1)?;
    let err = harness.block_data_node("repo", "data-9").unwrap_err();
    assert!(
        matches!(
            err,
            snapvault_test_harness::HarnessError::Snapshot(SnapshotError::NodeMissing { .. })
        ),
        "{err}"
    );
    harness.finish()?;
    Ok(())
}

//! Concurrent snapshots and deletions on one repository.

use std::time::Duration;

use anyhow::Result;
use snapvault_snapshots::SnapshotError;
use snapvault_test_harness::{MOCK_TYPE, SnapshotTestHarness, init_test_logging};
use snapvault_types::SnapshotState;

const TIMEOUT: Duration = Duration::from_secs(30);

fn start(data_nodes: usize) -> Result<SnapshotTestHarness> {
    init_test_logging();
    let harness = SnapshotTestHarness::start(data_nodes)?.with_seed(5);
    harness.create_repository("repo", MOCK_TYPE)?;
    Ok(harness)
}

#[test]
fn concurrent_snapshots_all_succeed() -> Result<()> {
    let harness = start(2)?;
    harness.create_index_with_random_docs("idx", 3, 60)?;
    let before = harness.repository_generation("repo");

    let names = harness.create_n_snapshots("repo", 5)?;

    let data = harness.get_repository_data("repo")?;
    assert_eq!(data.snapshot_count(), 5);
    for name in &names {
        assert!(data.snapshot_by_name(name).is_some(), "{name} missing");
    }
    assert!(harness.repository_generation("repo") > before);
    harness.await_no_more_running_operations()?;
    harness.finish()?;
    Ok(())
}

#[test]
fn queued_snapshots_wait_for_the_blocked_shard() -> Result<()> {
    let harness = start(1)?;
    let node = harness.data_node_names().remove(0);
    harness.create_index_with_random_docs("idx", 1, 10)?;

    let first = harness.start_full_snapshot_blocked_on_data_node("repo", "first", &node)?;
    let second = harness.start_full_snapshot("repo", "second", false)?;
    harness.await_number_of_snapshots_in_progress(2)?;
    assert!(!second.is_done());

    harness.unblock_node("repo", &node)?;
    assert_eq!(first.wait(TIMEOUT)?.state, SnapshotState::Success);
    assert_eq!(second.wait(TIMEOUT)?.state, SnapshotState::Success);
    assert_eq!(harness.get_repository_data("repo")?.snapshot_count(), 2);
    harness.finish()?;
    Ok(())
}

#[test]
fn deleting_a_running_snapshot_aborts_it() -> Result<()> {
    let harness = start(1)?;
    let node = harness.data_node_names().remove(0);
    harness.create_index_with_random_docs("idx", 1, 10)?;
    harness.create_full_snapshot("repo", "kept")?;
    harness.index_random_docs("idx", 10)?;

    let running = harness.start_full_snapshot_blocked_on_data_node("repo", "running", &node)?;
    let deletion = harness.start_delete_snapshot("repo", "running")?;
    harness.await_n_deletions_in_progress(1)?;
    assert!(!deletion.is_done());

    harness.unblock_node("repo", &node)?;
    let err = running.wait(TIMEOUT).unwrap_err();
    assert!(matches!(err, SnapshotError::Aborted { .. }), "{err}");
    assert!(deletion.wait(TIMEOUT)?.is_empty());

    harness.await_no_more_running_operations()?;
    let data = harness.get_repository_data("repo")?;
    assert_eq!(data.snapshot_count(), 1);
    assert!(data.snapshot_by_name("kept").is_some());
    harness.finish()?;
    Ok(())
}

#[test]
fn snapshots_wait_for_running_deletion() -> Result<()> {
    let harness = start(1)?;
    harness.create_index_with_random_docs("idx", 1, 10)?;
    harness.create_full_snapshot("repo", "old")?;
    harness.index_random_docs("idx", 10)?;
    harness.create_full_snapshot("repo", "new")?;

    let master = harness.block_master_on_write_index_file("repo")?;
    let deletion = harness.start_delete_snapshot("repo", "old")?;
    harness.wait_for_block(&master, "repo")?;

    let err = harness.start_full_snapshot("repo", "during", false).unwrap_err();
    assert!(
        matches!(
            err,
            snapvault_test_harness::HarnessError::Snapshot(SnapshotError::ConcurrentSnapshotExecution { .. })
        ),
        "{err}"
    );

    harness.unblock_node("repo", &master)?;
    assert_eq!(deletion.wait(TIMEOUT)?.len(), 1);
    harness.await_master_finish_repo_operations()?;
    harness.create_full_snapshot("repo", "after")?;
    harness.finish()?;
    Ok(())
}

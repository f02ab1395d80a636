//! Repositories that an older release wrote first.

use std::path::Path;

use anyhow::Result;
use snapvault_snapshots::FS_TYPE;
use snapvault_test_harness::{OLD_VERSION_SNAPSHOT_PREFIX, SnapshotTestHarness, init_test_logging};
use snapvault_types::{SnapshotState, Version};
use test_case::test_case;

fn start() -> Result<SnapshotTestHarness> {
    init_test_logging();
    let harness = SnapshotTestHarness::start(1)?.with_seed(17);
    harness.create_repository("repo", FS_TYPE)?;
    harness.create_index_with_random_docs("idx", 2, 20)?;
    Ok(harness)
}

/// Shard generation blobs named `index-<n>` under the repository's indices.
fn numeric_shard_generations(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            count += numeric_shard_generations(&entry.path())?;
        } else if name
            .strip_prefix("index-")
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        {
            count += 1;
        }
    }
    Ok(count)
}

#[test_case(Version::V_7_5_0, true ; "before shard generations")]
#[test_case(Version::V_7_9_0, false ; "with shard generations")]
fn snapshots_after_old_release(version: Version, numeric: bool) -> Result<()> {
    let harness = start()?;
    let location = harness.repo_path("repo");

    let old = harness.init_with_snapshot_version("repo", version)?;
    assert_eq!(old.version, version);
    assert_eq!(old.total_shards, 0);
    assert!(old.snapshot_id.name().starts_with(OLD_VERSION_SNAPSHOT_PREFIX));
    assert_eq!(old.snapshot_id.name(), format!("old-version-snapshot-{}", version.id()));

    let info = harness.create_full_snapshot("repo", "current")?;
    assert_eq!(info.state, SnapshotState::Success);
    assert_eq!(harness.get_repository_data("repo")?.snapshot_count(), 2);
    assert_eq!(harness.get_snapshot("repo", old.snapshot_id.name())?.version, version);

    let shard_generations = numeric_shard_generations(&location.join("indices"))?;
    assert_eq!(shard_generations > 0, numeric, "{shard_generations} numeric shard generations");
    harness.finish()?;
    Ok(())
}

#[test]
fn old_format_snapshot_is_removed_before_consistency_check() -> Result<()> {
    let harness = start()?;
    let old = harness.init_with_snapshot_version("repo", Version::V_7_6_0)?;
    harness.create_full_snapshot("repo", "current")?;

    harness.assert_repo_consistency("repo")?;
    let data = harness.get_repository_data("repo")?;
    assert!(!data.contains(&old.snapshot_id));
    assert_eq!(data.snapshot_count(), 1);
    harness.finish()?;
    Ok(())
}

#[test]
fn init_requires_empty_repository() -> Result<()> {
    let harness = start()?;
    harness.create_full_snapshot("repo", "existing")?;

    assert!(harness.init_with_snapshot_version("repo", Version::V_7_5_0).is_err());
    harness.finish()?;
    Ok(())
}

#[test]
fn repository_data_reads_back_in_old_format() -> Result<()> {
    let harness = start()?;
    harness.create_full_snapshot("repo", "one")?;
    harness.index_random_docs("idx", 10)?;
    harness.create_full_snapshot("repo", "two")?;

    let current = harness.get_repository_data("repo")?;
    for version in [Version::V_7_5_0, Version::V_7_9_0, Version::CURRENT] {
        let data = harness.get_repository_data_in_format("repo", version)?;
        assert_eq!(data.snapshot_count(), current.snapshot_count(), "{version}");
        assert_eq!(data.gen_id(), current.gen_id());
        for id in current.snapshot_ids() {
            assert!(data.contains(id), "{version} lost {id}");
            assert_eq!(data.version(id), current.version(id));
        }
    }
    harness.finish()?;
    Ok(())
}

#[test]
fn maybe_init_picks_an_old_release_or_nothing() -> Result<()> {
    let harness = start()?;
    let picked = harness.maybe_init_with_old_snapshot_version("repo")?;
    let expected = usize::from(picked.is_some());
    assert_eq!(harness.get_repository_data("repo")?.snapshot_count(), expected);

    harness.create_full_snapshot("repo", "current")?;
    harness.finish()?;
    Ok(())
}

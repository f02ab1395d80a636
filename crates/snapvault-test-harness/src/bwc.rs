//! Simulating repositories written by older releases.
//!
//! Nothing here goes through the snapshot state machine's normal checks.
//! [`BwcBackdoor::add_failed_snapshot`] commits a snapshot straight through
//! the repository, and [`SnapshotTestHarness::init_with_snapshot_version`]
//! rewrites committed metadata in an older format.

use std::collections::BTreeMap;

use snapvault_repository::{
    COMPRESS_SETTING, FinalizeSnapshot, Repository, RepositoryError, ShardGenerations, SnapshotInfo,
    SnapshotMetadata,
    format::{Codec, INDEX_N_FORMAT, SNAPSHOT_FORMAT},
    paths,
};
use snapvault_snapshots::CreateSnapshotRequest;
use snapvault_types::{SnapshotId, SnapshotState, Version};
use tracing::info;

use crate::{HarnessError, OLD_VERSION_SNAPSHOT_PREFIX, Result, SnapshotTestHarness};

/// Releases whose format [`SnapshotTestHarness::maybe_init_with_old_snapshot_version`]
/// picks from.
const OLD_FORMATS: [Version; 4] = [Version::V_7_5_0, Version::V_7_6_0, Version::V_7_9_0, Version::V_7_12_0];

/// Index pattern that matches nothing, for zero-shard snapshots.
const NO_INDICES: &str = "does-not-exist-for-sure-*";

/// Test-only writes that bypass snapshot orchestration.
#[derive(Debug, Clone, Copy)]
pub struct BwcBackdoor<'a> {
    harness: &'a SnapshotTestHarness,
}

impl SnapshotTestHarness {
    pub fn bwc(&self) -> BwcBackdoor<'_> {
        BwcBackdoor { harness: self }
    }
}

impl BwcBackdoor<'_> {
    /// Commits a `FAILED` snapshot in the old snapshot format directly
    /// through the master's repository instance.
    ///
    /// Only allowed while cluster state tracks no generation for the
    /// repository, i.e. before anything else used it.
    pub fn add_failed_snapshot(
        &self,
        repository: &str,
        name: &str,
        user_metadata: BTreeMap<String, String>,
    ) -> Result<SnapshotId> {
        let generation = self.harness.repository_generation(repository);
        if generation.is_known() {
            return Err(HarnessError::IllegalState(format!(
                "cannot inject a snapshot into [{repository}]: generation {generation} is already tracked"
            )));
        }

        let target = self.harness.cluster().repository(repository)?;
        let data = target.repository_data()?;
        let snapshot = SnapshotId::random(name);
        info!(repository, snapshot = %snapshot, "adding old format FAILED snapshot");
        target.finalize_snapshot(FinalizeSnapshot {
            shard_generations: ShardGenerations::empty(),
            repository_state_id: data.gen_id(),
            metadata: SnapshotMetadata::default(),
            snapshot_info: SnapshotInfo {
                snapshot_id: snapshot.clone(),
                indices: Vec::new(),
                state: SnapshotState::Failed,
                reason: Some("failed on purpose".to_string()),
                version: Version::OLD_SNAPSHOT_FORMAT,
                start_time: 0,
                end_time: 0,
                total_shards: 0,
                successful_shards: 0,
                shard_failures: Vec::new(),
                include_global_state: self.harness.random_bool(),
                user_metadata,
            },
            version: Version::OLD_SNAPSHOT_FORMAT,
        })?;
        Ok(snapshot)
    }
}

impl SnapshotTestHarness {
    /// Makes an empty repository look as if `version` last wrote it: takes
    /// a zero-shard snapshot, then rewrites the root metadata and the
    /// snapshot's info in `version`'s format.
    pub fn init_with_snapshot_version(&self, repository: &str, version: Version) -> Result<SnapshotInfo> {
        if self.get_repository_data(repository)?.snapshot_count() > 0 {
            return Err(HarnessError::IllegalState(format!(
                "[{repository}] must be empty to simulate an old release"
            )));
        }

        let name = format!("{OLD_VERSION_SNAPSHOT_PREFIX}{}", version.id());
        let created = self
            .cluster()
            .create_snapshot(CreateSnapshotRequest::new(repository, &name).with_indices([NO_INDICES]))?;
        if created.state != SnapshotState::Success {
            return Err(HarnessError::IllegalState(format!(
                "[{repository}:{name}] ended {}",
                created.state
            )));
        }

        let target = self.cluster().repository(repository)?;
        let codec = Codec::from_compress(
            target
                .settings()
                .get_bool(COMPRESS_SETTING, self.cluster().config().repository.compress)
                .map_err(RepositoryError::from)?,
        );
        let store = self.raw_store(repository)?;
        let data = target.repository_data()?;

        let body = String::from_utf8_lossy(&data.snapshots_to_json(version)?)
            .replace(&Version::CURRENT.to_string(), &version.to_string());
        store.put(
            &paths::root_index_blob(data.gen_id()),
            INDEX_N_FORMAT.encode(body.as_bytes(), codec),
            false,
        )?;

        let downgraded = SnapshotInfo {
            version,
            ..target.snapshot_info(&created.snapshot_id)?
        };
        store.put(
            &paths::snapshot_blob(created.snapshot_id.uuid()),
            SNAPSHOT_FORMAT.encode(&downgraded.to_json()?, codec),
            false,
        )?;

        for node in self.cluster().nodes() {
            for instance in node.repositories().existing() {
                if instance.name() == repository {
                    instance.invalidate_cache();
                }
            }
        }
        info!(repository, %version, generation = %data.gen_id(), "rewrote repository in old format");
        Ok(downgraded)
    }

    /// With probability 1/4, runs [`Self::init_with_snapshot_version`] with
    /// a random old release. Returns the release picked, if any.
    pub fn maybe_init_with_old_snapshot_version(&self, repository: &str) -> Result<Option<Version>> {
        if !(self.random_bool() && self.random_bool()) {
            return Ok(None);
        }
        let version = OLD_FORMATS[self.random_index(OLD_FORMATS.len())];
        self.init_with_snapshot_version(repository, version)?;
        Ok(Some(version))
    }
}

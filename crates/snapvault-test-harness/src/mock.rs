//! The `mock` repository type: an `fs` repository whose blob operations
//! can be paused and failed.

use std::sync::Arc;

use snapvault_blobstore::{BlobStore, FsBlobStore};
use snapvault_repository::{
    BlobStoreRepository, CleanupResult, Faultable, FinalizeSnapshot, LOCATION_SETTING, Repository, RepositoryData,
    ShardSnapshotRequest, SnapshotInfo,
};
use snapvault_snapshots::{FS_TYPE, FsRepositoryFactory, RepositoryContext, RepositoryFactory, RepositoryTypes};
use snapvault_types::{RepoGen, Settings, ShardGeneration, SnapshotId};

use crate::{FaultInjectingBlobStore, FaultInjector, RandomFailures};

/// Repository type name of [`MockRepository`].
pub const MOCK_TYPE: &str = "mock";

/// Failure rate of metadata blob reads and writes, between 0 and 1.
pub const RANDOM_CONTROL_IO_EXCEPTION_RATE: &str = "random_control_io_exception_rate";

/// Failure rate of shard data blob reads and writes, between 0 and 1.
pub const RANDOM_DATA_FILE_IO_EXCEPTION_RATE: &str = "random_data_file_io_exception_rate";

/// Seed of the random failures. Each node derives its own stream from it.
pub const SEED_SETTING: &str = "seed";

/// Registry with the `fs` and `mock` repository types.
pub fn test_repository_types() -> RepositoryTypes {
    RepositoryTypes::empty()
        .with(FS_TYPE, Arc::new(FsRepositoryFactory))
        .with(MOCK_TYPE, Arc::new(MockRepositoryFactory))
}

/// A blob store repository with fault injection.
#[derive(Debug)]
pub struct MockRepository {
    inner: BlobStoreRepository,
    injector: Arc<FaultInjector>,
}

impl MockRepository {
    pub fn injector(&self) -> &Arc<FaultInjector> {
        &self.injector
    }
}

impl Repository for MockRepository {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn repo_type(&self) -> &str {
        self.inner.repo_type()
    }

    fn settings(&self) -> &Settings {
        self.inner.settings()
    }

    fn is_readonly(&self) -> bool {
        self.inner.is_readonly()
    }

    fn repository_data(&self) -> snapvault_repository::Result<Arc<RepositoryData>> {
        self.inner.repository_data()
    }

    fn finalize_snapshot(&self, request: FinalizeSnapshot) -> snapvault_repository::Result<Arc<RepositoryData>> {
        self.inner.finalize_snapshot(request)
    }

    fn delete_snapshots(
        &self,
        snapshots: &[SnapshotId],
        expected: RepoGen,
    ) -> snapvault_repository::Result<Arc<RepositoryData>> {
        self.inner.delete_snapshots(snapshots, expected)
    }

    fn snapshot_shard(
        &self,
        request: ShardSnapshotRequest,
        aborted: &dyn Fn() -> bool,
    ) -> snapvault_repository::Result<ShardGeneration> {
        self.inner.snapshot_shard(request, aborted)
    }

    fn snapshot_info(&self, snapshot: &SnapshotId) -> snapvault_repository::Result<SnapshotInfo> {
        self.inner.snapshot_info(snapshot)
    }

    fn cleanup(&self) -> snapvault_repository::Result<CleanupResult> {
        self.inner.cleanup()
    }

    fn start_verification(&self) -> snapvault_repository::Result<Option<String>> {
        self.inner.start_verification()
    }

    fn verify(&self, seed: &str, node: &str) -> snapvault_repository::Result<()> {
        self.inner.verify(seed, node)
    }

    fn end_verification(&self, seed: &str) -> snapvault_repository::Result<()> {
        self.inner.end_verification(seed)
    }

    fn blob_store(&self) -> Arc<dyn BlobStore> {
        self.inner.blob_store()
    }

    fn invalidate_cache(&self) {
        self.inner.invalidate_cache();
    }

    fn as_faultable(&self) -> Option<&dyn Faultable> {
        Some(self.injector.as_ref())
    }

    /// Fails every blocked and future blob operation of this instance.
    fn close(&self) {
        self.injector.close();
    }
}

/// Builds [`MockRepository`] instances.
#[derive(Debug, Default)]
pub struct MockRepositoryFactory;

fn node_seed(seed: u64, node: &str) -> u64 {
    node.bytes()
        .fold(seed, |acc, byte| acc.wrapping_mul(31).wrapping_add(u64::from(byte)))
}

impl RepositoryFactory for MockRepositoryFactory {
    fn create(&self, context: RepositoryContext<'_>) -> snapvault_repository::Result<Arc<dyn Repository>> {
        let metadata = context.metadata;
        let settings = &metadata.settings;
        let location = settings.get_required(LOCATION_SETTING)?;
        let random = RandomFailures {
            control_rate: settings.get_f64(RANDOM_CONTROL_IO_EXCEPTION_RATE, 0.0)?,
            data_rate: settings.get_f64(RANDOM_DATA_FILE_IO_EXCEPTION_RATE, 0.0)?,
            seed: node_seed(settings.get_u64(SEED_SETTING, 0)?, context.node),
        };
        let injector = Arc::new(FaultInjector::new(context.node, metadata.name.clone(), random));
        let store: Arc<dyn BlobStore> = Arc::new(FaultInjectingBlobStore::new(
            Arc::new(FsBlobStore::open(location)?),
            Arc::clone(&injector),
        ));
        let inner = BlobStoreRepository::new(
            metadata.name.clone(),
            metadata.repo_type.clone(),
            settings.clone(),
            store,
            context.cluster,
            context.options,
        )?;
        Ok(Arc::new(MockRepository { inner, injector }))
    }
}

#[cfg(test)]
mod tests {
    use snapvault_cluster::{ClusterService, ClusterState, RepositoryMetadata};
    use snapvault_repository::RepositoryOptions;

    use super::*;

    #[test]
    fn nodes_get_distinct_seeds() {
        assert_ne!(node_seed(1, "data-0"), node_seed(1, "data-1"));
        assert_eq!(node_seed(1, "data-0"), node_seed(1, "data-0"));
    }

    #[test]
    fn mock_repositories_are_faultable() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = RepositoryMetadata::new(
            "repo",
            MOCK_TYPE,
            Settings::builder()
                .put(LOCATION_SETTING, dir.path().display())
                .put(RANDOM_CONTROL_IO_EXCEPTION_RATE, 0.25)
                .build(),
        );
        let repository = MockRepositoryFactory
            .create(RepositoryContext {
                node: "data-0",
                metadata: &metadata,
                cluster: Arc::new(ClusterService::new(ClusterState::new())),
                options: RepositoryOptions::default(),
            })
            .unwrap();

        let faultable = repository.as_faultable().unwrap();
        assert!(!faultable.blocked());
        assert_eq!(faultable.failure_count(), 0);
        assert!(test_repository_types().contains(MOCK_TYPE));
    }
}

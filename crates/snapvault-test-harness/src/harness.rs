//! In-process cluster for snapshot tests.
//!
//! [`SnapshotTestHarness`] owns a [`SnapshotsService`] and a temporary
//! directory holding every repository it creates. Tests drive the cluster
//! through it: start nodes, register repositories, index documents, take
//! and delete snapshots, arm fault injection, and wait for cluster state.
//! [`SnapshotTestHarness::finish`] checks every repository for consistency.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use rand::{Rng, SeedableRng, distributions::Alphanumeric, rngs::SmallRng};
use snapvault_blobstore::{BlobStore, FsBlobStore};
use snapvault_cluster::{ClusterService, ClusterState, DeletionState, EntryState};
use snapvault_config::{LARGE_SNAPSHOT_POOL_SIZE, SnapvaultConfig};
use snapvault_repository::{
    BlobStoreRepository, ConsistencyReport, Faultable, LOCATION_SETTING, READONLY_SETTING, Repository,
    RepositoryData, RepositoryError, RepositoryOptions, check_consistency,
};
use snapvault_snapshots::{
    CreateSnapshotRequest, DeleteFuture, FS_TYPE, Node, NodeRoles, SnapshotError, SnapshotFuture, SnapshotsService,
};
use snapvault_types::{RepoGen, Settings, SnapshotId, SnapshotState, Version};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::{HarnessError, Result, test_repository_types};

/// Name prefix of snapshots created only to make a repository look as if an
/// older release wrote it. They are deleted before consistency checks.
pub const OLD_VERSION_SNAPSHOT_PREFIX: &str = "old-version-snapshot-";

/// How often [`SnapshotTestHarness::wait_for_block_on_any_data_node`]
/// moves on to the next node.
const BLOCK_PROBE_INTERVAL: Duration = Duration::from_millis(20);

/// A multi-node cluster running in this process.
#[derive(Debug)]
pub struct SnapshotTestHarness {
    service: Arc<SnapshotsService>,
    dir: TempDir,
    masters: AtomicUsize,
    data_nodes: AtomicUsize,
    skip_consistency: Mutex<Option<String>>,
    rng: Mutex<SmallRng>,
}

impl SnapshotTestHarness {
    /// Harness with no nodes.
    pub fn new(config: SnapvaultConfig) -> Result<Self> {
        let service = SnapshotsService::new(
            Arc::new(ClusterService::new(ClusterState::new())),
            test_repository_types(),
            config,
        );
        Ok(Self {
            service,
            dir: tempfile::tempdir()?,
            masters: AtomicUsize::new(0),
            data_nodes: AtomicUsize::new(0),
            skip_consistency: Mutex::new(None),
            rng: Mutex::new(SmallRng::from_entropy()),
        })
    }

    /// Harness with one master node and `data_nodes` data nodes, configured
    /// from defaults and `SNAPVAULT_*` environment variables.
    pub fn start(data_nodes: usize) -> Result<Self> {
        Self::start_with(SnapvaultConfig::load()?, data_nodes)
    }

    pub fn start_with(config: SnapvaultConfig, data_nodes: usize) -> Result<Self> {
        let harness = Self::new(config)?;
        harness.start_master_node()?;
        for _ in 0..data_nodes {
            harness.start_data_node()?;
        }
        Ok(harness)
    }

    /// Seeds the harness's own randomness: document contents, snapshot
    /// names, and old format selection.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng() = SmallRng::seed_from_u64(seed);
        self
    }

    fn rng(&self) -> MutexGuard<'_, SmallRng> {
        self.rng.lock().expect("harness rng lock poisoned")
    }

    fn random_string(&self, len: usize) -> String {
        let mut rng = self.rng();
        (0..len)
            .map(|_| char::from(rng.sample(Alphanumeric)).to_ascii_lowercase())
            .collect()
    }

    pub(crate) fn random_bool(&self) -> bool {
        self.rng().r#gen()
    }

    pub(crate) fn random_index(&self, len: usize) -> usize {
        self.rng().gen_range(0..len)
    }

    pub fn cluster(&self) -> &Arc<SnapshotsService> {
        &self.service
    }

    pub fn state(&self) -> Arc<ClusterState> {
        self.service.state()
    }

    fn timeout(&self) -> Duration {
        self.service.config().waits.timeout()
    }

    /// Applies `update` to cluster state, as an external actor would.
    pub fn update_cluster_state<F>(&self, source: &str, update: F) -> Result<Arc<ClusterState>>
    where
        F: FnOnce(&ClusterState) -> std::result::Result<ClusterState, SnapshotError>,
    {
        Ok(self.service.cluster().submit_update(source, update)?)
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    pub fn start_master_node(&self) -> Result<Arc<Node>> {
        let id = format!("master-{}", self.masters.fetch_add(1, Ordering::Relaxed));
        Ok(self.service.start_node(id, NodeRoles::MASTER)?)
    }

    pub fn start_data_node(&self) -> Result<Arc<Node>> {
        let id = format!("data-{}", self.data_nodes.fetch_add(1, Ordering::Relaxed));
        Ok(self.service.start_node(id, NodeRoles::DATA)?)
    }

    /// Starts a data node whose snapshot pool runs five shard snapshots at
    /// once.
    pub fn start_data_node_with_large_snapshot_pool(&self) -> Result<Arc<Node>> {
        let id = format!("data-{}", self.data_nodes.fetch_add(1, Ordering::Relaxed));
        let config = self
            .service
            .config()
            .clone()
            .with_snapshot_pool_size(LARGE_SNAPSHOT_POOL_SIZE);
        Ok(self.service.start_node_with(id, NodeRoles::DATA, &config)?)
    }

    pub fn stop_node(&self, node: &str) -> Result<()> {
        info!(node, "stopping node");
        Ok(self.service.stop_node(node)?)
    }

    pub fn master_name(&self) -> Result<String> {
        Ok(self.service.master_node()?.id().to_string())
    }

    pub fn data_node_names(&self) -> Vec<String> {
        self.service
            .data_nodes()
            .iter()
            .map(|node| node.id().to_string())
            .collect()
    }

    // ========================================================================
    // Repositories
    // ========================================================================

    /// Directory of repository `name` inside the harness directory.
    pub fn repo_path(&self, name: &str) -> PathBuf {
        self.dir.path().join("repos").join(name)
    }

    /// Registers and verifies a repository stored under [`Self::repo_path`].
    pub fn create_repository(&self, name: &str, repo_type: &str) -> Result<PathBuf> {
        self.create_repository_with(name, repo_type, Settings::empty())
    }

    /// Like [`Self::create_repository`], with extra settings. A `location`
    /// in `settings` wins over the default path.
    pub fn create_repository_with(&self, name: &str, repo_type: &str, settings: Settings) -> Result<PathBuf> {
        let location = settings
            .get(LOCATION_SETTING)
            .map_or_else(|| self.repo_path(name), PathBuf::from);
        let settings = settings
            .to_builder()
            .put(LOCATION_SETTING, location.display())
            .build();
        info!(repository = name, repo_type, location = %location.display(), "creating repository");
        self.service.put_repository(name, repo_type, settings, true)?;
        Ok(location)
    }

    pub fn get_repository_data(&self, repository: &str) -> Result<Arc<RepositoryData>> {
        Ok(self.service.repository_data(repository)?)
    }

    /// Root metadata as a release at `version` would read it back: written
    /// in that release's format and parsed again.
    pub fn get_repository_data_in_format(&self, repository: &str, version: Version) -> Result<RepositoryData> {
        let data = self.get_repository_data(repository)?;
        let body = data.snapshots_to_json(version)?;
        let parsed = RepositoryData::snapshots_from_json(repository, &body, data.gen_id(), false)?;
        let versions = parsed
            .snapshots_missing_version()
            .filter_map(|id| Some((id.uuid().to_string(), data.version(id)?)))
            .collect();
        Ok(parsed.with_resolved_versions(versions))
    }

    /// Injected failures of `repository`, summed over every node.
    pub fn failure_count(&self, repository: &str) -> u64 {
        self.service
            .nodes()
            .iter()
            .flat_map(|node| node.repositories().existing())
            .filter(|instance| instance.name() == repository)
            .filter_map(|instance| instance.as_faultable().map(Faultable::failure_count))
            .sum()
    }

    // ========================================================================
    // Indices
    // ========================================================================

    pub fn create_index(&self, index: &str, shards: u32) -> Result<()> {
        self.service.create_index(index, shards)?;
        Ok(())
    }

    /// Creates an index holding `docs` random documents.
    pub fn create_index_with_random_docs(&self, index: &str, shards: u32, docs: usize) -> Result<()> {
        self.create_index(index, shards)?;
        self.index_random_docs(index, docs)
    }

    /// Creates a one-shard index holding a single document.
    pub fn create_index_with_content(&self, index: &str) -> Result<()> {
        self.create_index_with_random_docs(index, 1, 1)
    }

    pub fn index_random_docs(&self, index: &str, docs: usize) -> Result<()> {
        let documents = (0..docs)
            .map(|_| format!("{{\"foo\":\"{}\"}}", self.random_string(12)))
            .collect();
        self.service.index_documents(index, documents)?;
        debug!(index, docs, "indexed random documents");
        Ok(())
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Snapshots every index and fails unless every shard succeeded.
    pub fn create_full_snapshot(&self, repository: &str, name: &str) -> Result<snapvault_repository::SnapshotInfo> {
        info!(repository, snapshot = name, "creating full snapshot");
        let info = self
            .service
            .create_snapshot(CreateSnapshotRequest::new(repository, name))?;
        if info.state != SnapshotState::Success || info.successful_shards != info.total_shards {
            return Err(HarnessError::IllegalState(format!(
                "snapshot [{repository}:{name}] ended {} with {} of {} shards",
                info.state, info.successful_shards, info.total_shards
            )));
        }
        Ok(info)
    }

    /// Starts a snapshot of every index without waiting for it.
    pub fn start_full_snapshot(&self, repository: &str, name: &str, partial: bool) -> Result<SnapshotFuture> {
        info!(repository, snapshot = name, partial, "starting full snapshot");
        Ok(self
            .service
            .start_snapshot(CreateSnapshotRequest::new(repository, name).with_partial(partial))?)
    }

    /// Blocks `node` on data files, starts a full snapshot, and waits until
    /// the node's shard snapshot is paused.
    pub fn start_full_snapshot_blocked_on_data_node(
        &self,
        repository: &str,
        name: &str,
        node: &str,
    ) -> Result<SnapshotFuture> {
        self.block_data_node(repository, node)?;
        let future = self.start_full_snapshot(repository, name, false)?;
        self.wait_for_block(node, repository)?;
        Ok(future)
    }

    /// Takes `count` snapshots concurrently and returns their names.
    pub fn create_n_snapshots(&self, repository: &str, count: usize) -> Result<Vec<String>> {
        let prefix = format!("snap-{}-", self.random_string(6));
        let names: Vec<String> = (0..count).map(|i| format!("{prefix}{i}")).collect();
        let futures = names
            .iter()
            .map(|name| self.start_full_snapshot(repository, name, false))
            .collect::<Result<Vec<_>>>()?;
        for future in futures {
            let info = future.wait(self.timeout())?;
            if info.state != SnapshotState::Success {
                return Err(HarnessError::IllegalState(format!(
                    "snapshot [{repository}:{}] ended {}",
                    info.snapshot_id, info.state
                )));
            }
        }
        info!(repository, count, "created snapshots");
        Ok(names)
    }

    pub fn delete_snapshot(&self, repository: &str, name: &str) -> Result<Vec<SnapshotId>> {
        Ok(self.service.delete_snapshots(repository, &[name])?)
    }

    pub fn start_delete_snapshot(&self, repository: &str, name: &str) -> Result<DeleteFuture> {
        info!(repository, snapshot = name, "starting snapshot deletion");
        Ok(self.service.start_delete_snapshots(repository, &[name])?)
    }

    pub fn get_snapshot(&self, repository: &str, name: &str) -> Result<snapvault_repository::SnapshotInfo> {
        Ok(self.service.get_snapshot(repository, name)?)
    }

    // ========================================================================
    // Fault Injection
    // ========================================================================

    /// Runs `f` against `node`'s instance of `repository`.
    pub fn with_faultable<T>(&self, node: &str, repository: &str, f: impl FnOnce(&dyn Faultable) -> T) -> Result<T> {
        let instance = self.service.node(node)?.repository(repository)?;
        let faultable = instance.as_faultable().ok_or_else(|| HarnessError::NotFaultable {
            repository: repository.to_string(),
            node: node.to_string(),
        })?;
        Ok(f(faultable))
    }

    /// Pauses `node`'s reads and writes of shard data blobs.
    pub fn block_data_node(&self, repository: &str, node: &str) -> Result<()> {
        info!(repository, node, "blocking data node on data files");
        self.with_faultable(node, repository, |f| f.block_on_data_files())
    }

    /// Blocks the data node holding the first shard of `index` and returns
    /// its name.
    pub fn block_node_with_index(&self, repository: &str, index: &str) -> Result<String> {
        let state = self.state();
        let node = state
            .metadata()
            .index(index)
            .and_then(|meta| meta.shard_nodes.first().cloned())
            .ok_or_else(|| SnapshotError::IndexMissing { index: index.to_string() })?;
        self.block_data_node(repository, &node)?;
        Ok(node)
    }

    pub fn block_node_on_any_files(&self, repository: &str, node: &str) -> Result<()> {
        info!(repository, node, "blocking node on any files");
        self.with_faultable(node, repository, |f| f.set_block_on_any_files())
    }

    pub fn block_all_data_nodes(&self, repository: &str) -> Result<()> {
        for node in self.data_node_names() {
            self.block_data_node(repository, &node)?;
        }
        Ok(())
    }

    pub fn unblock_all_data_nodes(&self, repository: &str) -> Result<()> {
        for node in self.data_node_names() {
            self.unblock_node(repository, &node)?;
        }
        Ok(())
    }

    /// Makes every data node fail its reads once unblocked.
    pub fn fail_reads_all_data_nodes(&self, repository: &str) -> Result<()> {
        for node in self.data_node_names() {
            self.with_faultable(&node, repository, |f| f.set_fail_reads_after_unblock(true))?;
        }
        Ok(())
    }

    /// Pauses the master's next write of a root `index-N` blob.
    pub fn block_master_on_write_index_file(&self, repository: &str) -> Result<String> {
        let master = self.master_name()?;
        info!(repository, node = %master, "blocking master on index-N writes");
        self.with_faultable(&master, repository, |f| f.set_block_on_write_index_file())?;
        Ok(master)
    }

    /// Pauses the master's next write of a root `index-N` blob, failing it
    /// once released.
    pub fn block_master_from_finalizing_snapshot_on_index_file(&self, repository: &str) -> Result<String> {
        let master = self.master_name()?;
        info!(repository, node = %master, "blocking master from finalizing on index-N");
        self.with_faultable(&master, repository, |f| f.set_block_and_fail_on_write_index_file())?;
        Ok(master)
    }

    /// Pauses the master's next `snap-*.dat` write, failing it once released.
    pub fn block_master_from_finalizing_snapshot_on_snap_file(&self, repository: &str) -> Result<String> {
        let master = self.master_name()?;
        info!(repository, node = %master, "blocking master from finalizing on snap files");
        self.with_faultable(&master, repository, |f| f.set_block_and_fail_on_write_snap_files())?;
        Ok(master)
    }

    /// Pauses the master's deletion of stale root `index-N` blobs.
    pub fn block_master_from_deleting_index_n_file(&self, repository: &str) -> Result<String> {
        let master = self.master_name()?;
        info!(repository, node = %master, "blocking master from deleting index-N");
        self.with_faultable(&master, repository, |f| f.set_block_on_delete_index_file())?;
        Ok(master)
    }

    pub fn unblock_node(&self, repository: &str, node: &str) -> Result<()> {
        info!(repository, node, "unblocking node");
        self.with_faultable(node, repository, |f| f.unblock())
    }

    pub fn is_blocked(&self, node: &str, repository: &str) -> Result<bool> {
        self.with_faultable(node, repository, |f| f.blocked())
    }

    /// Waits until an operation of `node` on `repository` is paused.
    pub fn wait_for_block(&self, node: &str, repository: &str) -> Result<()> {
        let timeout = self.timeout();
        self.with_faultable(node, repository, |f| f.wait_for_block(timeout))??;
        debug!(repository, node, "node is blocked");
        Ok(())
    }

    /// Waits until any data node is paused on `repository` and returns it.
    pub fn wait_for_block_on_any_data_node(&self, repository: &str) -> Result<String> {
        let timeout = self.timeout();
        let deadline = Instant::now() + timeout;
        loop {
            for node in self.data_node_names() {
                let blocked = self
                    .with_faultable(&node, repository, |f| f.wait_for_block(BLOCK_PROBE_INTERVAL).is_ok())
                    .unwrap_or(false);
                if blocked {
                    return Ok(node);
                }
            }
            if Instant::now() >= deadline {
                return Err(snapvault_cluster::ClusterError::Timeout {
                    what: format!("any data node to block on repository [{repository}]"),
                    timeout,
                }
                .into());
            }
        }
    }

    // ========================================================================
    // Cluster State Waits
    // ========================================================================

    fn await_state(&self, what: &str, predicate: impl FnMut(&ClusterState) -> bool) -> Result<Arc<ClusterState>> {
        Ok(self.service.cluster().await_state(what, self.timeout(), predicate)?)
    }

    pub fn await_n_deletions_in_progress(&self, count: usize) -> Result<()> {
        self.await_state(&format!("{count} deletions in progress"), |state| {
            state.deletions().len() == count
        })?;
        Ok(())
    }

    pub fn await_number_of_snapshots_in_progress(&self, count: usize) -> Result<()> {
        self.await_state(&format!("{count} snapshots in progress"), |state| {
            state.snapshots().len() == count
        })?;
        Ok(())
    }

    /// Waits until no snapshot or deletion is running anywhere.
    pub fn await_no_more_running_operations(&self) -> Result<()> {
        self.await_state("no running snapshot operations", |state| {
            state.snapshots().is_empty() && state.deletions().is_empty()
        })?;
        Ok(())
    }

    /// Waits until the master is not writing any repository: nothing is
    /// finalizing and no deletion is executing.
    pub fn await_master_finish_repo_operations(&self) -> Result<()> {
        self.await_state("master to finish repository operations", |state| {
            state
                .snapshots()
                .entries()
                .all(|entry| entry.state != EntryState::Finalizing)
                && state
                    .deletions()
                    .entries()
                    .all(|entry| entry.state != DeletionState::InProgress)
        })?;
        Ok(())
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Files under `path`, recursively.
    pub fn number_of_files(path: &Path) -> Result<usize> {
        let mut count = 0;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                count += Self::number_of_files(&entry.path())?;
            } else {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn assert_file_count(path: &Path, expected: usize) -> Result<()> {
        let actual = Self::number_of_files(path)?;
        if actual != expected {
            return Err(HarnessError::IllegalState(format!(
                "expected {expected} files under {} but found {actual}",
                path.display()
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Consistency
    // ========================================================================

    /// Skips the consistency check of [`Self::finish`].
    pub fn disable_repo_consistency_check(&self, reason: impl Into<String>) {
        let reason = reason.into();
        info!(%reason, "repository consistency check disabled");
        *self.skip_consistency.lock().expect("harness lock poisoned") = Some(reason);
    }

    /// Deletes old format bootstrap snapshots, cleans up the repository, and
    /// checks every blob against the published root metadata.
    ///
    /// Readonly repositories and repositories without a tracked generation
    /// are checked without cleaning up first. Requires that nothing runs
    /// against the repository.
    pub fn assert_repo_consistency(&self, repository: &str) -> Result<ConsistencyReport> {
        let state = self.state();
        let metadata = state
            .metadata()
            .repository(repository)
            .ok_or_else(|| SnapshotError::RepositoryMissing {
                repository: repository.to_string(),
            })?
            .clone();
        let readonly = metadata
            .settings
            .get_bool(READONLY_SETTING, false)
            .map_err(RepositoryError::from)?;
        if !readonly && state.repository_generation(repository).is_known() {
            let pattern = format!("{OLD_VERSION_SNAPSHOT_PREFIX}*");
            self.service.delete_snapshots(repository, &[pattern])?;
            self.service.cleanup_repository(repository)?;
        }

        let store = self.raw_store(repository)?;
        let checker = BlobStoreRepository::new(
            repository,
            metadata.repo_type.clone(),
            metadata.settings.clone(),
            Arc::clone(&store),
            Arc::clone(self.service.cluster()),
            RepositoryOptions::default(),
        )?;
        let data = checker.repository_data()?;
        let published = Some(self.state().repository_generation(repository)).filter(|g| g.is_known());
        let report = check_consistency(repository, store.as_ref(), &data, published)?;
        if !report.is_consistent() {
            warn!(repository, %report, "repository is inconsistent");
            return Err(HarnessError::Inconsistent {
                repository: repository.to_string(),
                report: Box::new(report),
            });
        }
        info!(repository, generation = %report.generation(), "repository is consistent");
        Ok(report)
    }

    /// The repository's storage without fault injection.
    pub(crate) fn raw_store(&self, repository: &str) -> Result<Arc<dyn BlobStore>> {
        let state = self.state();
        let metadata = state
            .metadata()
            .repository(repository)
            .ok_or_else(|| SnapshotError::RepositoryMissing {
                repository: repository.to_string(),
            })?;
        let store: Arc<dyn BlobStore> = match metadata.settings.get(LOCATION_SETTING) {
            Some(location) => Arc::new(FsBlobStore::open(location)?),
            None => self.service.repository(repository)?.blob_store(),
        };
        Ok(store)
    }

    /// Waits for running operations to finish and checks every registered
    /// repository, unless the check was disabled.
    pub fn finish(self) -> Result<()> {
        self.await_no_more_running_operations()?;
        if let Some(reason) = self.skip_consistency.lock().expect("harness lock poisoned").clone() {
            info!(%reason, "skipping repository consistency check");
            return Ok(());
        }
        let repositories: Vec<String> = self
            .state()
            .metadata()
            .repositories()
            .map(|repository| repository.name.clone())
            .collect();
        for repository in repositories {
            self.assert_repo_consistency(&repository)?;
        }
        Ok(())
    }

    /// Registers an `fs` repository at `location`, replacing any fault
    /// injection on the same storage.
    pub fn replace_with_fs_repository(&self, repository: &str, location: &Path) -> Result<()> {
        let settings = Settings::builder().put(LOCATION_SETTING, location.display()).build();
        self.service.put_repository(repository, FS_TYPE, settings, false)?;
        Ok(())
    }

    /// Generation currently published for `repository`.
    pub fn repository_generation(&self, repository: &str) -> RepoGen {
        self.state().repository_generation(repository)
    }
}

//! The snapshots service.
//!
//! One [`SnapshotsService`] drives every node of a cluster. All coordination
//! goes through cluster state; node-local work (shard snapshots, finalization,
//! deletion) runs on the snapshot pool of the node that owns it.
//!
//! ```text
//!   create  ─► entry InProgress ─► shard tasks on data nodes ─► Finalizing
//!                                                                 │
//!                            finalize queue on master ◄───────────┘
//!   delete  ─► deletion Requested ─► (no entries left) ─► InProgress ─► done
//! ```

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use snapvault_cluster::{ClusterService, ClusterState, IndexMetadata, RepositoryMetadata};
use snapvault_config::SnapvaultConfig;
use snapvault_repository::{CleanupResult, Repository, RepositoryData, RepositoryError, SnapshotInfo};
use snapvault_types::{Settings, SnapshotId, SnapshotState, random_uuid};
use tracing::{debug, info, warn};

use crate::{
    Node, NodeRoles, RepositoryTypes, Result, SnapshotError,
    completion::Completion,
};

#[derive(Debug, Default)]
pub(crate) struct FinalizeQueue {
    pub(crate) running: bool,
    pub(crate) pending: VecDeque<SnapshotId>,
}

/// Snapshot and repository operations for a whole cluster.
#[derive(Debug)]
pub struct SnapshotsService {
    pub(crate) cluster: Arc<ClusterService>,
    pub(crate) types: RepositoryTypes,
    pub(crate) config: SnapvaultConfig,
    nodes: RwLock<BTreeMap<String, Arc<Node>>>,
    pub(crate) snapshot_completions: Mutex<BTreeMap<SnapshotId, Arc<Completion<SnapshotInfo>>>>,
    pub(crate) deletion_completions: Mutex<BTreeMap<String, Arc<Completion<Vec<SnapshotId>>>>>,
    pub(crate) finalizations: Mutex<BTreeMap<String, FinalizeQueue>>,
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("snapshots service lock poisoned")
}

impl SnapshotsService {
    pub fn new(cluster: Arc<ClusterService>, types: RepositoryTypes, config: SnapvaultConfig) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            types,
            config,
            nodes: RwLock::new(BTreeMap::new()),
            snapshot_completions: Mutex::new(BTreeMap::new()),
            deletion_completions: Mutex::new(BTreeMap::new()),
            finalizations: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn cluster(&self) -> &Arc<ClusterService> {
        &self.cluster
    }

    pub fn config(&self) -> &SnapvaultConfig {
        &self.config
    }

    pub fn state(&self) -> Arc<ClusterState> {
        self.cluster.state()
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Starts a node with the service's configuration.
    pub fn start_node(&self, id: impl Into<String>, roles: NodeRoles) -> Result<Arc<Node>> {
        let config = self.config.clone();
        self.start_node_with(id, roles, &config)
    }

    /// Starts a node with its own configuration. The first master-eligible
    /// node becomes the elected master.
    pub fn start_node_with(
        &self,
        id: impl Into<String>,
        roles: NodeRoles,
        config: &SnapvaultConfig,
    ) -> Result<Arc<Node>> {
        let node = Node::new(id, roles, Arc::clone(&self.cluster), self.types.clone(), config)?;
        self.nodes
            .write()
            .expect("nodes lock poisoned")
            .insert(node.id().to_string(), Arc::clone(&node));
        let discovery = node.discovery_node();
        self.cluster.submit_update::<_, SnapshotError>("node join", |state| {
            let mut next = state.clone().with_node(discovery);
            if roles.master_eligible && state.master().is_none() {
                next = next.with_master(node.id());
            }
            Ok(next)
        })?;
        Ok(node)
    }

    pub fn node(&self, id: &str) -> Result<Arc<Node>> {
        self.nodes
            .read()
            .expect("nodes lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| SnapshotError::NodeMissing { node: id.to_string() })
    }

    /// Running nodes, ordered by id.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().expect("nodes lock poisoned").values().cloned().collect()
    }

    /// Running data nodes, ordered by id.
    pub fn data_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes()
            .into_iter()
            .filter(|node| node.roles().data)
            .collect()
    }

    pub fn master_node(&self) -> Result<Arc<Node>> {
        let state = self.cluster.state();
        let master = state.master().ok_or(SnapshotError::NoMaster)?;
        self.node(master)
    }

    /// Stops a node. Operations blocked in its repositories fail, and its
    /// unfinished shard snapshots fail with it.
    pub fn stop_node(self: &Arc<Self>, id: &str) -> Result<()> {
        let node = self.node(id)?;
        node.close();
        self.nodes.write().expect("nodes lock poisoned").remove(id);

        let mut actions = Vec::new();
        self.cluster.submit_update::<_, SnapshotError>("node left", |state| {
            let mut next = state.clone().without_node(id);
            if state.master() == Some(id) {
                next = next.without_master();
            }
            let snapshots = crate::create::fail_shards_on_node(state.snapshots().clone(), id, &mut actions);
            Ok(next.with_snapshots(snapshots))
        })?;
        info!(node = id, "node left the cluster");
        self.run(actions);
        Ok(())
    }

    // ========================================================================
    // Repositories
    // ========================================================================

    /// Registers a repository, optionally verifying that every data node
    /// sees the same storage.
    pub fn put_repository(&self, name: &str, repo_type: &str, settings: Settings, verify: bool) -> Result<()> {
        if !self.types.contains(repo_type) {
            return Err(SnapshotError::UnknownRepositoryType {
                repo_type: repo_type.to_string(),
            });
        }
        let previous = self.cluster.state().metadata().repository(name).cloned();
        self.cluster.submit_update::<_, SnapshotError>("put repository", |state| {
            if state.has_repository_operations(name) {
                return Err(SnapshotError::RepositoryInUse {
                    repository: name.to_string(),
                    reason: "snapshot operations are running".to_string(),
                });
            }
            if let Some(existing) = state.metadata().repository(name)
                && existing.repo_type == repo_type
                && existing.settings == settings
            {
                return Ok(state.clone());
            }
            let metadata = state
                .metadata()
                .clone()
                .with_repository(RepositoryMetadata::new(name, repo_type, settings.clone()));
            Ok(state.clone().with_metadata(metadata))
        })?;

        let repository = match self.master_node().and_then(|master| master.repository(name)) {
            Ok(repository) => repository,
            Err(e) => {
                warn!(repository = name, error = %e, "failed to create repository, reverting registration");
                self.restore_registration(name, previous)?;
                return Err(e);
            }
        };
        info!(repository = name, repo_type, "registered repository");

        if verify {
            self.verify_repository(repository.as_ref())?;
        }
        Ok(())
    }

    fn restore_registration(&self, name: &str, previous: Option<RepositoryMetadata>) -> Result<()> {
        self.cluster.submit_update::<_, SnapshotError>("revert repository", |state| {
            let metadata = match previous {
                Some(previous) => state.metadata().clone().with_repository(previous),
                None => state.metadata().clone().without_repository(name),
            };
            Ok(state.clone().with_metadata(metadata))
        })?;
        Ok(())
    }

    /// Has every data node read the master's verification marker.
    pub fn verify_repository(&self, repository: &dyn Repository) -> Result<()> {
        let name = repository.name();
        let Some(seed) = repository.start_verification()? else {
            return Ok(());
        };
        let verification_failure = |e: &dyn std::fmt::Display| SnapshotError::RepositoryVerification {
            repository: name.to_string(),
            reason: e.to_string(),
        };
        let mut result = Ok(());
        for node in self.data_nodes() {
            let verified = node
                .repository(name)
                .and_then(|local| local.verify(&seed, node.id()).map_err(Into::into));
            if let Err(e) = verified {
                result = Err(verification_failure(&e));
                break;
            }
        }
        if let Err(e) = repository.end_verification(&seed) {
            warn!(repository = name, error = %e, "failed to remove verification marker");
        }
        if result.is_ok() {
            debug!(repository = name, "verified repository");
        }
        result
    }

    /// Unregisters a repository. Its blobs are left in place.
    pub fn delete_repository(&self, name: &str) -> Result<()> {
        self.cluster.submit_update::<_, SnapshotError>("delete repository", |state| {
            if state.metadata().repository(name).is_none() {
                return Err(SnapshotError::RepositoryMissing {
                    repository: name.to_string(),
                });
            }
            if state.has_repository_operations(name) {
                return Err(SnapshotError::RepositoryInUse {
                    repository: name.to_string(),
                    reason: "snapshot operations are running".to_string(),
                });
            }
            Ok(state.clone().with_metadata(state.metadata().clone().without_repository(name)))
        })?;
        for node in self.nodes() {
            node.repositories().remove(name);
        }
        info!(repository = name, "unregistered repository");
        Ok(())
    }

    /// The master's instance of `repository`.
    pub fn repository(&self, repository: &str) -> Result<Arc<dyn Repository>> {
        self.master_node()?.repository(repository)
    }

    pub fn repository_data(&self, repository: &str) -> Result<Arc<RepositoryData>> {
        Ok(self.repository(repository)?.repository_data()?)
    }

    /// Deletes every blob the repository's root metadata does not reference.
    pub fn cleanup_repository(&self, repository: &str) -> Result<CleanupResult> {
        Ok(self.repository(repository)?.cleanup()?)
    }

    // ========================================================================
    // Indices
    // ========================================================================

    /// Creates an index, assigning its shards round-robin over data nodes.
    pub fn create_index(&self, name: &str, shards: u32) -> Result<IndexMetadata> {
        let data_nodes: Vec<String> = self.data_nodes().iter().map(|node| node.id().to_string()).collect();
        if data_nodes.is_empty() {
            return Err(SnapshotError::NodeMissing {
                node: "any data node".to_string(),
            });
        }
        self.create_index_on(name, shards, &data_nodes)
    }

    /// Creates an index with its shards assigned round-robin over `nodes`.
    pub fn create_index_on(&self, name: &str, shards: u32, nodes: &[String]) -> Result<IndexMetadata> {
        if nodes.is_empty() {
            return Err(SnapshotError::NodeMissing {
                node: "any data node".to_string(),
            });
        }
        let offset = self.cluster.state().metadata().indices().count();
        let index = IndexMetadata {
            name: name.to_string(),
            uuid: random_uuid(),
            shard_nodes: (0..shards as usize)
                .map(|shard| nodes[(offset + shard) % nodes.len()].clone())
                .collect(),
        };
        for (shard, node) in index.shard_nodes.iter().enumerate() {
            self.node(node)?.shards().create_shard(name, shard as u32);
        }
        self.cluster.submit_update::<_, SnapshotError>("create index", |state| {
            if state.metadata().index(name).is_some() {
                return Err(SnapshotError::IndexExists { index: name.to_string() });
            }
            Ok(state.clone().with_metadata(state.metadata().clone().with_index(index.clone())))
        })?;
        info!(index = name, shards, "created index");
        Ok(index)
    }

    /// Adds documents to an index, spreading them over its shards.
    pub fn index_documents(&self, index: &str, documents: Vec<String>) -> Result<()> {
        let state = self.cluster.state();
        let metadata = state
            .metadata()
            .index(index)
            .ok_or_else(|| SnapshotError::IndexMissing { index: index.to_string() })?;
        let shards = metadata.shard_nodes.len().max(1);
        let mut per_shard: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (i, document) in documents.into_iter().enumerate() {
            per_shard.entry(i % shards).or_default().push(document);
        }
        for (shard, documents) in per_shard {
            let Some(node) = metadata.shard_nodes.get(shard) else {
                continue;
            };
            self.node(node)?.shards().add_documents(index, shard as u32, documents);
        }
        Ok(())
    }

    /// Total documents of an index over its live shards.
    pub fn doc_count(&self, index: &str) -> Result<usize> {
        let state = self.cluster.state();
        let metadata = state
            .metadata()
            .index(index)
            .ok_or_else(|| SnapshotError::IndexMissing { index: index.to_string() })?;
        Ok(metadata
            .shard_nodes
            .iter()
            .enumerate()
            .filter_map(|(shard, node)| Some(self.node(node).ok()?.shards().doc_count(index, shard as u32)))
            .sum())
    }

    pub fn delete_index(&self, index: &str) -> Result<()> {
        self.cluster.submit_update::<_, SnapshotError>("delete index", |state| {
            if state.metadata().index(index).is_none() {
                return Err(SnapshotError::IndexMissing { index: index.to_string() });
            }
            Ok(state.clone().with_metadata(state.metadata().clone().without_index(index)))
        })?;
        for node in self.nodes() {
            node.shards().remove_index(index);
        }
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// A snapshot, running or completed.
    pub fn get_snapshot(&self, repository: &str, name: &str) -> Result<SnapshotInfo> {
        let state = self.cluster.state();
        if let Some(entry) = state.snapshots().find_by_name(repository, name) {
            return Ok(crate::create::in_progress_info(entry));
        }
        let target = self.repository(repository)?;
        let data = target.repository_data()?;
        let snapshot = data
            .snapshot_by_name(name)
            .ok_or_else(|| SnapshotError::SnapshotMissing {
                repository: repository.to_string(),
                snapshot: name.to_string(),
            })?;
        Ok(target.snapshot_info(snapshot)?)
    }

    /// Every snapshot of a repository: completed ones first, by name, then
    /// running ones.
    pub fn get_snapshots(&self, repository: &str) -> Result<Vec<SnapshotInfo>> {
        let target = self.repository(repository)?;
        let data = target.repository_data()?;
        let mut completed: Vec<&SnapshotId> = data.snapshot_ids().collect();
        completed.sort_by(|a, b| a.name().cmp(b.name()));
        let mut infos = completed
            .into_iter()
            .map(|snapshot| target.snapshot_info(snapshot))
            .collect::<std::result::Result<Vec<_>, RepositoryError>>()?;
        let state = self.cluster.state();
        infos.extend(state.snapshots().for_repository(repository).map(crate::create::in_progress_info));
        Ok(infos)
    }

    /// Count of completed snapshots in `state`.
    pub fn snapshot_count(&self, repository: &str, state: SnapshotState) -> Result<usize> {
        let data = self.repository_data(repository)?;
        Ok(data.snapshot_ids().filter(|id| data.state(id) == Some(state)).count())
    }

    // ========================================================================
    // Completions
    // ========================================================================

    pub(crate) fn complete_snapshot(&self, snapshot: &SnapshotId, result: Result<SnapshotInfo>) {
        match &result {
            Ok(info) => info!(snapshot = %snapshot, state = %info.state, "snapshot completed"),
            Err(e) => warn!(snapshot = %snapshot, error = %e, "snapshot failed"),
        }
        if let Some(completion) = lock(&self.snapshot_completions).remove(snapshot) {
            completion.complete(result);
        }
    }

    pub(crate) fn complete_deletion(&self, uuid: &str, result: Result<Vec<SnapshotId>>) {
        if let Some(completion) = lock(&self.deletion_completions).remove(uuid) {
            completion.complete(result);
        }
    }

    pub(crate) fn new_deletion_uuid() -> String {
        random_uuid()
    }
}

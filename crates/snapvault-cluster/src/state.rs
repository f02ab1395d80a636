//! Cluster state.
//!
//! The cluster state is an immutable value. Every change produces a new
//! state with a higher version (builder pattern: methods take ownership of
//! `self`, mutate, and return `self`).

use std::collections::BTreeMap;

use snapvault_types::{RepoGen, Settings};

use crate::in_progress::{SnapshotDeletionsInProgress, SnapshotsInProgress};

// ============================================================================
// Nodes
// ============================================================================

/// A node that is part of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryNode {
    pub id: String,
    pub master_eligible: bool,
    pub data: bool,
}

impl DiscoveryNode {
    pub fn master(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            master_eligible: true,
            data: false,
        }
    }

    pub fn data(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            master_eligible: false,
            data: true,
        }
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// A registered repository and its generation pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryMetadata {
    pub name: String,
    pub repo_type: String,
    pub settings: Settings,
    /// Latest generation known to be durable in the blob store.
    pub generation: RepoGen,
    /// Highest generation any writer has reserved.
    pub pending_generation: RepoGen,
}

impl RepositoryMetadata {
    pub fn new(name: impl Into<String>, repo_type: impl Into<String>, settings: Settings) -> Self {
        Self {
            name: name.into(),
            repo_type: repo_type.into(),
            settings,
            generation: RepoGen::UNKNOWN,
            pending_generation: RepoGen::UNKNOWN,
        }
    }

    /// Returns true if a writer reserved a generation it has not yet published.
    pub fn has_pending_write(&self) -> bool {
        self.pending_generation > self.generation
    }
}

/// An index and the node holding each of its shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMetadata {
    pub name: String,
    pub uuid: String,
    /// Node id per shard number.
    pub shard_nodes: Vec<String>,
}

impl IndexMetadata {
    pub fn number_of_shards(&self) -> u32 {
        self.shard_nodes.len() as u32
    }
}

/// Persistent cluster metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    repositories: BTreeMap<String, RepositoryMetadata>,
    indices: BTreeMap<String, IndexMetadata>,
}

impl Metadata {
    pub fn repository(&self, name: &str) -> Option<&RepositoryMetadata> {
        self.repositories.get(name)
    }

    pub fn repositories(&self) -> impl Iterator<Item = &RepositoryMetadata> {
        self.repositories.values()
    }

    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.indices.get(name)
    }

    pub fn indices(&self) -> impl Iterator<Item = &IndexMetadata> {
        self.indices.values()
    }

    pub fn with_repository(mut self, repository: RepositoryMetadata) -> Self {
        self.repositories
            .insert(repository.name.clone(), repository);
        self
    }

    pub fn without_repository(mut self, name: &str) -> Self {
        self.repositories.remove(name);
        self
    }

    pub fn with_index(mut self, index: IndexMetadata) -> Self {
        self.indices.insert(index.name.clone(), index);
        self
    }

    pub fn without_index(mut self, name: &str) -> Self {
        self.indices.remove(name);
        self
    }
}

// ============================================================================
// Cluster State
// ============================================================================

/// Immutable view of the whole cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterState {
    version: u64,
    master: Option<String>,
    nodes: BTreeMap<String, DiscoveryNode>,
    metadata: Metadata,
    snapshots: SnapshotsInProgress,
    deletions: SnapshotDeletionsInProgress,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn master(&self) -> Option<&str> {
        self.master.as_deref()
    }

    pub fn node(&self, id: &str) -> Option<&DiscoveryNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values()
    }

    pub fn data_nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values().filter(|node| node.data)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn snapshots(&self) -> &SnapshotsInProgress {
        &self.snapshots
    }

    pub fn deletions(&self) -> &SnapshotDeletionsInProgress {
        &self.deletions
    }

    /// Generation pointer of a repository, or `UNKNOWN` if not registered.
    pub fn repository_generation(&self, repository: &str) -> RepoGen {
        self.metadata
            .repository(repository)
            .map_or(RepoGen::UNKNOWN, |repo| repo.generation)
    }

    /// True if any snapshot or deletion is running against `repository`.
    pub fn has_repository_operations(&self, repository: &str) -> bool {
        self.snapshots.for_repository(repository).next().is_some()
            || self.deletions.for_repository(repository).next().is_some()
    }

    pub(crate) fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_master(mut self, master: impl Into<String>) -> Self {
        self.master = Some(master.into());
        self
    }

    pub fn without_master(mut self) -> Self {
        self.master = None;
        self
    }

    pub fn with_node(mut self, node: DiscoveryNode) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn without_node(mut self, id: &str) -> Self {
        self.nodes.remove(id);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Applies `update` to a repository's metadata, if registered.
    pub fn with_repository_update(
        mut self,
        repository: &str,
        update: impl FnOnce(&mut RepositoryMetadata),
    ) -> Self {
        if let Some(repo) = self.metadata.repositories.get_mut(repository) {
            update(repo);
        }
        self
    }

    pub fn with_snapshots(mut self, snapshots: SnapshotsInProgress) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_deletions(mut self, deletions: SnapshotDeletionsInProgress) -> Self {
        self.deletions = deletions;
        self
    }
}

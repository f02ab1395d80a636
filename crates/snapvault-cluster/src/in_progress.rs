//! Running snapshot and deletion operations tracked in cluster state.
//!
//! The authoritative set of in-flight repository operations lives here, not
//! on any node. Snapshot entries move through
//! `Accepted -> InProgress -> Finalizing` and are removed once finalized;
//! deletion entries move through `Requested -> InProgress` and are removed
//! when done.

use std::collections::BTreeMap;

use snapvault_types::{IndexId, RepoGen, ShardGeneration, ShardId, SnapshotId, Version};

// ============================================================================
// Shard Status
// ============================================================================

/// State of one shard inside a running snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardState {
    /// Assigned to a node and running or about to run.
    Init,
    /// Waiting for an earlier operation on the same shard to finish.
    Queued,
    Success,
    Failed,
    /// Abort requested; the running task will report a failure.
    Aborted,
    /// The shard's node is gone.
    Missing,
}

impl ShardState {
    pub fn completed(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Missing)
    }

    pub fn failed(self) -> bool {
        matches!(self, Self::Failed | Self::Missing)
    }
}

/// Status of one shard inside a running snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSnapshotStatus {
    pub node: Option<String>,
    pub state: ShardState,
    /// Shard generation written by a successful shard snapshot.
    pub generation: Option<ShardGeneration>,
    pub reason: Option<String>,
}

impl ShardSnapshotStatus {
    pub fn init(node: impl Into<String>) -> Self {
        Self {
            node: Some(node.into()),
            state: ShardState::Init,
            generation: None,
            reason: None,
        }
    }

    pub fn queued(node: impl Into<String>) -> Self {
        Self {
            state: ShardState::Queued,
            ..Self::init(node)
        }
    }

    pub fn missing(reason: impl Into<String>) -> Self {
        Self {
            node: None,
            state: ShardState::Missing,
            generation: None,
            reason: Some(reason.into()),
        }
    }

    pub fn success(node: Option<String>, generation: ShardGeneration) -> Self {
        Self {
            node,
            state: ShardState::Success,
            generation: Some(generation),
            reason: None,
        }
    }

    pub fn failed(node: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            node,
            state: ShardState::Failed,
            generation: None,
            reason: Some(reason.into()),
        }
    }
}

// ============================================================================
// Snapshot Entries
// ============================================================================

/// Lifecycle of a running snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// Name reserved, shards not yet assigned.
    Accepted,
    InProgress,
    /// All shards completed; the master is writing repository metadata.
    Finalizing,
    /// A deletion targeted this snapshot while it was running.
    Aborted,
}

/// A snapshot that has been accepted but not yet finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub snapshot: SnapshotId,
    pub repository: String,
    pub state: EntryState,
    pub indices: Vec<IndexId>,
    pub shards: BTreeMap<ShardId, ShardSnapshotStatus>,
    /// Repository generation observed when the snapshot started.
    pub repository_state_id: RepoGen,
    pub start_time: i64,
    pub partial: bool,
    pub include_global_state: bool,
    pub user_metadata: BTreeMap<String, String>,
    pub failure: Option<String>,
    pub version: Version,
}

impl SnapshotEntry {
    pub fn accepted(snapshot: SnapshotId, repository: impl Into<String>, partial: bool) -> Self {
        Self {
            snapshot,
            repository: repository.into(),
            state: EntryState::Accepted,
            indices: Vec::new(),
            shards: BTreeMap::new(),
            repository_state_id: RepoGen::UNKNOWN,
            start_time: chrono::Utc::now().timestamp_millis(),
            partial,
            include_global_state: true,
            user_metadata: BTreeMap::new(),
            failure: None,
            version: Version::CURRENT,
        }
    }

    /// True once every shard reached a terminal state.
    pub fn shards_completed(&self) -> bool {
        self.shards.values().all(|status| status.state.completed())
    }

    pub fn failed_shards(&self) -> impl Iterator<Item = (&ShardId, &ShardSnapshotStatus)> {
        self.shards.iter().filter(|(_, status)| status.state.failed())
    }

    /// Shards with work still running on `node`.
    pub fn running_on<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a ShardId> + 'a {
        self.shards.iter().filter_map(move |(shard, status)| {
            (status.node.as_deref() == Some(node)
                && matches!(status.state, ShardState::Init | ShardState::Aborted))
            .then_some(shard)
        })
    }
}

/// Running snapshots, keyed by snapshot id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotsInProgress {
    entries: BTreeMap<SnapshotId, SnapshotEntry>,
}

impl SnapshotsInProgress {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, snapshot: &SnapshotId) -> Option<&SnapshotEntry> {
        self.entries.get(snapshot)
    }

    pub fn entries(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.values()
    }

    pub fn for_repository<'a>(
        &'a self,
        repository: &'a str,
    ) -> impl Iterator<Item = &'a SnapshotEntry> + 'a {
        self.entries
            .values()
            .filter(move |entry| entry.repository == repository)
    }

    pub fn find_by_name<'a>(&'a self, repository: &'a str, name: &str) -> Option<&'a SnapshotEntry> {
        self.for_repository(repository)
            .find(|entry| entry.snapshot.name() == name)
    }

    pub fn with_entry(mut self, entry: SnapshotEntry) -> Self {
        self.entries.insert(entry.snapshot.clone(), entry);
        self
    }

    pub fn without_entry(mut self, snapshot: &SnapshotId) -> Self {
        self.entries.remove(snapshot);
        self
    }
}

// ============================================================================
// Deletion Entries
// ============================================================================

/// Lifecycle of a snapshot deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeletionState {
    /// Waiting for running snapshots in the same repository to finish.
    Requested,
    InProgress,
}

/// A deletion of one or more snapshots from a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionEntry {
    pub uuid: String,
    pub repository: String,
    pub snapshots: Vec<SnapshotId>,
    pub state: DeletionState,
    pub repository_state_id: RepoGen,
    pub start_time: i64,
}

/// Running deletions, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDeletionsInProgress {
    entries: Vec<DeletionEntry>,
}

impl SnapshotDeletionsInProgress {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &DeletionEntry> {
        self.entries.iter()
    }

    pub fn get(&self, uuid: &str) -> Option<&DeletionEntry> {
        self.entries.iter().find(|entry| entry.uuid == uuid)
    }

    pub fn for_repository<'a>(
        &'a self,
        repository: &'a str,
    ) -> impl Iterator<Item = &'a DeletionEntry> + 'a {
        self.entries
            .iter()
            .filter(move |entry| entry.repository == repository)
    }

    /// Returns true if `snapshot` is targeted by any deletion.
    pub fn targets(&self, snapshot: &SnapshotId) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.snapshots.contains(snapshot))
    }

    pub fn with_entry(mut self, entry: DeletionEntry) -> Self {
        match self.entries.iter_mut().find(|e| e.uuid == entry.uuid) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self
    }

    pub fn without_entry(mut self, uuid: &str) -> Self {
        self.entries.retain(|entry| entry.uuid != uuid);
        self
    }
}

//! Snapshot creation: accepting a request, running shard snapshots on data
//! nodes, starting queued shards, and finalizing on the master.
//!
//! State transitions are computed by pure functions over
//! [`SnapshotsInProgress`] inside a cluster state update. Whatever must run
//! after the update is published is returned as an [`Action`].

use std::{collections::BTreeMap, sync::Arc};

use snapvault_cluster::{
    ClusterState, EntryState, ShardSnapshotStatus, ShardState, SnapshotEntry, SnapshotsInProgress,
};
use snapvault_repository::{
    FinalizeSnapshot, IndexMetadataSnapshot, Repository, RepositoryData, RepositoryError, ShardGenerations,
    ShardSnapshotRequest, SnapshotInfo, SnapshotMetadata, SnapshotShardFailure, legacy_shard_generations,
};
use snapvault_types::{ShardGeneration, ShardId, SnapshotId, SnapshotState, Version};
use tracing::{debug, error, info, warn};

use crate::{
    Node, Result, SnapshotError, SnapshotFuture, SnapshotsService,
    completion::Completion,
    pattern,
    service::{lock, now_millis},
};

/// Times a snapshot is re-accepted when the repository generation moves
/// underneath it.
const MAX_ACCEPT_ATTEMPTS: u32 = 10;

const NODE_LEFT: &str = "node left the cluster";
const ABORTED_BY_DELETION: &str = "aborted by snapshot deletion";

const INVALID_NAME_CHARS: &[char] = &['\\', '/', '*', '?', '"', '<', '>', '|', ' ', ',', '#'];

// ============================================================================
// Requests
// ============================================================================

/// Request to snapshot indices into a repository.
#[derive(Debug, Clone)]
pub struct CreateSnapshotRequest {
    pub repository: String,
    pub name: String,
    /// Index names or `*` patterns. Empty selects every index.
    pub indices: Vec<String>,
    /// Accept shards without a node instead of rejecting the request.
    pub partial: bool,
    pub include_global_state: bool,
    pub user_metadata: BTreeMap<String, String>,
}

impl CreateSnapshotRequest {
    pub fn new(repository: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            name: name.into(),
            indices: Vec::new(),
            partial: false,
            include_global_state: true,
            user_metadata: BTreeMap::new(),
        }
    }

    pub fn with_indices<I, S>(mut self, indices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indices = indices.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    pub fn with_include_global_state(mut self, include: bool) -> Self {
        self.include_global_state = include;
        self
    }

    pub fn with_user_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_metadata.insert(key.into(), value.into());
        self
    }
}

pub(crate) fn validate_name(repository: &str, name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("cannot be empty")
    } else if name.contains(INVALID_NAME_CHARS) {
        Some("must not contain whitespace or any of \\ / * ? \" < > | , #")
    } else if name.starts_with('_') {
        Some("must not start with '_'")
    } else if name.chars().any(char::is_uppercase) {
        Some("must be lowercase")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(SnapshotError::InvalidSnapshotName {
            repository: repository.to_string(),
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

// ============================================================================
// Actions
// ============================================================================

/// One shard snapshot to run on a data node.
#[derive(Debug, Clone)]
pub(crate) struct ShardTask {
    pub repository: String,
    pub snapshot: SnapshotId,
    pub shard: ShardId,
    pub node: String,
    /// Generation written by an unfinalized predecessor on the same shard.
    pub base_generation: Option<ShardGeneration>,
}

/// Work to start once a cluster state update is published.
#[derive(Debug)]
pub(crate) enum Action {
    SnapshotShard(ShardTask),
    Finalize { repository: String, snapshot: SnapshotId },
    FailAborted { repository: String, snapshot: SnapshotId },
    StartDeletions { repository: String },
}

// ============================================================================
// State Transitions
// ============================================================================

/// Newest successful but unfinalized generation of `shard` among the
/// repository's running snapshots. Shard snapshots started later must build
/// on it so that finalizing them keeps the earlier snapshot's files listed.
fn pending_generation(
    snapshots: &SnapshotsInProgress,
    repository: &str,
    shard: &ShardId,
) -> Option<ShardGeneration> {
    snapshots
        .for_repository(repository)
        .filter(|entry| entry.state != EntryState::Aborted)
        .filter_map(|entry| {
            let status = entry.shards.get(shard)?;
            let generation = status.generation.clone()?;
            (status.state == ShardState::Success).then_some((entry.start_time, generation))
        })
        .max_by_key(|(start_time, _)| *start_time)
        .map(|(_, generation)| generation)
}

/// Moves an entry whose shards all completed to its next state.
fn check_completed(
    snapshots: SnapshotsInProgress,
    snapshot: &SnapshotId,
    actions: &mut Vec<Action>,
) -> SnapshotsInProgress {
    let Some(mut entry) = snapshots.get(snapshot).cloned() else {
        return snapshots;
    };
    if !entry.shards_completed() {
        return snapshots;
    }
    match entry.state {
        EntryState::Aborted => {
            actions.push(Action::FailAborted {
                repository: entry.repository.clone(),
                snapshot: snapshot.clone(),
            });
            actions.push(Action::StartDeletions {
                repository: entry.repository,
            });
            snapshots.without_entry(snapshot)
        }
        EntryState::Accepted | EntryState::InProgress => {
            entry.state = EntryState::Finalizing;
            actions.push(Action::Finalize {
                repository: entry.repository.clone(),
                snapshot: snapshot.clone(),
            });
            snapshots.with_entry(entry)
        }
        EntryState::Finalizing => snapshots,
    }
}

/// Starts the oldest snapshot waiting on `shard`, now that the shard is free.
fn start_next_queued(
    snapshots: SnapshotsInProgress,
    repository: &str,
    shard: &ShardId,
    actions: &mut Vec<Action>,
) -> SnapshotsInProgress {
    let next = snapshots
        .for_repository(repository)
        .filter(|entry| {
            entry
                .shards
                .get(shard)
                .is_some_and(|status| status.state == ShardState::Queued)
        })
        .min_by_key(|entry| entry.start_time)
        .cloned();
    let Some(mut entry) = next else {
        return snapshots;
    };
    let node = entry
        .shards
        .get(shard)
        .and_then(|status| status.node.clone())
        .unwrap_or_default();

    if entry.state == EntryState::Aborted {
        entry
            .shards
            .insert(shard.clone(), ShardSnapshotStatus::failed(Some(node), ABORTED_BY_DELETION));
        let snapshot = entry.snapshot.clone();
        let snapshots = start_next_queued(snapshots.with_entry(entry), repository, shard, actions);
        return check_completed(snapshots, &snapshot, actions);
    }

    entry.shards.insert(shard.clone(), ShardSnapshotStatus::init(node.clone()));
    let snapshot = entry.snapshot.clone();
    let snapshots = snapshots.with_entry(entry);
    actions.push(Action::SnapshotShard(ShardTask {
        repository: repository.to_string(),
        snapshot,
        shard: shard.clone(),
        node,
        base_generation: pending_generation(&snapshots, repository, shard),
    }));
    snapshots
}

/// Records the outcome of one shard. Outcomes for shards that already
/// completed are ignored.
pub(crate) fn apply_shard_result(
    snapshots: SnapshotsInProgress,
    snapshot: &SnapshotId,
    shard: &ShardId,
    status: ShardSnapshotStatus,
    actions: &mut Vec<Action>,
) -> SnapshotsInProgress {
    let Some(mut entry) = snapshots.get(snapshot).cloned() else {
        return snapshots;
    };
    if entry.shards.get(shard).is_none_or(|current| current.state.completed()) {
        return snapshots;
    }
    let repository = entry.repository.clone();
    entry.shards.insert(shard.clone(), status);
    let snapshots = start_next_queued(snapshots.with_entry(entry), &repository, shard, actions);
    check_completed(snapshots, snapshot, actions)
}

/// Fails every unfinished shard assigned to `node`.
pub(crate) fn fail_shards_on_node(
    mut snapshots: SnapshotsInProgress,
    node: &str,
    actions: &mut Vec<Action>,
) -> SnapshotsInProgress {
    let affected: Vec<(SnapshotId, ShardId)> = snapshots
        .entries()
        .flat_map(|entry| {
            entry
                .shards
                .iter()
                .filter(|(_, status)| status.node.as_deref() == Some(node) && !status.state.completed())
                .map(|(shard, _)| (entry.snapshot.clone(), shard.clone()))
        })
        .collect();
    for (snapshot, shard) in affected {
        snapshots = apply_shard_result(
            snapshots,
            &snapshot,
            &shard,
            ShardSnapshotStatus::failed(Some(node.to_string()), NODE_LEFT),
            actions,
        );
    }
    snapshots
}

/// Aborts a running snapshot targeted by a deletion. Running shards are
/// told to stop; queued shards fail at once. Finalizing snapshots are left
/// to complete.
pub(crate) fn abort_entry(
    snapshots: SnapshotsInProgress,
    snapshot: &SnapshotId,
    actions: &mut Vec<Action>,
) -> SnapshotsInProgress {
    let Some(mut entry) = snapshots.get(snapshot).cloned() else {
        return snapshots;
    };
    if !matches!(entry.state, EntryState::Accepted | EntryState::InProgress) {
        return snapshots;
    }
    entry.state = EntryState::Aborted;
    for status in entry.shards.values_mut() {
        match status.state {
            ShardState::Init => status.state = ShardState::Aborted,
            ShardState::Queued => *status = ShardSnapshotStatus::failed(status.node.clone(), ABORTED_BY_DELETION),
            _ => {}
        }
    }
    check_completed(snapshots.with_entry(entry), snapshot, actions)
}

fn shard_failures(entry: &SnapshotEntry) -> Vec<SnapshotShardFailure> {
    entry
        .failed_shards()
        .map(|(shard, status)| SnapshotShardFailure {
            index: shard.index().name().to_string(),
            index_uuid: shard.index().id().to_string(),
            shard_id: shard.shard(),
            reason: status.reason.clone().unwrap_or_else(|| "unknown".to_string()),
            node_id: status.node.clone(),
        })
        .collect()
}

fn snapshot_info(entry: &SnapshotEntry, state: SnapshotState, end_time: i64) -> SnapshotInfo {
    let shard_failures = shard_failures(entry);
    let total_shards = entry.shards.len() as u32;
    let successful_shards = entry
        .shards
        .values()
        .filter(|status| status.state == ShardState::Success)
        .count() as u32;
    SnapshotInfo {
        snapshot_id: entry.snapshot.clone(),
        indices: entry.indices.iter().map(|index| index.name().to_string()).collect(),
        state,
        reason: entry.failure.clone(),
        version: entry.version,
        start_time: entry.start_time,
        end_time,
        total_shards,
        successful_shards,
        shard_failures,
        include_global_state: entry.include_global_state,
        user_metadata: entry.user_metadata.clone(),
    }
}

/// Info for a snapshot that has not been finalized yet.
pub(crate) fn in_progress_info(entry: &SnapshotEntry) -> SnapshotInfo {
    snapshot_info(entry, SnapshotState::InProgress, 0)
}

fn finished_info(entry: &SnapshotEntry) -> SnapshotInfo {
    let total = entry.shards.len() as u32;
    let failed = entry.failed_shards().count() as u32;
    let mut info = snapshot_info(entry, SnapshotState::from_shard_counts(total, failed), now_millis());
    if info.reason.is_none() && failed > 0 {
        info.reason = Some(format!("{failed} of {total} shards failed"));
    }
    info
}

/// Builds the entry for a new snapshot against the repository contents in
/// `data`. Shards whose node is gone are missing; shards still being
/// snapshotted by another running snapshot are queued behind it.
fn new_entry(
    state: &ClusterState,
    data: &RepositoryData,
    request: &CreateSnapshotRequest,
    snapshot: &SnapshotId,
) -> Result<SnapshotEntry> {
    let repository = request.repository.as_str();
    if data.snapshot_by_name(&request.name).is_some() {
        return Err(SnapshotError::SnapshotExists {
            repository: repository.to_string(),
            snapshot: request.name.clone(),
        });
    }
    if state.snapshots().find_by_name(repository, &request.name).is_some() {
        return Err(SnapshotError::ConcurrentSnapshotExecution {
            repository: repository.to_string(),
            snapshot: request.name.clone(),
            reason: "a snapshot with the same name is already running".to_string(),
        });
    }
    if state.deletions().for_repository(repository).next().is_some() {
        return Err(SnapshotError::ConcurrentSnapshotExecution {
            repository: repository.to_string(),
            snapshot: request.name.clone(),
            reason: "a snapshot deletion is running".to_string(),
        });
    }

    let names: Vec<&str> = state.metadata().indices().map(|index| index.name.as_str()).collect();
    let (selected, missing) = pattern::resolve(&request.indices, names);
    if let Some(index) = missing.into_iter().next() {
        return Err(SnapshotError::IndexMissing { index });
    }

    let running = state.snapshots();
    let mut entry = SnapshotEntry::accepted(snapshot.clone(), repository, request.partial);
    entry.include_global_state = request.include_global_state;
    entry.user_metadata = request.user_metadata.clone();
    entry.repository_state_id = data.gen_id();
    entry.version = data
        .min_version()
        .map_or(Version::CURRENT, |min| min.min(Version::CURRENT));
    // Later snapshots sort after earlier ones even within one millisecond.
    if let Some(latest) = running.entries().map(|e| e.start_time).max() {
        entry.start_time = entry.start_time.max(latest + 1);
    }

    let mut missing_shards = Vec::new();
    for name in selected {
        let Some(metadata) = state.metadata().index(name) else {
            continue;
        };
        let index = running
            .for_repository(repository)
            .flat_map(|entry| entry.indices.iter())
            .find(|index| index.name() == name)
            .cloned()
            .unwrap_or_else(|| data.resolve_index_id(name));
        for (shard, node) in metadata.shard_nodes.iter().enumerate() {
            let shard_id = ShardId::new(index.clone(), shard as u32);
            let status = if state.node(node).is_none_or(|node| !node.data) {
                missing_shards.push(format!("[{name}][{shard}]"));
                ShardSnapshotStatus::missing(NODE_LEFT)
            } else if running.for_repository(repository).any(|other| {
                other
                    .shards
                    .get(&shard_id)
                    .is_some_and(|status| !status.state.completed())
            }) {
                ShardSnapshotStatus::queued(node.clone())
            } else {
                ShardSnapshotStatus::init(node.clone())
            };
            entry.shards.insert(shard_id, status);
        }
        entry.indices.push(index);
    }

    if !request.partial && !missing_shards.is_empty() {
        return Err(SnapshotError::MissingShards {
            repository: repository.to_string(),
            snapshot: request.name.clone(),
            shards: missing_shards,
        });
    }
    entry.state = EntryState::InProgress;
    Ok(entry)
}

fn global_metadata(state: &ClusterState) -> BTreeMap<String, String> {
    let indices: Vec<&str> = state.metadata().indices().map(|index| index.name.as_str()).collect();
    let repositories: Vec<&str> = state.metadata().repositories().map(|repo| repo.name.as_str()).collect();
    BTreeMap::from([
        ("indices".to_string(), indices.join(",")),
        ("repositories".to_string(), repositories.join(",")),
    ])
}

// ============================================================================
// Service
// ============================================================================

impl SnapshotsService {
    /// Creates a snapshot and waits for it to finish.
    pub fn create_snapshot(self: &Arc<Self>, request: CreateSnapshotRequest) -> Result<SnapshotInfo> {
        self.start_snapshot(request)?.wait(self.config.waits.timeout())
    }

    /// Starts a snapshot. Fails at once if the request is invalid; otherwise
    /// the returned future completes when the snapshot is finalized, fails,
    /// or is aborted.
    pub fn start_snapshot(self: &Arc<Self>, request: CreateSnapshotRequest) -> Result<SnapshotFuture> {
        validate_name(&request.repository, &request.name)?;
        let repository = self.repository(&request.repository)?;
        if repository.is_readonly() {
            return Err(RepositoryError::IllegalRepositoryState {
                repository: request.repository.clone(),
                reason: "cannot create snapshots in a readonly repository".to_string(),
            }
            .into());
        }

        let snapshot = SnapshotId::random(request.name.clone());
        let completion = Completion::new();
        lock(&self.snapshot_completions).insert(snapshot.clone(), Arc::clone(&completion));
        let actions = match self.accept_snapshot(repository.as_ref(), &request, &snapshot) {
            Ok(actions) => actions,
            Err(e) => {
                lock(&self.snapshot_completions).remove(&snapshot);
                return Err(e);
            }
        };
        info!(repository = %request.repository, snapshot = %snapshot, "started snapshot");
        self.run(actions);
        Ok(SnapshotFuture { snapshot, completion })
    }

    fn accept_snapshot(
        &self,
        repository: &dyn Repository,
        request: &CreateSnapshotRequest,
        snapshot: &SnapshotId,
    ) -> Result<Vec<Action>> {
        for attempt in 1..=MAX_ACCEPT_ATTEMPTS {
            let data = repository.repository_data()?;
            let mut stale = false;
            let mut actions = Vec::new();
            self.cluster.submit_update::<_, SnapshotError>("create snapshot", |state| {
                let published = state.repository_generation(&request.repository);
                if published.is_known() && published != data.gen_id() {
                    stale = true;
                    return Ok(state.clone());
                }
                let entry = new_entry(state, &data, request, snapshot)?;
                let tasks: Vec<(ShardId, String)> = entry
                    .shards
                    .iter()
                    .filter(|(_, status)| status.state == ShardState::Init)
                    .filter_map(|(shard, status)| Some((shard.clone(), status.node.clone()?)))
                    .collect();
                let mut snapshots = state.snapshots().clone().with_entry(entry);
                for (shard, node) in tasks {
                    let base_generation = pending_generation(&snapshots, &request.repository, &shard);
                    actions.push(Action::SnapshotShard(ShardTask {
                        repository: request.repository.clone(),
                        snapshot: snapshot.clone(),
                        shard,
                        node,
                        base_generation,
                    }));
                }
                snapshots = check_completed(snapshots, snapshot, &mut actions);
                Ok(state.clone().with_snapshots(snapshots))
            })?;
            if !stale {
                return Ok(actions);
            }
            debug!(repository = %request.repository, attempt, "repository generation moved, accepting snapshot again");
        }
        Err(RepositoryError::RepositoryBusy {
            repository: request.repository.clone(),
            attempts: MAX_ACCEPT_ATTEMPTS,
        }
        .into())
    }

    pub(crate) fn run(self: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::SnapshotShard(task) => self.run_shard(task),
                Action::Finalize { repository, snapshot } => self.enqueue_finalization(repository, snapshot),
                Action::FailAborted { repository, snapshot } => {
                    let name = snapshot.name().to_string();
                    self.complete_snapshot(
                        &snapshot,
                        Err(SnapshotError::Aborted {
                            repository,
                            snapshot: name,
                        }),
                    );
                }
                Action::StartDeletions { repository } => self.start_deletions(&repository),
            }
        }
    }

    // ========================================================================
    // Shard Snapshots
    // ========================================================================

    fn run_shard(self: &Arc<Self>, task: ShardTask) {
        let node = match self.node(&task.node) {
            Ok(node) if !node.is_closed() => node,
            _ => {
                let node = task.node.clone();
                self.shard_done(&task, Err(SnapshotError::NodeMissing { node }));
                return;
            }
        };
        debug!(node = %task.node, snapshot = %task.snapshot, shard = %task.shard, "scheduling shard snapshot");
        let service = Arc::clone(self);
        let worker = Arc::clone(&node);
        node.spawn(move || {
            let result = service.snapshot_shard(&worker, &task);
            service.shard_done(&task, result);
        });
    }

    fn shard_aborted(&self, snapshot: &SnapshotId, shard: &ShardId) -> bool {
        self.cluster.state().snapshots().get(snapshot).is_none_or(|entry| {
            entry.state == EntryState::Aborted
                || entry
                    .shards
                    .get(shard)
                    .is_some_and(|status| status.state == ShardState::Aborted)
        })
    }

    fn snapshot_shard(&self, node: &Node, task: &ShardTask) -> Result<ShardGeneration> {
        let version = {
            let state = self.cluster.state();
            let entry = state
                .snapshots()
                .get(&task.snapshot)
                .filter(|entry| entry.state != EntryState::Aborted)
                .ok_or_else(|| SnapshotError::Aborted {
                    repository: task.repository.clone(),
                    snapshot: task.snapshot.name().to_string(),
                })?;
            entry.version
        };
        let repository = node.repository(&task.repository)?;
        let data = repository.repository_data()?;
        let index = task.shard.index();
        let shard = task.shard.shard();
        let request = ShardSnapshotRequest {
            snapshot: task.snapshot.clone(),
            index: index.clone(),
            shard,
            files: node.shards().files(index.name(), shard),
            base_generation: task
                .base_generation
                .clone()
                .or_else(|| data.shard_generations().get(index, shard).cloned()),
            legacy_format: legacy_shard_generations(&data, version),
        };
        let aborted = || node.is_closed() || self.shard_aborted(&task.snapshot, &task.shard);
        Ok(repository.snapshot_shard(request, &aborted)?)
    }

    fn shard_done(self: &Arc<Self>, task: &ShardTask, result: Result<ShardGeneration>) {
        let status = match result {
            Ok(generation) => {
                debug!(node = %task.node, snapshot = %task.snapshot, shard = %task.shard, %generation, "shard snapshot done");
                ShardSnapshotStatus::success(Some(task.node.clone()), generation)
            }
            Err(e) => {
                warn!(node = %task.node, snapshot = %task.snapshot, shard = %task.shard, error = %e, "shard snapshot failed");
                ShardSnapshotStatus::failed(Some(task.node.clone()), e.to_string())
            }
        };
        let mut actions = Vec::new();
        let update = self.cluster.submit_update::<_, SnapshotError>("shard snapshot done", |state| {
            let snapshots = apply_shard_result(
                state.snapshots().clone(),
                &task.snapshot,
                &task.shard,
                status,
                &mut actions,
            );
            Ok(state.clone().with_snapshots(snapshots))
        });
        if let Err(e) = update {
            error!(snapshot = %task.snapshot, error = %e, "failed to record shard snapshot result");
        }
        self.run(actions);
    }

    // ========================================================================
    // Finalization
    // ========================================================================

    /// Queues `snapshot` for finalization. Each repository finalizes one
    /// snapshot at a time, on the master's snapshot pool.
    fn enqueue_finalization(self: &Arc<Self>, repository: String, snapshot: SnapshotId) {
        let start = {
            let mut finalizations = lock(&self.finalizations);
            let queue = finalizations.entry(repository.clone()).or_default();
            queue.pending.push_back(snapshot);
            !std::mem::replace(&mut queue.running, true)
        };
        if !start {
            return;
        }
        match self.master_node() {
            Ok(master) => {
                let service = Arc::clone(self);
                master.spawn(move || service.drain_finalizations(&repository));
            }
            Err(e) => {
                warn!(repository = %repository, error = %e, "cannot finalize snapshots without a master");
                let pending = {
                    let mut finalizations = lock(&self.finalizations);
                    finalizations.remove(&repository).map(|queue| queue.pending).unwrap_or_default()
                };
                for snapshot in pending {
                    self.remove_entry(&snapshot);
                    self.complete_snapshot(&snapshot, Err(SnapshotError::NoMaster));
                }
                self.start_deletions(&repository);
            }
        }
    }

    fn drain_finalizations(self: &Arc<Self>, repository: &str) {
        loop {
            let next = {
                let mut finalizations = lock(&self.finalizations);
                let Some(queue) = finalizations.get_mut(repository) else {
                    return;
                };
                match queue.pending.pop_front() {
                    Some(snapshot) => snapshot,
                    None => {
                        queue.running = false;
                        return;
                    }
                }
            };
            self.finalize(repository, &next);
        }
    }

    fn finalize(self: &Arc<Self>, repository: &str, snapshot: &SnapshotId) {
        let state = self.cluster.state();
        let Some(entry) = state.snapshots().get(snapshot).cloned() else {
            return;
        };
        let result = self.write_snapshot(&state, &entry);
        self.remove_entry(snapshot);
        self.complete_snapshot(snapshot, result);
        self.start_deletions(repository);
    }

    fn write_snapshot(&self, state: &ClusterState, entry: &SnapshotEntry) -> Result<SnapshotInfo> {
        let repository = self.repository(&entry.repository)?;

        let mut shard_generations = ShardGenerations::empty();
        let mut indices = BTreeMap::new();
        for index in &entry.indices {
            let shards = entry.shards.keys().filter(|shard| shard.index() == index).count() as u32;
            shard_generations = shard_generations.with_index(index.clone(), shards);
            let metadata = state.metadata().index(index.name()).map_or_else(
                || IndexMetadataSnapshot {
                    name: index.name().to_string(),
                    uuid: index.id().to_string(),
                    number_of_shards: shards,
                },
                |metadata| IndexMetadataSnapshot {
                    name: metadata.name.clone(),
                    uuid: metadata.uuid.clone(),
                    number_of_shards: metadata.number_of_shards(),
                },
            );
            indices.insert(index.clone(), metadata);
        }
        for (shard, status) in &entry.shards {
            if status.state == ShardState::Success
                && let Some(generation) = &status.generation
            {
                shard_generations = shard_generations.with(shard.index().clone(), shard.shard(), Some(generation.clone()));
            }
        }

        let info = finished_info(entry);
        let global = if entry.include_global_state {
            global_metadata(state)
        } else {
            BTreeMap::new()
        };
        repository.finalize_snapshot(FinalizeSnapshot {
            shard_generations,
            repository_state_id: entry.repository_state_id,
            metadata: SnapshotMetadata { global, indices },
            snapshot_info: info.clone(),
            version: entry.version,
        })?;
        Ok(info)
    }

    pub(crate) fn remove_entry(&self, snapshot: &SnapshotId) {
        let update = self.cluster.submit_update::<_, SnapshotError>("remove snapshot", |state| {
            Ok(state.clone().with_snapshots(state.snapshots().clone().without_entry(snapshot)))
        });
        if let Err(e) = update {
            error!(snapshot = %snapshot, error = %e, "failed to remove snapshot from cluster state");
        }
    }
}

#[cfg(test)]
mod tests {
    use snapvault_types::{IndexId, RepoGen};
    use test_case::test_case;

    use super::*;

    fn shard(index: &IndexId, shard: u32) -> ShardId {
        ShardId::new(index.clone(), shard)
    }

    fn entry(name: &str, index: &IndexId, statuses: Vec<ShardSnapshotStatus>) -> SnapshotEntry {
        let mut entry = SnapshotEntry::accepted(SnapshotId::random(name), "repo", false);
        entry.state = EntryState::InProgress;
        entry.repository_state_id = RepoGen::EMPTY;
        entry.indices = vec![index.clone()];
        for (i, status) in statuses.into_iter().enumerate() {
            entry.shards.insert(shard(index, i as u32), status);
        }
        entry
    }

    #[test_case("" ; "empty")]
    #[test_case("Upper" ; "uppercase")]
    #[test_case("_hidden" ; "leading underscore")]
    #[test_case("a b" ; "whitespace")]
    #[test_case("a,b" ; "comma")]
    #[test_case("a*" ; "wildcard")]
    fn invalid_snapshot_names_are_rejected(name: &str) {
        let err = validate_name("repo", name).unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidSnapshotName { .. }), "{err}");
    }

    #[test]
    fn valid_snapshot_name_is_accepted() {
        validate_name("repo", "nightly-2024.01.01").unwrap();
    }

    #[test]
    fn last_shard_result_moves_entry_to_finalizing() {
        let index = IndexId::new("logs", "logs-id");
        let running = entry(
            "snap",
            &index,
            vec![ShardSnapshotStatus::init("data-0"), ShardSnapshotStatus::init("data-1")],
        );
        let id = running.snapshot.clone();
        let snapshots = SnapshotsInProgress::default().with_entry(running);
        let mut actions = Vec::new();

        let snapshots = apply_shard_result(
            snapshots,
            &id,
            &shard(&index, 0),
            ShardSnapshotStatus::success(Some("data-0".into()), ShardGeneration::random()),
            &mut actions,
        );
        assert!(actions.is_empty());
        assert_eq!(snapshots.get(&id).unwrap().state, EntryState::InProgress);

        let snapshots = apply_shard_result(
            snapshots,
            &id,
            &shard(&index, 1),
            ShardSnapshotStatus::failed(Some("data-1".into()), "disk"),
            &mut actions,
        );
        assert_eq!(snapshots.get(&id).unwrap().state, EntryState::Finalizing);
        assert!(matches!(actions.as_slice(), [Action::Finalize { .. }]));
    }

    #[test]
    fn result_for_completed_shard_is_ignored() {
        let index = IndexId::new("logs", "logs-id");
        let running = entry("snap", &index, vec![ShardSnapshotStatus::failed(Some("data-0".into()), "gone")]);
        let id = running.snapshot.clone();
        let before = SnapshotsInProgress::default().with_entry(running);
        let mut actions = Vec::new();

        let after = apply_shard_result(
            before.clone(),
            &id,
            &shard(&index, 0),
            ShardSnapshotStatus::success(Some("data-0".into()), ShardGeneration::random()),
            &mut actions,
        );

        assert_eq!(after, before);
        assert!(actions.is_empty());
    }

    #[test]
    fn queued_shard_starts_from_predecessor_generation() {
        let index = IndexId::new("logs", "logs-id");
        let first = entry("first", &index, vec![ShardSnapshotStatus::init("data-0")]);
        let mut second = entry("second", &index, vec![ShardSnapshotStatus::queued("data-0")]);
        second.start_time = first.start_time + 1;
        let (first_id, second_id) = (first.snapshot.clone(), second.snapshot.clone());
        let snapshots = SnapshotsInProgress::default().with_entry(first).with_entry(second);
        let generation = ShardGeneration::random();
        let mut actions = Vec::new();

        let snapshots = apply_shard_result(
            snapshots,
            &first_id,
            &shard(&index, 0),
            ShardSnapshotStatus::success(Some("data-0".into()), generation.clone()),
            &mut actions,
        );

        let started = snapshots.get(&second_id).unwrap().shards.get(&shard(&index, 0)).unwrap();
        assert_eq!(started.state, ShardState::Init);
        let task = actions
            .iter()
            .find_map(|action| match action {
                Action::SnapshotShard(task) => Some(task),
                _ => None,
            })
            .unwrap();
        assert_eq!(task.snapshot, second_id);
        assert_eq!(task.base_generation, Some(generation));
    }

    #[test]
    fn aborting_fails_queued_shards_and_marks_running_ones() {
        let index = IndexId::new("logs", "logs-id");
        let running = entry(
            "snap",
            &index,
            vec![ShardSnapshotStatus::init("data-0"), ShardSnapshotStatus::queued("data-1")],
        );
        let id = running.snapshot.clone();
        let mut actions = Vec::new();

        let snapshots = abort_entry(SnapshotsInProgress::default().with_entry(running), &id, &mut actions);

        let aborted = snapshots.get(&id).unwrap();
        assert_eq!(aborted.state, EntryState::Aborted);
        assert_eq!(aborted.shards[&shard(&index, 0)].state, ShardState::Aborted);
        assert_eq!(aborted.shards[&shard(&index, 1)].state, ShardState::Failed);
        assert!(actions.is_empty());

        let snapshots = apply_shard_result(
            snapshots,
            &id,
            &shard(&index, 0),
            ShardSnapshotStatus::failed(Some("data-0".into()), "aborted"),
            &mut actions,
        );
        assert!(snapshots.get(&id).is_none());
        assert!(matches!(
            actions.as_slice(),
            [Action::FailAborted { .. }, Action::StartDeletions { .. }]
        ));
    }

    #[test]
    fn leaving_node_fails_its_shards() {
        let index = IndexId::new("logs", "logs-id");
        let running = entry(
            "snap",
            &index,
            vec![
                ShardSnapshotStatus::success(Some("data-0".into()), ShardGeneration::random()),
                ShardSnapshotStatus::init("data-1"),
            ],
        );
        let id = running.snapshot.clone();
        let mut actions = Vec::new();

        let snapshots = fail_shards_on_node(SnapshotsInProgress::default().with_entry(running), "data-1", &mut actions);

        let entry = snapshots.get(&id).unwrap();
        assert_eq!(entry.state, EntryState::Finalizing);
        assert_eq!(entry.shards[&shard(&index, 1)].reason.as_deref(), Some(NODE_LEFT));
        let info = finished_info(entry);
        assert_eq!(info.state, SnapshotState::Partial);
        assert_eq!(info.shard_failures.len(), 1);
    }
}

//! Snapshot deletion.
//!
//! A deletion is first recorded as `Requested`, aborting the running
//! snapshots it targets. It starts only once no snapshot of its repository
//! is running, so the repository write never races a finalization. One
//! deletion per repository runs at a time.

use std::sync::Arc;

use snapvault_cluster::{ClusterState, DeletionEntry, DeletionState};
use snapvault_repository::{Repository, RepositoryError};
use snapvault_types::SnapshotId;
use tracing::{debug, error, info, warn};

use crate::{
    DeleteFuture, Result, SnapshotError, SnapshotsService,
    completion::Completion,
    create::{Action, abort_entry},
    pattern,
    service::{lock, now_millis},
};

/// Times a deletion is re-submitted when the repository generation moves
/// underneath it.
const MAX_SUBMIT_ATTEMPTS: u32 = 10;

impl SnapshotsService {
    /// Deletes snapshots matching `patterns` and waits for the deletion.
    /// Returns the snapshots removed from the repository.
    pub fn delete_snapshots<S: AsRef<str>>(self: &Arc<Self>, repository: &str, patterns: &[S]) -> Result<Vec<SnapshotId>> {
        self.start_delete_snapshots(repository, patterns)?
            .wait(self.config.waits.timeout())
    }

    /// Starts deleting snapshots matching names or `*` patterns. Running
    /// snapshots that match are aborted. A concrete name matching nothing
    /// fails the request; patterns matching nothing complete at once.
    pub fn start_delete_snapshots<S: AsRef<str>>(
        self: &Arc<Self>,
        repository: &str,
        patterns: &[S],
    ) -> Result<DeleteFuture> {
        let patterns: Vec<String> = patterns.iter().map(|p| p.as_ref().to_string()).collect();
        let target = self.repository(repository)?;
        if target.is_readonly() {
            return Err(RepositoryError::IllegalRepositoryState {
                repository: repository.to_string(),
                reason: "cannot delete snapshots from a readonly repository".to_string(),
            }
            .into());
        }

        let uuid = Self::new_deletion_uuid();
        let completion = Completion::new();
        lock(&self.deletion_completions).insert(uuid.clone(), Arc::clone(&completion));
        let future = DeleteFuture {
            repository: repository.to_string(),
            completion,
        };
        match self.submit_deletion(target.as_ref(), &uuid, &patterns) {
            Ok(Some(actions)) => {
                info!(repository, deletion = %uuid, ?patterns, "requested snapshot deletion");
                self.run(actions);
                self.start_deletions(repository);
            }
            Ok(None) => {
                debug!(repository, ?patterns, "no snapshots matched deletion");
                self.complete_deletion(&uuid, Ok(Vec::new()));
            }
            Err(e) => {
                lock(&self.deletion_completions).remove(&uuid);
                return Err(e);
            }
        }
        Ok(future)
    }

    /// Records a requested deletion in cluster state. Returns `None` if the
    /// patterns matched nothing.
    fn submit_deletion(
        &self,
        target: &dyn Repository,
        uuid: &str,
        patterns: &[String],
    ) -> Result<Option<Vec<Action>>> {
        let repository = target.name();
        for attempt in 1..=MAX_SUBMIT_ATTEMPTS {
            Self::ensure_generation_tracked(repository, &self.cluster.state())?;
            let data = target.repository_data()?;
            let mut stale = false;
            let mut requested = false;
            let mut actions = Vec::new();
            self.cluster.submit_update::<_, SnapshotError>("delete snapshots", |state| {
                Self::ensure_generation_tracked(repository, state)?;
                if state.repository_generation(repository) != data.gen_id() {
                    stale = true;
                    return Ok(state.clone());
                }
                let running: Vec<&SnapshotId> = state
                    .snapshots()
                    .for_repository(repository)
                    .map(|entry| &entry.snapshot)
                    .collect();
                let names = data
                    .snapshot_ids()
                    .chain(running.iter().copied())
                    .map(SnapshotId::name);
                let (matched, missing) = pattern::resolve(patterns, names);
                if let Some(name) = missing.into_iter().next() {
                    return Err(SnapshotError::SnapshotMissing {
                        repository: repository.to_string(),
                        snapshot: name,
                    });
                }
                if matched.is_empty() {
                    return Ok(state.clone());
                }

                let mut targets: Vec<SnapshotId> = data
                    .snapshot_ids()
                    .filter(|id| matched.contains(&id.name()))
                    .cloned()
                    .collect();
                let mut snapshots = state.snapshots().clone();
                for id in running.into_iter().filter(|id| matched.contains(&id.name())) {
                    snapshots = abort_entry(snapshots, id, &mut actions);
                    targets.push(id.clone());
                }
                requested = true;
                let entry = DeletionEntry {
                    uuid: uuid.to_string(),
                    repository: repository.to_string(),
                    snapshots: targets,
                    state: DeletionState::Requested,
                    repository_state_id: data.gen_id(),
                    start_time: now_millis(),
                };
                Ok(state
                    .clone()
                    .with_snapshots(snapshots)
                    .with_deletions(state.deletions().clone().with_entry(entry)))
            })?;
            if !stale {
                return Ok(requested.then_some(actions));
            }
            debug!(repository, attempt, "repository generation moved, submitting deletion again");
        }
        Err(RepositoryError::RepositoryBusy {
            repository: repository.to_string(),
            attempts: MAX_SUBMIT_ATTEMPTS,
        }
        .into())
    }

    /// Deleting needs a generation to compare against. Snapshots injected
    /// into an untracked repository can only go once something else wrote
    /// to it.
    fn ensure_generation_tracked(repository: &str, state: &ClusterState) -> Result<()> {
        let generation = state.repository_generation(repository);
        if generation.is_known() {
            return Ok(());
        }
        Err(RepositoryError::IllegalRepositoryState {
            repository: repository.to_string(),
            reason: format!("cannot delete snapshots while the repository generation is {generation}"),
        }
        .into())
    }

    /// Starts the oldest requested deletion of `repository` if nothing else
    /// runs against it.
    pub(crate) fn start_deletions(self: &Arc<Self>, repository: &str) {
        let mut started = None;
        let update = self.cluster.submit_update::<_, SnapshotError>("start deletion", |state| {
            let busy = state.snapshots().for_repository(repository).next().is_some()
                || state
                    .deletions()
                    .for_repository(repository)
                    .any(|entry| entry.state == DeletionState::InProgress);
            if busy {
                return Ok(state.clone());
            }
            let Some(mut entry) = state
                .deletions()
                .for_repository(repository)
                .find(|entry| entry.state == DeletionState::Requested)
                .cloned()
            else {
                return Ok(state.clone());
            };
            entry.state = DeletionState::InProgress;
            started = Some(entry.clone());
            Ok(state.clone().with_deletions(state.deletions().clone().with_entry(entry)))
        });
        if let Err(e) = update {
            error!(repository, error = %e, "failed to start snapshot deletion");
            return;
        }
        let Some(entry) = started else {
            return;
        };
        match self.master_node() {
            Ok(master) => {
                let service = Arc::clone(self);
                master.spawn(move || service.run_deletion(&entry));
            }
            Err(e) => {
                warn!(repository, deletion = %entry.uuid, error = %e, "cannot run deletion without a master");
                self.remove_deletion(&entry.uuid);
                self.complete_deletion(&entry.uuid, Err(e));
            }
        }
    }

    fn run_deletion(self: &Arc<Self>, entry: &DeletionEntry) {
        let result = self.delete_from_repository(entry);
        if let Err(e) = &result {
            warn!(repository = %entry.repository, deletion = %entry.uuid, error = %e, "snapshot deletion failed");
        }
        self.remove_deletion(&entry.uuid);
        self.complete_deletion(&entry.uuid, result);
        self.start_deletions(&entry.repository);
    }

    /// Deletes the targets that made it into the repository. Aborted
    /// snapshots never did; writing a new generation anyway sweeps the
    /// blobs they left behind.
    fn delete_from_repository(&self, entry: &DeletionEntry) -> Result<Vec<SnapshotId>> {
        let repository = self.repository(&entry.repository)?;
        let data = repository.repository_data()?;
        let deleted: Vec<SnapshotId> = entry
            .snapshots
            .iter()
            .filter(|snapshot| data.contains(snapshot))
            .cloned()
            .collect();
        repository.delete_snapshots(&deleted, data.gen_id())?;
        Ok(deleted)
    }

    fn remove_deletion(&self, uuid: &str) {
        let update = self.cluster.submit_update::<_, SnapshotError>("remove deletion", |state| {
            Ok(state.clone().with_deletions(state.deletions().clone().without_entry(uuid)))
        });
        if let Err(e) = update {
            error!(deletion = uuid, error = %e, "failed to remove deletion from cluster state");
        }
    }
}

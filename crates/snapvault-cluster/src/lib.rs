//! Cluster state for snapvault.
//!
//! Provides the shared view that nodes coordinate through:
//! - Registered repositories and their generation pointers
//! - Indices and the node holding each shard
//! - Running snapshots and deletions
//! - A publish/observe service with bounded waits

mod error;
mod in_progress;
mod service;
mod state;

pub use error::{ClusterError, Result};
pub use in_progress::{
    DeletionEntry, DeletionState, EntryState, ShardSnapshotStatus, ShardState,
    SnapshotDeletionsInProgress, SnapshotEntry, SnapshotsInProgress,
};
pub use service::ClusterService;
pub use state::{ClusterState, DiscoveryNode, IndexMetadata, Metadata, RepositoryMetadata};

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use snapvault_types::{RepoGen, Settings, SnapshotId};
    use test_case::test_case;

    use super::*;

    fn service_with_repo() -> ClusterService {
        let metadata =
            Metadata::default().with_repository(RepositoryMetadata::new("repo", "fs", Settings::empty()));
        ClusterService::new(
            ClusterState::new()
                .with_master("master-0")
                .with_node(DiscoveryNode::master("master-0"))
                .with_metadata(metadata),
        )
    }

    #[test]
    fn updates_bump_version() {
        let service = service_with_repo();
        let before = service.state().version();

        let after = service
            .submit_update::<_, ClusterError>("set generation", |state| {
                Ok(state.clone().with_repository_update("repo", |repo| {
                    repo.generation = RepoGen::new(0);
                }))
            })
            .unwrap();

        assert_eq!(after.version(), before + 1);
        assert_eq!(service.state().repository_generation("repo"), RepoGen::new(0));
    }

    #[test]
    fn no_op_update_is_not_published() {
        let service = service_with_repo();
        let before = service.state().version();
        service
            .submit_update::<_, ClusterError>("noop", |state| Ok(state.clone()))
            .unwrap();
        assert_eq!(service.state().version(), before);
    }

    #[test]
    fn failed_update_leaves_state_untouched() {
        let service = service_with_repo();
        let result = service.submit_update("rejected", |_| Err("nope"));
        assert_eq!(result.unwrap_err(), "nope");
        assert_eq!(service.state().version(), 0);
    }

    #[test]
    fn await_state_wakes_on_publish() {
        let service = Arc::new(service_with_repo());
        let publisher = {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                service
                    .submit_update::<_, ClusterError>("add node", |state| {
                        Ok(state.clone().with_node(DiscoveryNode::data("data-0")))
                    })
                    .unwrap();
            })
        };

        let state = service
            .await_state("data node joined", Duration::from_secs(5), |state| {
                state.node("data-0").is_some()
            })
            .unwrap();
        assert!(state.node("data-0").is_some());
        publisher.join().unwrap();
    }

    #[test]
    fn await_state_times_out_with_description() {
        let service = service_with_repo();
        let err = service
            .await_state("never", Duration::from_millis(10), |_| false)
            .unwrap_err();
        assert_eq!(
            err,
            ClusterError::Timeout {
                what: "never".to_string(),
                timeout: Duration::from_millis(10),
            }
        );
    }

    #[test]
    fn unknown_repository_has_unknown_generation() {
        let service = service_with_repo();
        assert_eq!(service.state().repository_generation("missing"), RepoGen::UNKNOWN);
        assert_eq!(service.state().repository_generation("repo"), RepoGen::UNKNOWN);
    }

    #[test_case(ShardState::Init, false, false)]
    #[test_case(ShardState::Queued, false, false)]
    #[test_case(ShardState::Aborted, false, false)]
    #[test_case(ShardState::Success, true, false)]
    #[test_case(ShardState::Failed, true, true)]
    #[test_case(ShardState::Missing, true, true)]
    fn shard_state_classification(state: ShardState, completed: bool, failed: bool) {
        assert_eq!(state.completed(), completed);
        assert_eq!(state.failed(), failed);
    }

    #[test]
    fn in_progress_tracks_repository_operations() {
        let snapshot = SnapshotId::new("snap", "u1");
        let snapshots = SnapshotsInProgress::default()
            .with_entry(SnapshotEntry::accepted(snapshot.clone(), "repo", false));
        let state = ClusterState::new().with_snapshots(snapshots);

        assert!(state.has_repository_operations("repo"));
        assert!(!state.has_repository_operations("other"));
        assert!(state.snapshots().find_by_name("repo", "snap").is_some());

        let state = state.clone().with_snapshots(state.snapshots().clone().without_entry(&snapshot));
        assert!(!state.has_repository_operations("repo"));
    }
}

//! Error types for snapshot orchestration.

use snapvault_cluster::ClusterError;
use snapvault_repository::RepositoryError;
use thiserror::Error;

/// Errors from snapshot, deletion, and repository requests.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("[{repository}] repository is not registered")]
    RepositoryMissing { repository: String },

    #[error("repository type [{repo_type}] is not supported")]
    UnknownRepositoryType { repo_type: String },

    /// The repository cannot be changed while operations run against it.
    #[error("[{repository}] repository is in use: {reason}")]
    RepositoryInUse { repository: String, reason: String },

    #[error("[{repository}] repository verification failed: {reason}")]
    RepositoryVerification { repository: String, reason: String },

    #[error("[{repository}:{name}] invalid snapshot name: {reason}")]
    InvalidSnapshotName {
        repository: String,
        name: String,
        reason: &'static str,
    },

    #[error("[{repository}:{snapshot}] snapshot with the same name already exists")]
    SnapshotExists { repository: String, snapshot: String },

    #[error("[{repository}:{snapshot}] snapshot is missing")]
    SnapshotMissing { repository: String, snapshot: String },

    /// Another operation on the same repository conflicts with the request.
    #[error("[{repository}:{snapshot}] concurrent snapshot execution: {reason}")]
    ConcurrentSnapshotExecution {
        repository: String,
        snapshot: String,
        reason: String,
    },

    #[error("index [{index}] is missing")]
    IndexMissing { index: String },

    #[error("index [{index}] already exists")]
    IndexExists { index: String },

    /// Shards of a non-partial snapshot have no node to run on.
    #[error("[{repository}:{snapshot}] shards are unavailable: {shards:?}")]
    MissingShards {
        repository: String,
        snapshot: String,
        shards: Vec<String>,
    },

    #[error("[{repository}:{snapshot}] snapshot was aborted by a deletion")]
    Aborted { repository: String, snapshot: String },

    #[error("node [{node}] is not part of the cluster")]
    NodeMissing { node: String },

    #[error("node [{node}] is closed")]
    NodeClosed { node: String },

    #[error("cluster has no elected master")]
    NoMaster,

    #[error("failed to build the snapshot pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl SnapshotError {
    /// The I/O error behind this failure, if it came from the blob store.
    pub fn io_source(&self) -> Option<&std::io::Error> {
        match self {
            Self::Repository(e) => e.io_source(),
            _ => None,
        }
    }
}

/// Result type for snapshot operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;

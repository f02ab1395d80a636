//! Harness error types.

use snapvault_blobstore::BlobStoreError;
use snapvault_cluster::ClusterError;
use snapvault_config::ConfigError;
use snapvault_repository::{BlobOp, ConsistencyReport, RepositoryError};
use snapvault_snapshots::SnapshotError;
use thiserror::Error;

/// A failure injected by a fault-injecting blob store. Carried inside the
/// [`std::io::Error`] of [`BlobStoreError::Io`].
#[derive(Debug, Error)]
#[error("[{repository}] injected {op:?} failure on [{blob}] at node [{node}]")]
pub struct InjectedFailure {
    pub node: String,
    pub repository: String,
    pub op: BlobOp,
    pub blob: String,
}

/// Returns true if `error` was injected rather than raised by storage.
pub fn is_injected(error: &std::io::Error) -> bool {
    error.get_ref().is_some_and(|inner| inner.is::<InjectedFailure>())
}

/// Errors from harness helpers.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The repository failed the consistency check.
    #[error("repository [{repository}] is inconsistent:\n{report}")]
    Inconsistent {
        repository: String,
        report: Box<ConsistencyReport>,
    },

    /// The repository type does not support fault injection.
    #[error("repository [{repository}] on node [{node}] does not support fault injection")]
    NotFaultable { repository: String, node: String },

    /// A helper was used in a state it does not support.
    #[error("{0}")]
    IllegalState(String),

    #[error("failed to create harness directory: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    BlobStore(#[from] BlobStoreError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for harness helpers.
pub type Result<T> = std::result::Result<T, HarnessError>;

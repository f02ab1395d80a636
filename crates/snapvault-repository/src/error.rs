//! Repository error types.

use snapvault_blobstore::BlobStoreError;
use snapvault_cluster::ClusterError;
use snapvault_types::{RepoGen, SettingsError};
use thiserror::Error;

/// Errors from repository operations.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// A metadata blob is unreadable, truncated, or does not match what was
    /// requested. Never retried.
    #[error("[{repository}] corrupt repository state in {blob}: {reason}")]
    CorruptState {
        repository: String,
        blob: String,
        reason: String,
    },

    /// Another writer advanced the repository generation first.
    #[error("[{repository}] concurrent modification: expected generation {expected}, found {actual}")]
    ConcurrentModification {
        repository: String,
        expected: RepoGen,
        actual: RepoGen,
    },

    /// Retries on concurrent modification were exhausted.
    #[error("[{repository}] repository busy: gave up after {attempts} attempts")]
    RepositoryBusy { repository: String, attempts: u32 },

    /// The operation is not valid for the repository's current state.
    #[error("[{repository}] illegal repository state: {reason}")]
    IllegalRepositoryState { repository: String, reason: String },

    /// A snapshot named in the request does not exist.
    #[error("[{repository}:{snapshot}] snapshot is missing")]
    SnapshotMissing { repository: String, snapshot: String },

    /// The snapshot already exists in the repository.
    #[error("[{repository}:{snapshot}] snapshot with the same name already exists")]
    SnapshotExists { repository: String, snapshot: String },

    /// The snapshot was aborted by a concurrent deletion.
    #[error("[{repository}:{snapshot}] snapshot was aborted")]
    Aborted { repository: String, snapshot: String },

    #[error(transparent)]
    BlobStore(#[from] BlobStoreError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("failed to serialize {what}: {source}")]
    Serialization {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl RepositoryError {
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }

    /// The I/O error behind this failure, if it came from the blob store.
    pub fn io_source(&self) -> Option<&std::io::Error> {
        match self {
            Self::BlobStore(e) => e.io_source(),
            _ => None,
        }
    }
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

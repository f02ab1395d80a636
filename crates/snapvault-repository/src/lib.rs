//! # snapvault-repository: Snapshot repository core
//!
//! Everything a node needs to read and write one snapshot repository over a
//! shared [`BlobStore`](snapvault_blobstore::BlobStore):
//!
//! - **[`RepositoryData`]**: the root metadata document, versioned by format
//! - **[`GenerationTracker`]**: create-if-absent commits of `index-N` blobs,
//!   coordinated through the generation pointers in cluster state
//! - **[`Repository`]**: finalize and delete state machines with bounded
//!   retries on concurrent modification
//! - **[`check_consistency`]**: a full walk of the blob store against the
//!   root metadata, also used to find blobs safe to clean up
//! - **[`Faultable`]**: the capability test repositories expose to pause and
//!   fail their own blob operations
//!
//! # Blob Layout
//!
//! ```text
//! index-<N>                        root metadata at generation N
//! index.latest                     8-byte big-endian N (advisory)
//! snap-<uuid>.dat                  snapshot info
//! meta-<uuid>.dat                  global metadata
//! indices/<index-id>/meta-<b>.dat  index metadata
//! indices/<index-id>/<shard>/index-<gen>       shard snapshot list
//! indices/<index-id>/<shard>/snap-<uuid>.dat   shard snapshot
//! indices/<index-id>/<shard>/__<uuid>          data
//! ```

mod consistency;
mod error;
mod fault;
mod generation;
mod index_meta;
mod repository;
mod repository_data;
mod shard;
mod shard_generations;
mod snapshot_info;

pub mod format;
pub mod paths;

pub use consistency::{ConsistencyReport, Violation, ViolationKind, check_consistency};
pub use error::{RepositoryError, Result};
pub use fault::{BlobOp, BlockCondition, Faultable};
pub use generation::GenerationTracker;
pub use index_meta::{IndexMetaDataGenerations, IndexMetadataSnapshot};
pub use repository::{
    BlobStoreRepository, COMPRESS_SETTING, CleanupResult, DEFAULT_MAX_FINALIZE_RETRIES, FinalizeSnapshot,
    LOCATION_SETTING, READONLY_SETTING, Repository, RepositoryOptions, SnapshotMetadata,
    legacy_shard_generations,
};
pub use repository_data::{NewSnapshot, RepositoryData};
pub use shard::{FileInfo, ShardFile, ShardSnapshot, ShardSnapshotRequest, ShardSnapshots, SnapshotFiles};
pub use shard_generations::ShardGenerations;
pub use snapshot_info::{SnapshotInfo, SnapshotShardFailure};

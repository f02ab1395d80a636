//! # snapvault-snapshots: Snapshot orchestration
//!
//! Runs snapshot creation and deletion across the nodes of a cluster:
//!
//! - **[`SnapshotsService`]**: accepts requests, assigns shard snapshots to
//!   data nodes, queues shards already being snapshotted, and finalizes on
//!   the master one snapshot per repository at a time
//! - **[`Node`]**: a node's roles, bounded snapshot pool, shard contents, and
//!   repository instances
//! - **[`RepositoryTypes`]**: the explicit registry of repository factories
//!   every node builds its instances from
//!
//! # Example
//!
//! ```ignore
//! let service = SnapshotsService::new(cluster, RepositoryTypes::default(), config);
//! service.start_node("master-0", NodeRoles::MASTER)?;
//! service.start_node("data-0", NodeRoles::DATA)?;
//! service.put_repository("backups", FS_TYPE, settings, true)?;
//! service.create_index("logs", 2)?;
//! let info = service.create_snapshot(CreateSnapshotRequest::new("backups", "nightly"))?;
//! ```

mod completion;
mod create;
mod delete;
mod error;
mod node;
mod repositories;
mod service;
mod shard_store;

pub mod pattern;

pub use completion::{DeleteFuture, SnapshotFuture};
pub use create::CreateSnapshotRequest;
pub use error::{Result, SnapshotError};
pub use node::{Node, NodeRoles};
pub use repositories::{
    FS_TYPE, FsRepositoryFactory, RepositoriesService, RepositoryContext, RepositoryFactory, RepositoryTypes,
};
pub use service::SnapshotsService;
pub use shard_store::{DOCS_PER_SEGMENT, ShardStore};

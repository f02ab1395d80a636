//! Error types for cluster state coordination.

use std::time::Duration;

use thiserror::Error;

/// Cluster state errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// A bounded wait expired before its condition held.
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    /// The cluster service was shut down.
    #[error("cluster service is closed")]
    Closed,

    /// A node was stopped while something waited on it.
    #[error("node [{node}] closed while waiting for {what}")]
    NodeClosed { node: String, what: String },
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

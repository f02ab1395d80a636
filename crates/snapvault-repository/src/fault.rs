//! Fault-injection capability.
//!
//! Repositories that can pause or fail their own blob operations implement
//! [`Faultable`]. Callers reach it through
//! [`Repository::as_faultable`](crate::Repository::as_faultable) and never
//! depend on a concrete repository type.

use std::time::Duration;

use snapvault_cluster::ClusterError;

use crate::paths::BlobRole;

/// Kind of blob operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobOp {
    Read,
    Write,
    Delete,
}

/// An operation to pause at. At most one is armed per repository instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockCondition {
    /// Writes of root `index-N` blobs.
    WriteIndexFile,
    /// Writes of root `index-N` blobs, failing once released.
    BlockAndFailWriteIndexFile,
    /// Deletes of stale root `index-N` blobs.
    DeleteIndexFile,
    /// Writes of `snap-<uuid>.dat` blobs at any level, failing once released.
    BlockAndFailWriteSnapFiles,
    /// Reads and writes of shard data blobs.
    DataFiles,
    /// Every operation on every blob.
    AnyFile,
}

impl BlockCondition {
    pub fn matches(self, op: BlobOp, role: BlobRole) -> bool {
        match self {
            Self::WriteIndexFile | Self::BlockAndFailWriteIndexFile => {
                op == BlobOp::Write && role == BlobRole::RootIndexN
            }
            Self::DeleteIndexFile => op == BlobOp::Delete && role == BlobRole::RootIndexN,
            Self::BlockAndFailWriteSnapFiles => {
                op == BlobOp::Write && matches!(role, BlobRole::RootSnap | BlobRole::ShardSnap)
            }
            Self::DataFiles => op != BlobOp::Delete && role == BlobRole::Data,
            Self::AnyFile => true,
        }
    }

    /// Returns true if the paused operation fails instead of proceeding.
    pub fn fails_on_release(self) -> bool {
        matches!(self, Self::BlockAndFailWriteIndexFile | Self::BlockAndFailWriteSnapFiles)
    }
}

/// Deterministic blocking and failure injection.
///
/// `blocked()` is true from the moment an operation starts waiting on the
/// armed condition until `unblock()` releases it.
pub trait Faultable: Send + Sync {
    /// Arms `condition`, disarming any previous one.
    fn block_on(&self, condition: BlockCondition);

    /// Makes reads fail once the next block is released.
    fn set_fail_reads_after_unblock(&self, fail: bool);

    /// Disarms the block condition and releases every waiting operation.
    fn unblock(&self);

    fn blocked(&self) -> bool;

    /// Waits until an operation is blocked, bounded by `timeout`.
    fn wait_for_block(&self, timeout: Duration) -> Result<(), ClusterError>;

    /// Number of failures injected so far.
    fn failure_count(&self) -> u64;

    fn set_block_on_write_index_file(&self) {
        self.block_on(BlockCondition::WriteIndexFile);
    }

    fn set_block_and_fail_on_write_index_file(&self) {
        self.block_on(BlockCondition::BlockAndFailWriteIndexFile);
    }

    fn set_block_on_delete_index_file(&self) {
        self.block_on(BlockCondition::DeleteIndexFile);
    }

    fn set_block_and_fail_on_write_snap_files(&self) {
        self.block_on(BlockCondition::BlockAndFailWriteSnapFiles);
    }

    fn block_on_data_files(&self) {
        self.block_on(BlockCondition::DataFiles);
    }

    fn set_block_on_any_files(&self) {
        self.block_on(BlockCondition::AnyFile);
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(BlockCondition::WriteIndexFile, BlobOp::Write, BlobRole::RootIndexN, true)]
    #[test_case(BlockCondition::WriteIndexFile, BlobOp::Write, BlobRole::IndexLatest, false)]
    #[test_case(BlockCondition::WriteIndexFile, BlobOp::Delete, BlobRole::RootIndexN, false)]
    #[test_case(BlockCondition::DeleteIndexFile, BlobOp::Delete, BlobRole::RootIndexN, true)]
    #[test_case(BlockCondition::DeleteIndexFile, BlobOp::Write, BlobRole::RootIndexN, false)]
    #[test_case(BlockCondition::BlockAndFailWriteSnapFiles, BlobOp::Write, BlobRole::RootSnap, true)]
    #[test_case(BlockCondition::BlockAndFailWriteSnapFiles, BlobOp::Write, BlobRole::ShardSnap, true)]
    #[test_case(BlockCondition::BlockAndFailWriteSnapFiles, BlobOp::Read, BlobRole::RootSnap, false)]
    #[test_case(BlockCondition::DataFiles, BlobOp::Read, BlobRole::Data, true)]
    #[test_case(BlockCondition::DataFiles, BlobOp::Write, BlobRole::ShardIndexN, false)]
    #[test_case(BlockCondition::AnyFile, BlobOp::Delete, BlobRole::Other, true)]
    fn condition_matches(condition: BlockCondition, op: BlobOp, role: BlobRole, expected: bool) {
        assert_eq!(condition.matches(op, role), expected);
    }

    #[test]
    fn only_block_and_fail_conditions_fail() {
        assert!(BlockCondition::BlockAndFailWriteIndexFile.fails_on_release());
        assert!(BlockCondition::BlockAndFailWriteSnapFiles.fails_on_release());
        assert!(!BlockCondition::WriteIndexFile.fails_on_release());
        assert!(!BlockCondition::DataFiles.fails_on_release());
    }
}

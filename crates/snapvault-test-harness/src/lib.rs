//! # snapvault-test-harness: Snapshot test infrastructure
//!
//! - **[`MockRepository`]**: an `fs` repository whose blob operations can be
//!   paused, failed on release, or failed at random seeded rates
//! - **[`SnapshotTestHarness`]**: an in-process cluster with helpers for
//!   snapshots, deletions, blocking, and cluster state waits, plus the
//!   end-of-test repository consistency check
//! - **[`BwcBackdoor`]**: writes that simulate repositories left behind by
//!   older releases
//!
//! # Example
//!
//! ```ignore
//! let harness = SnapshotTestHarness::start(2)?;
//! harness.create_repository("repo", MOCK_TYPE)?;
//! harness.create_index_with_random_docs("logs", 2, 100)?;
//! let master = harness.block_master_on_write_index_file("repo")?;
//! let snapshot = harness.start_full_snapshot("repo", "snap", false)?;
//! harness.wait_for_block(&master, "repo")?;
//! harness.unblock_node("repo", &master)?;
//! snapshot.wait(Duration::from_secs(30))?;
//! harness.finish()?;
//! ```

mod bwc;
mod error;
mod fault;
mod harness;
mod logging;
mod mock;

pub use bwc::BwcBackdoor;
pub use error::{HarnessError, InjectedFailure, Result, is_injected};
pub use fault::{FaultInjectingBlobStore, FaultInjector, RandomFailures};
pub use harness::{OLD_VERSION_SNAPSHOT_PREFIX, SnapshotTestHarness};
pub use logging::init_test_logging;
pub use mock::{
    MOCK_TYPE, MockRepository, MockRepositoryFactory, RANDOM_CONTROL_IO_EXCEPTION_RATE,
    RANDOM_DATA_FILE_IO_EXCEPTION_RATE, SEED_SETTING, test_repository_types,
};

//! Fault-injecting blob store.
//!
//! [`FaultInjectingBlobStore`] wraps a real store and consults a shared
//! [`FaultInjector`] before every operation. The injector can:
//!
//! - pause operations matching an armed [`BlockCondition`] until released
//! - fail the paused operation on release, for block-and-fail conditions
//! - fail every read after release, modeling a node that recovers degraded
//! - fail random reads and writes at seeded rates
//!
//! Paused operations wait on a condition variable, never a spin loop.

use std::{
    fmt,
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use snapvault_blobstore::{BlobStore, BlobStoreError, Result};
use snapvault_cluster::ClusterError;
use snapvault_repository::{BlobOp, BlockCondition, Faultable, paths::BlobRole};
use tracing::{debug, info};

use crate::InjectedFailure;

/// Seeded rates of random I/O failures.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RandomFailures {
    /// Failure rate of reads and writes of metadata blobs.
    pub control_rate: f64,
    /// Failure rate of reads and writes of shard data blobs.
    pub data_rate: f64,
    pub seed: u64,
}

#[derive(Debug)]
struct FaultState {
    condition: Option<BlockCondition>,
    blocked: bool,
    /// Bumped by every `unblock`; waiters leave when it changes.
    release_epoch: u64,
    fail_reads_after_unblock: bool,
    reads_failing: bool,
    closed: bool,
    rng: SmallRng,
}

/// Block and failure switches shared by every blob operation of one
/// repository instance.
pub struct FaultInjector {
    node: String,
    repository: String,
    random: RandomFailures,
    state: Mutex<FaultState>,
    changed: Condvar,
    failures: AtomicU64,
}

impl fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultInjector")
            .field("node", &self.node)
            .field("repository", &self.repository)
            .field("random", &self.random)
            .field("failures", &self.failures.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl FaultInjector {
    pub fn new(node: impl Into<String>, repository: impl Into<String>, random: RandomFailures) -> Self {
        Self {
            node: node.into(),
            repository: repository.into(),
            random,
            state: Mutex::new(FaultState {
                condition: None,
                blocked: false,
                release_epoch: 0,
                fail_reads_after_unblock: false,
                reads_failing: false,
                closed: false,
                rng: SmallRng::seed_from_u64(random.seed),
            }),
            changed: Condvar::new(),
            failures: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().expect("fault injector lock poisoned")
    }

    fn inject(&self, op: BlobOp, blob: &str) -> BlobStoreError {
        self.failures.fetch_add(1, Ordering::Relaxed);
        debug!(node = %self.node, repository = %self.repository, ?op, blob, "injecting failure");
        BlobStoreError::io(
            blob,
            std::io::Error::other(InjectedFailure {
                node: self.node.clone(),
                repository: self.repository.clone(),
                op,
                blob: blob.to_string(),
            }),
        )
    }

    fn closed_error(&self, blob: &str) -> BlobStoreError {
        BlobStoreError::io(
            blob,
            std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                format!("node [{}] closed", self.node),
            ),
        )
    }

    /// Applies the armed faults to one operation. Blocks while a matching
    /// condition is armed.
    pub fn before(&self, op: BlobOp, blob: &str) -> Result<()> {
        let role = BlobRole::classify(blob);
        let mut state = self.lock();
        if state.closed {
            return Err(self.closed_error(blob));
        }
        if op == BlobOp::Read && state.reads_failing {
            return Err(self.inject(op, blob));
        }

        if let Some(condition) = state.condition
            && condition.matches(op, role)
        {
            let epoch = state.release_epoch;
            state.blocked = true;
            self.changed.notify_all();
            info!(node = %self.node, repository = %self.repository, ?op, blob, ?condition, "blocking");
            state = self
                .changed
                .wait_while(state, |state| state.release_epoch == epoch && !state.closed)
                .expect("fault injector lock poisoned");
            if state.closed {
                return Err(self.closed_error(blob));
            }
            debug!(node = %self.node, repository = %self.repository, blob, "released");
            if condition.fails_on_release() {
                return Err(self.inject(op, blob));
            }
        }

        let rate = match role {
            BlobRole::Data => self.random.data_rate,
            _ => self.random.control_rate,
        };
        if op != BlobOp::Delete && rate > 0.0 && state.rng.gen_bool(rate.min(1.0)) {
            return Err(self.inject(op, blob));
        }
        Ok(())
    }

    /// Fails every waiting and future operation.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.blocked = false;
        self.changed.notify_all();
    }
}

impl Faultable for FaultInjector {
    fn block_on(&self, condition: BlockCondition) {
        debug!(node = %self.node, repository = %self.repository, ?condition, "arming block");
        self.lock().condition = Some(condition);
    }

    fn set_fail_reads_after_unblock(&self, fail: bool) {
        let mut state = self.lock();
        state.fail_reads_after_unblock = fail;
        if !fail {
            state.reads_failing = false;
        }
    }

    fn unblock(&self) {
        let mut state = self.lock();
        state.condition = None;
        state.blocked = false;
        state.release_epoch += 1;
        if state.fail_reads_after_unblock {
            state.reads_failing = true;
        }
        self.changed.notify_all();
    }

    fn blocked(&self) -> bool {
        self.lock().blocked
    }

    fn wait_for_block(&self, timeout: Duration) -> std::result::Result<(), ClusterError> {
        let what = || format!("[{}] repository [{}] to block", self.node, self.repository);
        let state = self.lock();
        let (state, wait) = self
            .changed
            .wait_timeout_while(state, timeout, |state| !state.blocked && !state.closed)
            .expect("fault injector lock poisoned");
        if state.blocked {
            return Ok(());
        }
        if state.closed {
            return Err(ClusterError::NodeClosed {
                node: self.node.clone(),
                what: what(),
            });
        }
        debug_assert!(wait.timed_out());
        Err(ClusterError::Timeout { what: what(), timeout })
    }

    fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// A [`BlobStore`] whose operations pass through a [`FaultInjector`].
#[derive(Debug)]
pub struct FaultInjectingBlobStore {
    inner: Arc<dyn BlobStore>,
    injector: Arc<FaultInjector>,
}

impl FaultInjectingBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>, injector: Arc<FaultInjector>) -> Self {
        Self { inner, injector }
    }

    pub fn injector(&self) -> &Arc<FaultInjector> {
        &self.injector
    }
}

impl BlobStore for FaultInjectingBlobStore {
    fn put(&self, name: &str, data: Bytes, if_absent: bool) -> Result<()> {
        self.injector.before(BlobOp::Write, name)?;
        self.inner.put(name, data, if_absent)
    }

    fn get(&self, name: &str) -> Result<Bytes> {
        self.injector.before(BlobOp::Read, name)?;
        self.inner.get(name)
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.injector.before(BlobOp::Delete, name)?;
        self.inner.delete(name)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.injector.before(BlobOp::Read, prefix)?;
        self.inner.list(prefix)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        self.injector.before(BlobOp::Read, name)?;
        self.inner.exists(name)
    }

    fn size(&self, name: &str) -> Result<u64> {
        self.injector.before(BlobOp::Read, name)?;
        self.inner.size(name)
    }
}

//! Cluster state publication.
//!
//! [`ClusterService`] serializes state updates the way an elected master
//! does: each update sees the latest state, returns its successor, and is
//! published atomically. Observers block on a condition variable instead of
//! polling.

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use crate::{ClusterError, ClusterState, Result};

/// Publishes and observes [`ClusterState`] updates.
#[derive(Debug, Default)]
pub struct ClusterService {
    current: Mutex<Arc<ClusterState>>,
    changed: Condvar,
}

impl ClusterService {
    pub fn new(initial: ClusterState) -> Self {
        Self {
            current: Mutex::new(Arc::new(initial)),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Arc<ClusterState>> {
        self.current.lock().expect("cluster state lock poisoned")
    }

    /// Returns the current state.
    pub fn state(&self) -> Arc<ClusterState> {
        Arc::clone(&self.lock())
    }

    /// Applies `update` to the current state and publishes the result.
    ///
    /// Updates are applied one at a time. If `update` returns an error the
    /// state is left unchanged. If it returns a state equal to the current
    /// one, nothing is published.
    pub fn submit_update<F, E>(&self, source: &str, update: F) -> std::result::Result<Arc<ClusterState>, E>
    where
        F: FnOnce(&ClusterState) -> std::result::Result<ClusterState, E>,
    {
        let mut current = self.lock();
        let next = update(&current)?;
        if next == **current {
            trace!(source, version = current.version(), "cluster state unchanged");
            return Ok(Arc::clone(&current));
        }
        let version = current.version() + 1;
        let next = Arc::new(next.with_version(version));
        *current = Arc::clone(&next);
        drop(current);
        debug!(source, version, "published cluster state");
        self.changed.notify_all();
        Ok(next)
    }

    /// Blocks until `predicate` holds for the current state, or `timeout`
    /// elapses.
    pub fn await_state<P>(
        &self,
        description: &str,
        timeout: Duration,
        mut predicate: P,
    ) -> Result<Arc<ClusterState>>
    where
        P: FnMut(&ClusterState) -> bool,
    {
        let guard = self.lock();
        let (guard, result) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| !predicate(state))
            .expect("cluster state lock poisoned");
        if result.timed_out() {
            debug!(what = description, ?timeout, "cluster state wait timed out");
            return Err(ClusterError::Timeout {
                what: description.to_string(),
                timeout,
            });
        }
        Ok(Arc::clone(&guard))
    }

    /// Waits until the state version moves past `version`, bounded by `timeout`.
    ///
    /// Returns `false` on timeout without treating it as an error; used by
    /// loops that re-check their own conditions.
    pub fn await_change(&self, version: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, deadline.saturating_duration_since(Instant::now()), |state| {
                state.version() <= version
            })
            .expect("cluster state lock poisoned");
        guard.version() > version
    }
}

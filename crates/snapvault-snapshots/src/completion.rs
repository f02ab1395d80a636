//! Handles for operations that complete on another thread.

use std::{
    fmt::Debug,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use snapvault_cluster::ClusterError;
use snapvault_repository::SnapshotInfo;
use snapvault_types::SnapshotId;

use crate::{Result, SnapshotError};

#[derive(Debug)]
struct Slot<T> {
    result: Option<Result<T>>,
    taken: bool,
}

/// One-shot result shared between the thread completing an operation and
/// the caller waiting for it.
#[derive(Debug)]
pub(crate) struct Completion<T> {
    slot: Mutex<Slot<T>>,
    done: Condvar,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot {
                result: None,
                taken: false,
            }),
            done: Condvar::new(),
        })
    }

    /// Stores the result. Only the first call has an effect.
    pub(crate) fn complete(&self, result: Result<T>) {
        let mut slot = self.slot.lock().expect("completion lock poisoned");
        if slot.result.is_none() && !slot.taken {
            slot.result = Some(result);
            self.done.notify_all();
        }
    }

    fn is_done(&self) -> bool {
        let slot = self.slot.lock().expect("completion lock poisoned");
        slot.result.is_some() || slot.taken
    }

    fn wait(&self, what: &str, timeout: Duration) -> Result<T> {
        let slot = self.slot.lock().expect("completion lock poisoned");
        let (mut slot, wait) = self
            .done
            .wait_timeout_while(slot, timeout, |slot| slot.result.is_none() && !slot.taken)
            .expect("completion lock poisoned");
        if wait.timed_out() {
            return Err(SnapshotError::Cluster(ClusterError::Timeout {
                what: what.to_string(),
                timeout,
            }));
        }
        slot.taken = true;
        slot.result.take().unwrap_or(Err(SnapshotError::Cluster(ClusterError::Closed)))
    }
}

/// A snapshot started with [`start_snapshot`](crate::SnapshotsService::start_snapshot).
#[derive(Debug)]
pub struct SnapshotFuture {
    pub(crate) snapshot: SnapshotId,
    pub(crate) completion: Arc<Completion<SnapshotInfo>>,
}

impl SnapshotFuture {
    pub fn snapshot(&self) -> &SnapshotId {
        &self.snapshot
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }

    /// Waits for the snapshot to reach a terminal state.
    pub fn wait(self, timeout: Duration) -> Result<SnapshotInfo> {
        self.completion
            .wait(&format!("snapshot [{}] to complete", self.snapshot), timeout)
    }
}

/// A deletion started with
/// [`start_delete_snapshots`](crate::SnapshotsService::start_delete_snapshots).
#[derive(Debug)]
pub struct DeleteFuture {
    pub(crate) repository: String,
    pub(crate) completion: Arc<Completion<Vec<SnapshotId>>>,
}

impl DeleteFuture {
    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }

    /// Waits for the deletion; returns the snapshots it removed.
    pub fn wait(self, timeout: Duration) -> Result<Vec<SnapshotId>> {
        self.completion
            .wait(&format!("deletion in [{}] to complete", self.repository), timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn waiter_receives_result_from_other_thread() {
        let completion = Completion::<u32>::new();
        let worker = {
            let completion = Arc::clone(&completion);
            thread::spawn(move || completion.complete(Ok(7)))
        };

        assert_eq!(completion.wait("value", Duration::from_secs(5)).unwrap(), 7);
        worker.join().unwrap();
    }

    #[test]
    fn only_first_result_is_kept() {
        let completion = Completion::<u32>::new();
        completion.complete(Ok(1));
        completion.complete(Ok(2));
        assert!(completion.is_done());
        assert_eq!(completion.wait("value", Duration::from_secs(1)).unwrap(), 1);
    }

    #[test]
    fn wait_times_out_with_description() {
        let completion = Completion::<u32>::new();
        let err = completion.wait("nothing", Duration::from_millis(10)).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::Cluster(ClusterError::Timeout { ref what, .. }) if what == "nothing"
        ));
    }
}

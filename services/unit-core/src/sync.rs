//! Serialization of update execution.
//!
//! UnitConfig, FOTA, and SOTA updates must never overlap: the firmware and
//! software managers funnel their update phases through one shared
//! [`UpdateSynchronizer`]. Submissions run one at a time in FIFO order; a
//! submission whose cancel signal fires before its turn is dropped
//! silently.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

/// FIFO single-slot executor shared across update managers.
///
/// Clones share the slot; the handle lives as long as the engine.
#[derive(Clone)]
pub struct UpdateSynchronizer {
    // tokio's mutex hands the lock to waiters in FIFO order, which is
    // exactly the required submission-order guarantee.
    slot: Arc<Mutex<()>>,
}

impl UpdateSynchronizer {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(())),
        }
    }

    /// Run `task` once the slot frees up.
    ///
    /// Returns the task's output, or `None` if `cancel` fired before its
    /// turn. A task that has started always runs to completion.
    pub async fn execute<F, Fut, T>(&self, mut cancel: watch::Receiver<bool>, task: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if *cancel.borrow() {
            return None;
        }

        let guard = tokio::select! {
            guard = self.slot.lock() => Some(guard),
            result = cancel.wait_for(|canceled| *canceled) => {
                // A closed cancel channel means the owner is gone; treat it
                // as cancellation as well.
                let _ = result;
                None
            }
        };

        let guard = guard?;
        let result = task().await;
        drop(guard);
        Some(result)
    }
}

impl Default for UpdateSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

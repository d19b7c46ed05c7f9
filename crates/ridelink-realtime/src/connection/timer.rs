//! Owned, cancellable scheduled tasks.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

/// A spawned task that can be cancelled exactly once.
///
/// Dropping the handle detaches the task; only [`ScheduledTask::cancel`]
/// stops it.
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawn a task on the current runtime.
    pub fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            handle: tokio::spawn(future),
        }
    }

    /// Spawn a task that runs `future` after `delay`.
    pub fn after<F>(name: &'static str, delay: Duration, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(name, async move {
            tokio::time::sleep(delay).await;
            future.await;
        })
    }

    /// Task label used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the task has run to completion (or was cancelled).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the task.
    pub fn cancel(self) {
        trace!(task = self.name, "Cancelling scheduled task");
        self.handle.abort();
    }

    /// Let the task keep running without an owner.
    pub fn detach(self) {
        trace!(task = self.name, "Detaching scheduled task");
    }
}

/// Holds at most one task of a given kind.
#[derive(Debug, Default)]
pub struct TimerSlot {
    task: Mutex<Option<ScheduledTask>>,
}

impl TimerSlot {
    /// Empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `task`, cancelling any task already in the slot.
    pub fn replace(&self, task: ScheduledTask) {
        let previous = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Cancel the pending task, if any. Returns whether one was cancelled.
    pub fn cancel(&self) -> bool {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        match task {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    /// Empty the slot without stopping the task. Used by a task that is
    /// about to do its work so that a later `replace` cannot abort it.
    pub fn clear(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.detach();
        }
    }

    /// Whether a task that has not finished yet is installed.
    pub fn is_pending(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_replace_cancels_previous() {
        let fired = Arc::new(AtomicU32::new(0));
        let slot = TimerSlot::new();

        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            slot.replace(ScheduledTask::after(
                "test",
                Duration::from_secs(1),
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_run() {
        let fired = Arc::new(AtomicU32::new(0));
        let slot = TimerSlot::new();
        {
            let fired = Arc::clone(&fired);
            slot.replace(ScheduledTask::after(
                "test",
                Duration::from_secs(1),
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }
        assert!(slot.is_pending());
        assert!(slot.cancel());
        assert!(!slot.cancel());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}

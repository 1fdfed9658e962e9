use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{futures::Notified, Notify};

use crate::error::TreeError;

#[derive(Default)]
struct TasksInner {
    next_id: AtomicU64,
    active: Mutex<BTreeMap<u64, String>>,
    failures: AtomicU64,
    wake: Notify,
}

/// The set of in-flight backend work (writes, moves, index passes, debounce timers), keyed by
/// a monotonically increasing id. Entries leave the set when their guard drops, whether the
/// work succeeded or failed.
#[derive(Clone, Default)]
pub struct ActiveTasks {
    inner: Arc<TasksInner>,
}

/// Keeps one entry in [`ActiveTasks`] alive.
pub struct TaskGuard {
    id: u64,
    tasks: ActiveTasks,
}

impl TaskGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tasks.inner.active.lock().remove(&self.id);
        self.tasks.wake();
    }
}

impl ActiveTasks {
    pub fn new() -> ActiveTasks {
        ActiveTasks::default()
    }

    pub fn register(&self, label: impl Into<String>) -> TaskGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.active.lock().insert(id, label.into());
        TaskGuard {
            id,
            tasks: self.clone(),
        }
    }

    /// Run `work` on the runtime as a registered task. Failures are logged and counted.
    pub fn spawn<F>(&self, label: impl Into<String>, work: F) -> u64
    where
        F: Future<Output = Result<(), TreeError>> + Send + 'static,
    {
        let label = label.into();
        let guard = self.register(label.clone());
        let id = guard.id;
        let tasks = self.clone();
        tokio::spawn(async move {
            if let Err(e) = work.await {
                tasks.inner.failures.fetch_add(1, Ordering::SeqCst);
                tracing::error!("[ActiveTasks] task {} ({}) failed: {}", id, label, e);
            }
            drop(guard);
        });
        id
    }

    pub fn is_empty(&self) -> bool {
        self.inner.active.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.active.lock().len()
    }

    pub fn labels(&self) -> Vec<String> {
        self.inner.active.lock().values().cloned().collect()
    }

    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::SeqCst)
    }

    /// Wake everyone waiting on [`ActiveTasks::notified`].
    pub fn wake(&self) {
        self.inner.wake.notify_waiters();
    }

    /// Resolves on the next [`ActiveTasks::wake`]. Call `enable()` on the pinned future
    /// before checking the condition being waited for.
    pub fn notified(&self) -> Notified<'_> {
        self.inner.wake.notified()
    }
}

//! In-flight transfer registry
//!
//! Upload and download calls are identified by a caller-supplied task id.
//! The registry maps each id to the handle needed to abort the transfer and
//! the flag that silences its progress emissions. Entries are removed when
//! the call resolves, so the map tracks only live work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::AbortHandle;

#[derive(Debug)]
struct InFlightTask {
    base_url: String,
    abort: AbortHandle,
    cancelled: Arc<AtomicBool>,
}

/// Concurrent map of live transfer tasks keyed by task id
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, InFlightTask>>,
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task with the cancellation flag shared with its progress
    /// tracker.
    ///
    /// A task id maps to at most one in-flight transfer; registering an id
    /// that is still live replaces the stale entry after aborting it.
    pub(crate) fn register(
        &self,
        task_id: &str,
        base_url: &str,
        abort: AbortHandle,
        cancelled: Arc<AtomicBool>,
    ) {
        let task = InFlightTask {
            base_url: base_url.to_string(),
            abort,
            cancelled,
        };
        if let Some(stale) = self.tasks.lock().unwrap().insert(task_id.to_string(), task) {
            tracing::warn!(task_id, "replacing stale in-flight task");
            stale.cancelled.store(true, Ordering::Release);
            stale.abort.abort();
        }
    }

    /// Remove a resolved task. No-op when the id is unknown.
    pub(crate) fn complete(&self, task_id: &str) {
        self.tasks.lock().unwrap().remove(task_id);
    }

    /// Cancel a task by id.
    ///
    /// Aborts the transfer, suppresses any further progress events and
    /// removes the entry. Unknown or already-completed ids are a no-op.
    pub fn cancel(&self, task_id: &str) {
        if let Some(task) = self.tasks.lock().unwrap().remove(task_id) {
            tracing::debug!(task_id, "cancelling in-flight task");
            task.cancelled.store(true, Ordering::Release);
            task.abort.abort();
        }
    }

    /// Cancel every task belonging to a session
    pub(crate) fn cancel_all_for(&self, base_url: &str) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|task_id, task| {
            if task.base_url == base_url {
                tracing::debug!(task_id, base_url, "cancelling task for invalidated session");
                task.cancelled.store(true, Ordering::Release);
                task.abort.abort();
                false
            } else {
                true
            }
        });
    }

    /// Number of live tasks
    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Whether no task is in flight
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

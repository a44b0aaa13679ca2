use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info};

type TaskMap = HashMap<String, (u64, JoinHandle<()>)>;

/// Named background tasks that remove themselves when they finish.
///
/// Spawning under a name that is already running aborts the older task.
#[derive(Default)]
pub struct TaskTracker {
    tasks: Arc<Mutex<TaskMap>>,
    next_id: AtomicU64,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);
        let task_name = name.clone();

        // Insert under the lock that the task needs for its own removal,
        // so a task that finishes instantly cannot race its registration.
        let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            future.await;
            let mut tasks = tasks.lock().unwrap_or_else(PoisonError::into_inner);
            // A replacement may have taken the name in the meantime.
            if tasks.get(&task_name).is_some_and(|(current, _)| *current == id) {
                tasks.remove(&task_name);
            }
            debug!("task '{}' finished", task_name);
        });
        if let Some((_, old)) = guard.insert(name.clone(), (id, handle)) {
            debug!("task '{}' replaced", name);
            old.abort();
        }
    }

    pub fn cancel(&self, name: &str) -> bool {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        match removed {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let drained: Vec<(String, (u64, JoinHandle<()>))> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        let count = drained.len();
        for (name, (_, handle)) in drained {
            handle.abort();
            debug!("cancelled task '{}'", name);
        }
        if count > 0 {
            info!("cancelled {} background tasks", count);
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

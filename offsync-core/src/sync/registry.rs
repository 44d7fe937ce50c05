//! Named background tasks with keep-existing semantics

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::task::JoinHandle;

/// Registry of long-lived tasks keyed by name.
///
/// Registering a name that is already running keeps the running task and
/// discards the new one, so repeated scheduling never stacks duplicates.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn via `start` unless `name` is already live. Returns whether a
    /// new task was started.
    pub fn insert_if_absent<F>(&self, name: &str, start: F) -> bool
    where
        F: FnOnce() -> JoinHandle<()>,
    {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(existing) = tasks.get(name) {
            if !existing.is_finished() {
                return false;
            }
        }
        tasks.insert(name.to_string(), start());
        true
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .unwrap()
            .get(name)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Abort and forget `name`. Returns whether it was live.
    pub fn cancel(&self, name: &str) -> bool {
        match self.tasks.lock().unwrap().remove(name) {
            Some(handle) => {
                let live = !handle.is_finished();
                handle.abort();
                live
            }
            None => false,
        }
    }

    /// Abort everything.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (name, handle) in tasks.drain() {
            tracing::debug!(task = %name, "Stopping task");
            handle.abort();
        }
    }
}

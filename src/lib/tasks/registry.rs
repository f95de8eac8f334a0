use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::state::valid_state_transition;
use super::types::{Task, TaskSpec, TaskState};
use crate::lib::error::{ControllerError, ControllerResult};

/// One registered task: a working copy mutated under the per-task lock and a
/// published view that readers take without waiting on substrate calls.
struct TaskSlot {
    seq: u64,
    working: Arc<Mutex<Task>>,
    view: RwLock<Task>,
}

/// Live tasks keyed by name. Mutations of one task are serialized through its
/// own lock; different tasks never wait on each other.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<TaskSlot>>>,
    next_seq: AtomicU64,
}

/// Exclusive access to one task. The view is republished on drop.
pub struct TaskGuard {
    slot: Arc<TaskSlot>,
    task: OwnedMutexGuard<Task>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a `PENDING` task and returns it locked, so nothing else can
    /// act on the name until the create either commits or is discarded.
    pub fn begin_create(&self, spec: &TaskSpec) -> ControllerResult<TaskGuard> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&spec.name) {
            return Err(ControllerError::AlreadyExists(spec.name.clone()));
        }

        let task = Task::pending(spec);
        let slot = Arc::new(TaskSlot {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            working: Arc::new(Mutex::new(task.clone())),
            view: RwLock::new(task),
        });
        let guard = slot.working.clone().try_lock_owned().map_err(|_| {
            ControllerError::ConsistencyViolation(format!(
                "fresh slot for '{}' was already locked",
                spec.name
            ))
        })?;
        tasks.insert(spec.name.clone(), slot.clone());
        debug!(task = %spec.name, "registered pending task");

        Ok(TaskGuard { slot, task: guard })
    }

    /// Waits for exclusive access to a task. Fails with `NotFound` if the task
    /// is unknown or was removed while waiting.
    pub async fn lock(&self, name: &str) -> ControllerResult<TaskGuard> {
        let slot = self.slot(name)?;
        let task = slot.working.clone().lock_owned().await;

        let still_registered = self
            .tasks
            .read()
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, &slot));
        if !still_registered {
            return Err(ControllerError::NotFound(name.to_string()));
        }

        Ok(TaskGuard { slot, task })
    }

    pub fn get(&self, name: &str) -> ControllerResult<Task> {
        Ok(self.slot(name)?.view.read().clone())
    }

    /// All tasks in creation order.
    pub fn list(&self) -> Vec<Task> {
        let mut slots: Vec<Arc<TaskSlot>> = self.tasks.read().values().cloned().collect();
        slots.sort_by_key(|slot| slot.seq);
        slots.iter().map(|slot| slot.view.read().clone()).collect()
    }

    pub fn find_by_service(&self, service_name: &str) -> Option<Task> {
        self.tasks
            .read()
            .values()
            .map(|slot| slot.view.read())
            .find(|task| task.service_name == service_name)
            .map(|task| task.clone())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    /// Deletes the entry the guard refers to and returns its final state.
    pub fn remove(&self, guard: TaskGuard) -> Task {
        let mut tasks = self.tasks.write();
        let owned = tasks
            .get(&guard.name)
            .is_some_and(|current| Arc::ptr_eq(current, &guard.slot));
        if owned {
            tasks.remove(&guard.name);
            debug!(task = %guard.name, "removed task");
        }
        guard.task.clone()
    }

    fn slot(&self, name: &str) -> ControllerResult<Arc<TaskSlot>> {
        self.tasks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(name.to_string()))
    }
}

impl TaskGuard {
    pub fn transition(&mut self, to: TaskState) -> ControllerResult<()> {
        self.check_transition(to)?;
        self.task.state = to;
        Ok(())
    }

    /// Fails with `InvalidState` unless the task may move to `to`; changes nothing.
    pub fn check_transition(&self, to: TaskState) -> ControllerResult<()> {
        if !valid_state_transition(&self.task.state, &to) {
            return Err(ControllerError::InvalidState {
                name: self.task.name.clone(),
                from: self.task.state,
                to,
            });
        }
        Ok(())
    }

    /// Makes the working copy visible to readers before the guard is released.
    pub fn publish(&self) {
        *self.slot.view.write() = self.task.clone();
    }

    pub fn snapshot(&self) -> Task {
        self.task.clone()
    }
}

impl Deref for TaskGuard {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.task
    }
}

impl DerefMut for TaskGuard {
    fn deref_mut(&mut self) -> &mut Task {
        &mut self.task
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.publish();
    }
}

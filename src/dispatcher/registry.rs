//! Shared in-memory registries: desired tasks, worker bindings and resource routes.
//!
//! Everything sits behind one `std::sync::Mutex` that is only held for map operations,
//! never across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};
use uuid::Uuid;

use super::worker::Worker;
use crate::model::Task;

/// Result of merging a heartbeat into the task map.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl MergeOutcome {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// The worker bound to a task and the task version it was last told about.
struct Binding {
    worker: Arc<Worker>,
    version: i64,
}

/// Control-API address serving a set of resource/device ids.
struct Route {
    address: String,
    ids: HashSet<String>,
}

#[derive(Default)]
struct State {
    tasks: HashMap<String, Arc<Task>>,
    bindings: HashMap<String, Binding>,
    routes: HashMap<String, Route>,
}

/// Dispatcher-owned registry shared with workers and the lookup service.
#[derive(Default)]
pub struct TaskRegistry {
    state: Mutex<State>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Latest desired snapshot of `task_id`.
    pub fn task(&self, task_id: &str) -> Option<Arc<Task>> {
        self.lock().tasks.get(task_id).cloned()
    }

    pub fn tasks(&self) -> Vec<Arc<Task>> {
        let mut tasks: Vec<_> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Highest known version stamp, sent as `time` in heartbeats.
    pub fn max_version(&self) -> i64 {
        self.lock()
            .tasks
            .values()
            .map(|t| t.version())
            .max()
            .unwrap_or(0)
    }

    /// Apply a heartbeat delta. Inactive tasks are removed; new tasks and tasks whose
    /// version or resource bundle changed are replaced by a fresh snapshot. A bundle already
    /// fetched is carried over while the resource id stays the same.
    pub fn merge(&self, incoming: Vec<Task>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut state = self.lock();

        for mut task in incoming {
            if task.id.is_empty() {
                continue;
            }
            if !task.is_active() {
                if state.tasks.remove(&task.id).is_some() {
                    outcome.removed.push(task.id);
                }
                continue;
            }

            let existing = state.tasks.get(&task.id);
            if let Some(old) = existing
                && task.resource_bytes().is_empty()
                && task.resource_id == old.resource_id
                && !old.resource_bytes().is_empty()
            {
                task.set_resource_bytes(old.resource_bytes());
            }

            match existing {
                None => outcome.added.push(task.id.clone()),
                Some(old)
                    if old.version() != task.version()
                        || old.resource_id != task.resource_id
                        || old.resource_bytes() != task.resource_bytes() =>
                {
                    outcome.updated.push(task.id.clone())
                }
                Some(_) => continue,
            }
            state.tasks.insert(task.id.clone(), Arc::new(task));
        }
        outcome
    }

    /// Resource ids whose bundle some task still waits for.
    pub fn pending_resources(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .tasks
            .values()
            .filter(|t| t.resources_pending())
            .map(|t| t.resource_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort();
        ids
    }

    /// Store a fetched bundle on every task still waiting for `resource_id`.
    /// Returns the number of tasks updated.
    pub fn attach_resources(&self, resource_id: &str, bytes: &str) -> usize {
        let mut state = self.lock();
        let mut attached = 0;
        for task in state.tasks.values_mut() {
            if task.resource_id == resource_id && task.resources_pending() {
                let mut next = Task::clone(task);
                next.set_resource_bytes(bytes);
                *task = Arc::new(next);
                attached += 1;
            }
        }
        attached
    }

    /// Create exactly one worker per unbound task via `create`, and record newer versions
    /// on existing bindings. Runs entirely under the registry lock. Returns the new workers.
    pub fn bind_unbound<F>(&self, mut create: F) -> Vec<Arc<Worker>>
    where
        F: FnMut(&Arc<Task>) -> Option<Arc<Worker>>,
    {
        let mut guard = self.lock();
        let State {
            tasks, bindings, ..
        } = &mut *guard;

        let mut created = Vec::new();
        for (task_id, task) in tasks.iter() {
            match bindings.get_mut(task_id) {
                Some(binding) => {
                    if binding.version != task.version() {
                        info!(
                            task_id = %task_id,
                            from = binding.version,
                            to = task.version(),
                            "Task changed, worker will converge"
                        );
                        binding.version = task.version();
                    }
                }
                None => {
                    if let Some(worker) = create(task) {
                        info!(task_id = %task_id, name = %task.name, "Binding new task");
                        bindings.insert(
                            task_id.clone(),
                            Binding {
                                worker: Arc::clone(&worker),
                                version: task.version(),
                            },
                        );
                        created.push(worker);
                    }
                }
            }
        }
        created
    }

    /// Remove the binding of `task_id` if it still belongs to `worker_id`.
    pub fn unbind(&self, task_id: &str, worker_id: Uuid) -> bool {
        let mut state = self.lock();
        match state.bindings.get(task_id) {
            Some(binding) if binding.worker.id() == worker_id => {
                state.bindings.remove(task_id);
                debug!(task_id, %worker_id, "Worker unbound");
                true
            }
            _ => false,
        }
    }

    pub fn is_bound(&self, task_id: &str) -> bool {
        self.lock().bindings.contains_key(task_id)
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    pub fn worker(&self, task_id: &str) -> Option<Arc<Worker>> {
        self.lock()
            .bindings
            .get(task_id)
            .map(|b| Arc::clone(&b.worker))
    }

    /// Take every binding, leaving the map empty.
    pub fn drain_bindings(&self) -> Vec<Arc<Worker>> {
        self.lock()
            .bindings
            .drain()
            .map(|(_, binding)| binding.worker)
            .collect()
    }

    /// Record that `address` serves `ids` for `task_id`, replacing earlier routes.
    pub fn record_routes(&self, task_id: &str, address: String, ids: HashSet<String>) {
        self.lock()
            .routes
            .insert(task_id.to_string(), Route { address, ids });
    }

    pub fn clear_routes(&self, task_id: &str) {
        self.lock().routes.remove(task_id);
    }

    /// Address of the task currently serving resource or device id `id`.
    pub fn resolve(&self, id: &str) -> Option<String> {
        let state = self.lock();
        let mut matches: Vec<(&String, &Route)> = state
            .routes
            .iter()
            .filter(|(_, route)| route.ids.contains(id))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(b.0));
        matches.first().map(|(_, route)| route.address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::active_task;

    #[test]
    fn merge_adds_replaces_and_prunes() {
        let registry = TaskRegistry::new();
        let outcome = registry.merge(vec![active_task("t1", 100), active_task("t2", 100)]);
        assert_eq!(outcome.added.len(), 2);
        assert_eq!(registry.max_version(), 100);

        let before = registry.task("t1").unwrap();
        let outcome = registry.merge(vec![active_task("t1", 100)]);
        assert!(outcome.is_empty());
        assert!(Arc::ptr_eq(&before, &registry.task("t1").unwrap()));

        let mut deleted = active_task("t2", 101);
        deleted.del_flag = 1;
        let outcome = registry.merge(vec![active_task("t1", 101), deleted]);
        assert_eq!(outcome.updated, ["t1"]);
        assert_eq!(outcome.removed, ["t2"]);
        assert!(registry.task("t2").is_none());
        assert_eq!(registry.task("t1").unwrap().version(), 101);
    }

    #[test]
    fn stopped_unknown_task_is_ignored() {
        let registry = TaskRegistry::new();
        let mut stopped = active_task("t1", 1);
        stopped.status = 0;
        assert!(registry.merge(vec![stopped]).is_empty());
        assert_eq!(registry.task_count(), 0);
    }

    #[test]
    fn bundle_is_carried_over_while_resource_id_is_unchanged() {
        let registry = TaskRegistry::new();
        let mut t1 = active_task("t1", 100);
        t1.resource_id = "r1".into();
        registry.merge(vec![t1.clone()]);
        assert_eq!(registry.pending_resources(), ["r1"]);
        assert_eq!(registry.attach_resources("r1", "a,gb-a\n"), 1);
        assert!(registry.pending_resources().is_empty());

        let mut bumped = t1.clone();
        bumped.update_time = 101;
        registry.merge(vec![bumped]);
        assert_eq!(registry.task("t1").unwrap().resource_bytes(), "a,gb-a\n");

        let mut moved = t1;
        moved.update_time = 102;
        moved.resource_id = "r2".into();
        registry.merge(vec![moved]);
        assert!(registry.task("t1").unwrap().resources_pending());
        assert_eq!(registry.pending_resources(), ["r2"]);
    }

    #[test]
    fn routes_resolve_by_resource_or_device_id() {
        let registry = TaskRegistry::new();
        registry.record_routes(
            "t1",
            "task_t1:32000".into(),
            ["r1".to_string(), "gb1".to_string()].into(),
        );
        assert_eq!(registry.resolve("gb1").as_deref(), Some("task_t1:32000"));
        assert_eq!(registry.resolve("r1").as_deref(), Some("task_t1:32000"));
        assert_eq!(registry.resolve("nope"), None);

        registry.clear_routes("t1");
        assert_eq!(registry.resolve("r1"), None);
    }
}

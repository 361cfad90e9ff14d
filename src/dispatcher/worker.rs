//! Per-task worker: converges the running container and its control API onto the latest
//! desired task snapshot, and probes the task for liveness.
//!
//! A worker owns two loops, convergence and keepalive, that share a per-worker state lock.
//! The convergence pass holds that lock from start to finish, so passes for one task are
//! strictly sequential. The keepalive probe runs without the lock and re-checks the
//! container incarnation before tearing anything down.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::diff::ResourceDiff;
use super::registry::TaskRegistry;
use crate::config::{Intervals, RepushPolicy};
use crate::container::{ContainerRuntime, RunCommand, RunSettings, container_name};
use crate::control::{ControlEndpoint, TaskControl};
use crate::error::RequestError;
use crate::model::{Resource, Task};
use crate::ports::PortAllocator;

/// Collaborators shared by every worker of a dispatcher.
pub struct WorkerDeps {
    pub registry: Arc<TaskRegistry>,
    pub ports: Arc<PortAllocator>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub control: Arc<dyn TaskControl>,
    pub settings: RunSettings,
    /// Replaces the container name as control-API host when set.
    pub control_host: Option<String>,
    pub repush: RepushPolicy,
}

/// Outcome of one convergence pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converge {
    /// Task is gone; the worker tore down and released everything.
    Retired,
    /// Resource bundle not fetched yet.
    Waiting,
    /// The current version has a configuration error; nothing is attempted until it changes.
    Blocked,
    /// Container (re)started; initialization follows on the next pass.
    Started,
    /// Control API initialized and resources assigned.
    Initialized,
    /// A newer version was applied to the running task.
    Updated,
    /// Already converged.
    Unchanged,
    /// A step failed; retried on the next pass.
    Failed,
}

/// Outcome of one keepalive probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keepalive {
    /// Not ready yet, or the container changed while probing.
    Skipped,
    Alive,
    /// Probe failed; the container was torn down for convergence to restart.
    Restarting,
}

/// Observable lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Unbound,
    BoundUninitialized,
    BoundReady,
    Terminated,
}

#[derive(Default)]
struct WorkerState {
    /// Snapshot the running container was started from and last converged to.
    applied: Option<Arc<Task>>,
    initialized: bool,
    /// Resources the running container currently holds.
    assigned: Arc<[Resource]>,
    /// Bumped on every container start.
    incarnation: u64,
    /// Version whose run command could not be built.
    blocked_version: Option<i64>,
}

impl WorkerState {
    fn reset(&mut self) {
        self.applied = None;
        self.initialized = false;
        self.assigned = Arc::from([]);
    }
}

/// Controller of one task id for the lifetime of its binding.
pub struct Worker {
    id: Uuid,
    task_id: String,
    container: String,
    manage_port: u16,
    deps: Arc<WorkerDeps>,
    state: AsyncMutex<WorkerState>,
    cancel: CancellationToken,
    released: AtomicBool,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Create a worker owning `manage_port`. `cancel` should be a child of the dispatcher's token.
    pub fn new(
        task_id: impl Into<String>,
        manage_port: u16,
        deps: Arc<WorkerDeps>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let task_id = task_id.into();
        let container = container_name(&deps.settings.name_prefix, &task_id);
        Arc::new(Self {
            id: Uuid::new_v4(),
            task_id,
            container,
            manage_port,
            deps,
            state: AsyncMutex::new(WorkerState::default()),
            cancel,
            released: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn manage_port(&self) -> u16 {
        self.manage_port
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Address other components use to reach this task's control API.
    pub fn address(&self) -> String {
        format!("{}:{}", self.container, self.manage_port)
    }

    fn endpoint(&self) -> ControlEndpoint {
        ControlEndpoint {
            host: self
                .deps
                .control_host
                .clone()
                .unwrap_or_else(|| self.container.clone()),
            port: self.manage_port,
        }
    }

    pub async fn phase(&self) -> WorkerPhase {
        if self.released.load(Ordering::SeqCst) {
            return WorkerPhase::Terminated;
        }
        let state = self.state.lock().await;
        match (&state.applied, state.initialized) {
            (None, _) => WorkerPhase::Unbound,
            (Some(_), false) => WorkerPhase::BoundUninitialized,
            (Some(_), true) => WorkerPhase::BoundReady,
        }
    }

    /// Snapshot currently applied, if any.
    pub async fn applied(&self) -> Option<Arc<Task>> {
        self.state.lock().await.applied.clone()
    }

    /// Start the convergence and keepalive loops.
    pub fn spawn(self: &Arc<Self>, intervals: &Intervals) {
        let converge = tokio::spawn(Arc::clone(self).run_converge_loop(intervals.converge));
        let keepalive = tokio::spawn(Arc::clone(self).run_keepalive_loop(intervals.keepalive));
        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        loops.push(converge);
        loops.push(keepalive);
    }

    /// Wait for both loops to exit.
    pub async fn join(&self) {
        let handles: Vec<_> = self
            .loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(task_id = %self.task_id, error = %e, "Worker loop panicked");
            }
        }
    }

    async fn run_converge_loop(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.converge_once().await == Converge::Retired {
                return;
            }
        }

        // Cancelled from above: best-effort teardown before exiting.
        let mut state = self.state.lock().await;
        self.teardown(&mut state).await;
        self.release();
        info!(task_id = %self.task_id, "Worker stopped");
    }

    async fn run_keepalive_loop(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.keepalive_once().await;
        }
    }

    /// One convergence pass.
    pub async fn converge_once(&self) -> Converge {
        let mut state = self.state.lock().await;

        if self.released.load(Ordering::SeqCst) {
            return Converge::Retired;
        }

        let Some(desired) = self.deps.registry.task(&self.task_id) else {
            info!(task_id = %self.task_id, "Task removed upstream, retiring worker");
            self.teardown(&mut state).await;
            self.release();
            return Converge::Retired;
        };

        if desired.resources_pending() {
            debug!(task_id = %self.task_id, resource_id = %desired.resource_id, "Waiting for resource bundle");
            return Converge::Waiting;
        }

        let needs_start = match &state.applied {
            None => true,
            Some(applied) => desired.needs_restart(applied),
        };
        if needs_start {
            return self.start(&mut state, &desired).await;
        }

        if !state.initialized {
            return self.initialize(&mut state, &desired).await;
        }

        let Some(applied) = state.applied.clone() else {
            return Converge::Failed;
        };
        if desired.same_revision(&applied) {
            return Converge::Unchanged;
        }
        self.update(&mut state, &applied, &desired).await
    }

    async fn start(&self, state: &mut WorkerState, desired: &Arc<Task>) -> Converge {
        if state.blocked_version == Some(desired.version()) {
            return Converge::Blocked;
        }

        let command = match RunCommand::for_task(desired, &self.deps.settings, self.manage_port) {
            Ok(command) => command,
            Err(e) => {
                warn!(task_id = %self.task_id, version = desired.version(), error = %e, "Invalid task configuration, not starting");
                state.blocked_version = Some(desired.version());
                return Converge::Blocked;
            }
        };
        state.blocked_version = None;

        if state.applied.is_some() {
            info!(task_id = %self.task_id, "Image or ports changed, recreating container");
        }
        self.deps.registry.clear_routes(&self.task_id);
        self.remove_container().await;
        state.reset();

        info!(task_id = %self.task_id, image = %command.image, port = self.manage_port, "Starting container");
        match self.deps.runtime.run(&command).await {
            Ok(output) => {
                debug!(task_id = %self.task_id, output = %output, "Container started");
                state.applied = Some(Arc::clone(desired));
                state.incarnation += 1;
                Converge::Started
            }
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Container start failed");
                Converge::Failed
            }
        }
    }

    async fn initialize(&self, state: &mut WorkerState, desired: &Arc<Task>) -> Converge {
        let endpoint = self.endpoint();
        if let Err(e) = self.deps.control.init(&endpoint, desired).await {
            warn!(task_id = %self.task_id, %endpoint, error = %e, "Task init failed");
            return Converge::Failed;
        }
        // A fresh init clears whatever the control API held before.
        state.assigned = Arc::from([]);
        self.record_routes(&state.assigned);
        if let Err(e) = self.sync_resources(state, desired).await {
            warn!(task_id = %self.task_id, error = %e, "Initial resource sync failed");
            return Converge::Failed;
        }

        state.initialized = true;
        state.applied = Some(Arc::clone(desired));
        self.record_routes(&state.assigned);
        info!(task_id = %self.task_id, version = desired.version(), "Task initialized");
        Converge::Initialized
    }

    async fn update(&self, state: &mut WorkerState, applied: &Task, desired: &Arc<Task>) -> Converge {
        let repush = match self.deps.repush {
            RepushPolicy::EveryVersion => applied.version() != desired.version(),
            RepushPolicy::OnAccessChange => desired.access_changed(applied),
        };

        if repush {
            let endpoint = self.endpoint();
            if let Err(e) = self.deps.control.init(&endpoint, desired).await {
                warn!(task_id = %self.task_id, error = %e, "Config re-push failed, task needs re-initialization");
                state.initialized = false;
                return Converge::Failed;
            }
            debug!(task_id = %self.task_id, version = desired.version(), "Config re-pushed");
        }

        if let Err(e) = self.sync_resources(state, desired).await {
            warn!(task_id = %self.task_id, error = %e, "Resource sync failed");
            return Converge::Failed;
        }

        state.applied = Some(Arc::clone(desired));
        self.record_routes(&state.assigned);
        info!(
            task_id = %self.task_id,
            from = applied.version(),
            to = desired.version(),
            resource_id = %desired.resource_id,
            "Task updated"
        );
        Converge::Updated
    }

    /// Revoke, then assign, whatever moves `state.assigned` to the desired resources.
    async fn sync_resources(&self, state: &mut WorkerState, desired: &Task) -> Result<(), RequestError> {
        let target = desired.resources();
        let diff = ResourceDiff::between(&state.assigned, &target);
        if diff.is_empty() {
            state.assigned = target;
            return Ok(());
        }

        let endpoint = self.endpoint();
        if !diff.revoke.is_empty() {
            self.deps.control.revoke(&endpoint, &diff.revoke).await?;
            debug!(task_id = %self.task_id, count = diff.revoke.len(), "Resources revoked");
            let kept: Vec<Resource> = state
                .assigned
                .iter()
                .filter(|r| !diff.revoke.contains(&r.id))
                .cloned()
                .collect();
            state.assigned = kept.into();
            self.record_routes(&state.assigned);
        }
        if !diff.assign.is_empty() {
            self.deps.control.assign(&endpoint, &diff.assign).await?;
            debug!(task_id = %self.task_id, count = diff.assign.len(), "Resources assigned");
        }
        state.assigned = target;
        Ok(())
    }

    fn record_routes(&self, resources: &[Resource]) {
        let ids: HashSet<String> = resources
            .iter()
            .flat_map(|r| [r.id.clone(), r.gb_id.clone()])
            .filter(|id| !id.is_empty())
            .collect();
        self.deps
            .registry
            .record_routes(&self.task_id, self.address(), ids);
    }

    /// One liveness probe.
    pub async fn keepalive_once(&self) -> Keepalive {
        let incarnation = {
            let state = self.state.lock().await;
            if state.applied.is_none() || !state.initialized {
                return Keepalive::Skipped;
            }
            state.incarnation
        };

        let endpoint = self.endpoint();
        let Err(e) = self.deps.control.heart(&endpoint).await else {
            return Keepalive::Alive;
        };

        let mut state = self.state.lock().await;
        if state.incarnation != incarnation || state.applied.is_none() {
            return Keepalive::Skipped;
        }
        warn!(task_id = %self.task_id, %endpoint, error = %e, "Keepalive failed, restarting task");
        self.teardown(&mut state).await;
        Keepalive::Restarting
    }

    /// Stop and remove the container and forget what was applied.
    async fn teardown(&self, state: &mut WorkerState) {
        self.deps.registry.clear_routes(&self.task_id);
        self.remove_container().await;
        state.reset();
    }

    /// Best-effort `stop` then `rm`; failures are expected when nothing is running.
    async fn remove_container(&self) {
        if let Err(e) = self.deps.runtime.stop(&self.container).await {
            debug!(container = %self.container, error = %e, "Container stop failed");
        }
        if let Err(e) = self.deps.runtime.remove(&self.container).await {
            debug!(container = %self.container, error = %e, "Container remove failed");
        }
    }

    /// Unbind, release the management port and cancel the loops. Runs once.
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.deps.registry.unbind(&self.task_id, self.id);
            self.deps.registry.clear_routes(&self.task_id);
            self.deps.ports.release(self.manage_port);
            debug!(task_id = %self.task_id, port = self.manage_port, "Worker released");
        }
        self.cancel.cancel();
    }
}

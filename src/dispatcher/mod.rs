//! Task dispatcher: discovers desired tasks from the center, binds one worker per task and
//! answers "which task serves this resource" lookups.
//!
//! Two background loops run until [`Dispatcher::shutdown`]:
//! 1. Discovery: heartbeat → merge into the task map → fetch missing resource bundles
//!    through the bounded pool → persist the merged set to the local cache.
//! 2. Binding: create a worker for every task that has none.
//!
//! Workers own their task from then on and retire themselves once the task leaves the map.

mod diff;
pub mod registry;
pub mod worker;

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::center::CenterClient;
use crate::config::AgentConfig;
use crate::container::{ContainerRuntime, RunSettings};
use crate::control::TaskControl;
use crate::error::{CenterError, Error};
use crate::pool::BoundedPool;
use crate::ports::PortAllocator;
use crate::store::LocalCache;

pub use diff::ResourceDiff;
pub use registry::{MergeOutcome, TaskRegistry};
pub use worker::{Converge, Keepalive, Worker, WorkerDeps, WorkerPhase};

/// Lookup target answered with the configured media address.
const MEDIA_TARGET: &str = "media";

/// External collaborators of a [`Dispatcher`].
pub struct DispatcherDeps {
    pub center: Arc<dyn CenterClient>,
    pub control: Arc<dyn TaskControl>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub cache: LocalCache,
}

struct Shared {
    config: AgentConfig,
    registry: Arc<TaskRegistry>,
    ports: Arc<PortAllocator>,
    center: Arc<dyn CenterClient>,
    cache: LocalCache,
    pool: BoundedPool,
    worker_deps: Arc<WorkerDeps>,
    cancel: CancellationToken,
    last_center_host: Mutex<Option<String>>,
}

/// Owner of the task map, the worker bindings and the background loops.
pub struct Dispatcher {
    shared: Arc<Shared>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(config: AgentConfig, deps: DispatcherDeps) -> Result<Self, Error> {
        let pool = BoundedPool::new(config.pool_capacity)?;
        let registry = Arc::new(TaskRegistry::new());
        let ports = Arc::new(PortAllocator::new(config.manage_port_base));

        let worker_deps = Arc::new(WorkerDeps {
            registry: Arc::clone(&registry),
            ports: Arc::clone(&ports),
            runtime: deps.runtime,
            control: deps.control,
            settings: RunSettings::from_config(&config),
            control_host: config.container.control_host.clone(),
            repush: config.repush,
        });

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                registry,
                ports,
                center: deps.center,
                cache: deps.cache,
                pool,
                worker_deps,
                cancel: CancellationToken::new(),
                last_center_host: Mutex::new(None),
            }),
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.shared.registry
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.shared.ports
    }

    /// Seed the task map from the local cache and start the discovery and binding loops.
    pub async fn start(&self) {
        let shared = &self.shared;
        let cached_host = shared.cache.center_host().await;
        *shared
            .last_center_host
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = cached_host;

        let cached = shared.cache.load_tasks().await;
        if !cached.is_empty() {
            let outcome = shared.registry.merge(cached);
            info!(tasks = outcome.added.len(), "Restored tasks from local cache");
        }

        let discovery = tokio::spawn(Arc::clone(shared).run_discovery_loop());
        let binding = tokio::spawn(Arc::clone(shared).run_binding_loop());
        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        loops.push(discovery);
        loops.push(binding);

        info!(
            heart = ?shared.config.intervals.heart,
            bind = ?shared.config.intervals.bind,
            port_base = shared.ports.base(),
            "Dispatcher started"
        );
    }

    /// One discovery pass.
    pub async fn discover_once(&self) -> Result<MergeOutcome, CenterError> {
        self.shared.discover_once().await
    }

    /// One binding pass. Returns the workers it created, already running.
    pub fn bind_once(&self) -> Vec<Arc<Worker>> {
        self.shared.bind_once()
    }

    /// Control-API address (`<container>:<port>`) of the task serving resource or device
    /// id `target`. `media` resolves to the configured media address.
    pub fn resolve(&self, target: &str) -> Option<String> {
        if target.eq_ignore_ascii_case(MEDIA_TARGET) {
            return self.shared.config.media_address.clone();
        }
        self.shared.registry.resolve(target)
    }

    /// Cancel the loops and every worker, then wait for all of them.
    pub async fn shutdown(&self) {
        info!("Dispatcher shutting down");
        self.shared.cancel.cancel();

        let loops: Vec<_> = self
            .loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatcher loop panicked");
            }
        }

        for worker in self.shared.registry.drain_bindings() {
            worker.join().await;
        }
        self.shared.pool.close();
        info!("Dispatcher stopped");
    }
}

impl Shared {
    async fn run_discovery_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.intervals.heart);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.discover_once().await {
                Ok(outcome) if !outcome.is_empty() => info!(
                    added = outcome.added.len(),
                    updated = outcome.updated.len(),
                    removed = outcome.removed.len(),
                    tasks = self.registry.task_count(),
                    "Heartbeat merged"
                ),
                Ok(_) => debug!("Heartbeat brought no changes"),
                Err(e) => warn!(error = %e, "Discovery pass failed"),
            }
        }
        debug!("Discovery loop stopped");
    }

    async fn run_binding_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.intervals.bind);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.bind_once();
        }
        debug!("Binding loop stopped");
    }

    async fn discover_once(&self) -> Result<MergeOutcome, CenterError> {
        self.remember_center_host().await;

        let since = self.registry.max_version();
        let mut heartbeat = self.center.heartbeat(since).await?;

        let node_id = if heartbeat.node.id.is_empty() {
            self.cache.node_id().await.unwrap_or_default()
        } else {
            self.cache.save_node_id(&heartbeat.node.id).await;
            heartbeat.node.id.clone()
        };
        if !node_id.is_empty() {
            for task in &mut heartbeat.tasks {
                task.node_id = node_id.clone();
            }
        }

        debug!(since, received = heartbeat.tasks.len(), "Heartbeat answered");
        let outcome = self.registry.merge(heartbeat.tasks);

        self.fetch_pending_resources().await;
        self.cache.save_tasks(&self.registry.tasks()).await;
        Ok(outcome)
    }

    /// Write the center host to the cache when it differs from the last value written.
    async fn remember_center_host(&self) {
        let Some(host) = self.center.host().filter(|h| !h.trim().is_empty()) else {
            return;
        };
        let changed = {
            let mut last = self
                .last_center_host
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if last.as_deref() == Some(host) {
                false
            } else {
                *last = Some(host.to_string());
                true
            }
        };
        if changed {
            self.cache.save_center_host(host).await;
            info!(center = host, "Center host recorded");
        }
    }

    /// Fetch each missing bundle once, no matter how many tasks share it.
    async fn fetch_pending_resources(&self) {
        let pending = self.registry.pending_resources();
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "Fetching resource bundles");

        let jobs = pending.into_iter().map(|resource_id| {
            let center = Arc::clone(&self.center);
            let registry = Arc::clone(&self.registry);
            async move {
                match center.fetch_resources(&resource_id).await {
                    Ok(body) if body.trim().is_empty() => {
                        warn!(resource_id = %resource_id, "Resource bundle is empty, will retry");
                    }
                    Ok(body) => {
                        let attached = registry.attach_resources(&resource_id, &body);
                        debug!(resource_id = %resource_id, tasks = attached, bytes = body.len(), "Resource bundle attached");
                    }
                    Err(e) => warn!(resource_id = %resource_id, error = %e, "Resource bundle fetch failed"),
                }
            }
        });

        if let Err(e) = self.pool.submit_batch(jobs).await {
            warn!(error = %e, "Resource fetch batch not fully submitted");
        }
    }

    fn bind_once(&self) -> Vec<Arc<Worker>> {
        if self.cancel.is_cancelled() {
            return Vec::new();
        }

        // Runs under the registry lock: nothing is bound once shutdown has drained bindings.
        let created = self.registry.bind_unbound(|task| {
            if self.cancel.is_cancelled() {
                return None;
            }
            let Some(port) = self.ports.acquire() else {
                warn!(task_id = %task.id, "No management port available, task stays unbound");
                return None;
            };
            let worker = Worker::new(
                task.id.clone(),
                port,
                Arc::clone(&self.worker_deps),
                self.cancel.child_token(),
            );
            worker.spawn(&self.config.intervals);
            Some(worker)
        });

        for worker in &created {
            debug!(task_id = %worker.task_id(), port = worker.manage_port(), "Worker spawned");
        }
        created
    }
}

//! In-process doubles for the container runtime, task control API and center.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::center::{CenterClient, Heartbeat, NodeInfo};
use crate::config::{Intervals, RepushPolicy};
use crate::container::{ContainerRuntime, RunCommand, RunSettings};
use crate::control::{ControlEndpoint, TaskControl};
use crate::dispatcher::registry::TaskRegistry;
use crate::dispatcher::worker::{Worker, WorkerDeps};
use crate::error::{CenterError, ContainerError, RequestError};
use crate::model::{Resource, STATUS_RUNNING, Task};
use crate::ports::PortAllocator;

/// A running task at `version` with an image and no resources.
pub fn active_task(id: &str, version: i64) -> Task {
    let mut task = Task::new(id);
    task.name = format!("task {id}");
    task.repository = "registry/app".into();
    task.tag = "1.0".into();
    task.status = STATUS_RUNNING;
    task.update_time = version;
    task
}

/// Side effect observed by a double.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Stop(String),
    Remove(String),
    Run(String),
    Init { task_id: String, version: i64 },
    Heart(String),
    Assign(Vec<String>),
    Revoke(Vec<String>),
}

/// Ordered record of calls shared by the doubles.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    /// Drain everything recorded so far.
    pub fn take(&self) -> Vec<Call> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

fn failure(url: &str) -> RequestError {
    RequestError::Transport {
        url: url.to_string(),
        reason: "stubbed failure".into(),
    }
}

pub struct StubRuntime {
    log: CallLog,
    fail_run: AtomicBool,
    last_run: Mutex<Option<RunCommand>>,
}

impl StubRuntime {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            fail_run: AtomicBool::new(false),
            last_run: Mutex::new(None),
        }
    }

    pub fn fail_run(&self, fail: bool) {
        self.fail_run.store(fail, Ordering::SeqCst);
    }

    pub fn last_run(&self) -> Option<RunCommand> {
        self.last_run.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn stop(&self, name: &str) -> Result<(), ContainerError> {
        self.log.push(Call::Stop(name.into()));
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), ContainerError> {
        self.log.push(Call::Remove(name.into()));
        Ok(())
    }

    async fn run(&self, command: &RunCommand) -> Result<String, ContainerError> {
        self.log.push(Call::Run(command.name.clone()));
        *self.last_run.lock().unwrap() = Some(command.clone());
        if self.fail_run.load(Ordering::SeqCst) {
            return Err(ContainerError::Failed {
                command: command.to_string(),
                code: 125,
                stderr: "stubbed failure".into(),
            });
        }
        Ok(format!("id-{}", command.name))
    }
}

pub struct StubControl {
    log: CallLog,
    fail_init: AtomicBool,
    fail_heart: AtomicBool,
    fail_assign: AtomicBool,
}

impl StubControl {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            fail_init: AtomicBool::new(false),
            fail_heart: AtomicBool::new(false),
            fail_assign: AtomicBool::new(false),
        }
    }

    pub fn fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    pub fn fail_heart(&self, fail: bool) {
        self.fail_heart.store(fail, Ordering::SeqCst);
    }

    pub fn fail_assign(&self, fail: bool) {
        self.fail_assign.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskControl for StubControl {
    async fn init(&self, endpoint: &ControlEndpoint, task: &Task) -> Result<(), RequestError> {
        self.log.push(Call::Init {
            task_id: task.id.clone(),
            version: task.version(),
        });
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(failure(&format!("{endpoint}/init")));
        }
        Ok(())
    }

    async fn heart(&self, endpoint: &ControlEndpoint) -> Result<(), RequestError> {
        self.log.push(Call::Heart(endpoint.host.clone()));
        if self.fail_heart.load(Ordering::SeqCst) {
            return Err(failure(&format!("{endpoint}/heart")));
        }
        Ok(())
    }

    async fn assign(
        &self,
        endpoint: &ControlEndpoint,
        resources: &[Resource],
    ) -> Result<(), RequestError> {
        self.log
            .push(Call::Assign(resources.iter().map(|r| r.id.clone()).collect()));
        if self.fail_assign.load(Ordering::SeqCst) {
            return Err(failure(&format!("{endpoint}/assignResource")));
        }
        Ok(())
    }

    async fn revoke(&self, _endpoint: &ControlEndpoint, ids: &[String]) -> Result<(), RequestError> {
        self.log.push(Call::Revoke(ids.to_vec()));
        Ok(())
    }
}

/// Center double answering heartbeats from a script.
#[derive(Default)]
pub struct StubCenter {
    host: Option<String>,
    node_id: String,
    script: Mutex<VecDeque<Result<Vec<Task>, String>>>,
    bundles: Mutex<HashMap<String, String>>,
    since: Mutex<Vec<i64>>,
    fetches: AtomicUsize,
}

impl StubCenter {
    pub fn new(host: &str, node_id: &str) -> Self {
        Self {
            host: Some(host.to_string()),
            node_id: node_id.to_string(),
            ..Default::default()
        }
    }

    /// Queue the task delta returned by the next heartbeat.
    pub fn push_tasks(&self, tasks: Vec<Task>) {
        self.script.lock().unwrap().push_back(Ok(tasks));
    }

    /// Make the next heartbeat fail.
    pub fn push_failure(&self) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err("center unreachable".into()));
    }

    pub fn set_bundle(&self, resource_id: &str, csv: &str) {
        self.bundles
            .lock()
            .unwrap()
            .insert(resource_id.to_string(), csv.to_string());
    }

    /// `since` values of every heartbeat so far.
    pub fn since(&self) -> Vec<i64> {
        self.since.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CenterClient for StubCenter {
    fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    async fn heartbeat(&self, since: i64) -> Result<Heartbeat, CenterError> {
        self.since.lock().unwrap().push(since);
        let next = self.script.lock().unwrap().pop_front();
        let tasks = match next {
            Some(Ok(tasks)) => tasks,
            Some(Err(reason)) => return Err(CenterError::Heartbeat(failure(&reason))),
            None => Vec::new(),
        };
        Ok(Heartbeat {
            node: NodeInfo {
                id: self.node_id.clone(),
                name: None,
            },
            tasks,
        })
    }

    async fn fetch_resources(&self, resource_id: &str) -> Result<String, CenterError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.bundles
            .lock()
            .unwrap()
            .get(resource_id)
            .cloned()
            .ok_or_else(|| CenterError::ResourceFetch {
                resource_id: resource_id.to_string(),
                source: failure(resource_id),
            })
    }
}

/// Registry, ports and doubles wired the way the dispatcher wires them.
pub struct Harness {
    pub registry: Arc<TaskRegistry>,
    pub ports: Arc<PortAllocator>,
    pub runtime: Arc<StubRuntime>,
    pub control: Arc<StubControl>,
    pub log: CallLog,
    pub cancel: CancellationToken,
    deps: Arc<WorkerDeps>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_repush(RepushPolicy::OnAccessChange)
    }

    pub fn with_repush(repush: RepushPolicy) -> Self {
        let log = CallLog::default();
        let registry = Arc::new(TaskRegistry::new());
        let ports = Arc::new(PortAllocator::new(32000));
        let runtime = Arc::new(StubRuntime::new(log.clone()));
        let control = Arc::new(StubControl::new(log.clone()));
        let deps = Arc::new(WorkerDeps {
            registry: Arc::clone(&registry),
            ports: Arc::clone(&ports),
            runtime: runtime.clone(),
            control: control.clone(),
            settings: RunSettings {
                network: "app".into(),
                name_prefix: "task_".into(),
                log_root: "/var/log/edge".into(),
                host: "node-a".into(),
                log_level: "info".into(),
                center_host: None,
            },
            control_host: None,
            repush,
        });
        Self {
            registry,
            ports,
            runtime,
            control,
            log,
            cancel: CancellationToken::new(),
            deps,
        }
    }

    /// A worker for `task_id` holding a fresh port, not recorded as a binding.
    pub fn worker(&self, task_id: &str) -> Arc<Worker> {
        let port = self.ports.acquire().unwrap();
        Worker::new(task_id, port, Arc::clone(&self.deps), self.cancel.child_token())
    }

    /// Bind every unbound task the way the binding loop does.
    pub fn bind(&self) -> Vec<Arc<Worker>> {
        self.registry.bind_unbound(|task| {
            let port = self.ports.acquire()?;
            Some(Worker::new(
                task.id.clone(),
                port,
                Arc::clone(&self.deps),
                self.cancel.child_token(),
            ))
        })
    }

    pub fn resolve(&self, id: &str) -> Option<String> {
        self.registry.resolve(id)
    }

    pub fn intervals(&self) -> Intervals {
        Intervals {
            heart: Duration::from_millis(20),
            bind: Duration::from_millis(10),
            converge: Duration::from_millis(10),
            keepalive: Duration::from_millis(10),
        }
    }
}

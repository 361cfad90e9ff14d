//! Typed accessors over the key-value store. Failures are logged and read as "no cache".

use std::sync::Arc;

use tracing::{debug, warn};

use super::traits::KvStore;
use crate::model::Task;

/// Last known task set (JSON array).
pub const KEY_TASKS: &str = "tasks";
/// Last node id reported by the center.
pub const KEY_NODE_ID: &str = "node_id";
/// Last center host this node talked to.
pub const KEY_CENTER_HOST: &str = "center_host";

/// Best-effort local cache. Never fails its caller.
#[derive(Clone)]
pub struct LocalCache {
    store: Option<Arc<dyn KvStore>>,
}

impl LocalCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store: Some(store) }
    }

    /// A cache that stores nothing.
    pub fn disabled() -> Self {
        Self { store: None }
    }

    /// Tasks persisted by the last successful heartbeat.
    pub async fn load_tasks(&self) -> Vec<Task> {
        let Some(raw) = self.read(KEY_TASKS).await else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<Task>>(&raw) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Cached task set is unreadable, ignoring it");
                Vec::new()
            }
        }
    }

    pub async fn save_tasks(&self, tasks: &[Arc<Task>]) {
        let snapshot: Vec<&Task> = tasks.iter().map(Arc::as_ref).collect();
        match serde_json::to_string(&snapshot) {
            Ok(raw) => self.write(KEY_TASKS, &raw).await,
            Err(e) => warn!(error = %e, "Failed to encode task set for cache"),
        }
    }

    pub async fn node_id(&self) -> Option<String> {
        self.read(KEY_NODE_ID).await
    }

    pub async fn save_node_id(&self, node_id: &str) {
        self.write(KEY_NODE_ID, node_id).await;
    }

    pub async fn center_host(&self) -> Option<String> {
        self.read(KEY_CENTER_HOST).await
    }

    pub async fn save_center_host(&self, host: &str) {
        self.write(KEY_CENTER_HOST, host).await;
    }

    async fn read(&self, key: &str) -> Option<String> {
        let store = self.store.as_ref()?;
        match store.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed");
                None
            }
        }
    }

    async fn write(&self, key: &str, value: &str) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        match store.put(key, value).await {
            Ok(()) => debug!(key, bytes = value.len(), "Cache updated"),
            Err(e) => warn!(key, error = %e, "Cache write failed"),
        }
    }
}

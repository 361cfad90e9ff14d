//! Client for a task's private control API.
//!
//! Every task container serves `init`, `heart`, `assignResource` and `revokeResource`
//! on its management port. Success is HTTP 200 with envelope code 200.

use std::fmt;

use async_trait::async_trait;
use tracing::debug;

use crate::error::RequestError;
use crate::http::{Method, RequestClient, RetryPolicy};
use crate::model::{Resource, Task};

/// Address of one task's control API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEndpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ControlEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Operations a worker issues against its task.
#[async_trait]
pub trait TaskControl: Send + Sync {
    /// Push the task configuration. The resource bundle is never included.
    async fn init(&self, endpoint: &ControlEndpoint, task: &Task) -> Result<(), RequestError>;

    /// Liveness probe.
    async fn heart(&self, endpoint: &ControlEndpoint) -> Result<(), RequestError>;

    /// Assign new or changed resources.
    async fn assign(
        &self,
        endpoint: &ControlEndpoint,
        resources: &[Resource],
    ) -> Result<(), RequestError>;

    /// Revoke resources by id.
    async fn revoke(&self, endpoint: &ControlEndpoint, ids: &[String]) -> Result<(), RequestError>;
}

/// [`TaskControl`] over HTTP with bounded retries.
pub struct HttpTaskControl {
    client: RequestClient,
    path_prefix: String,
    policy: RetryPolicy,
}

impl HttpTaskControl {
    pub fn new(client: RequestClient, path_prefix: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            client,
            path_prefix: path_prefix.into().trim_end_matches('/').to_string(),
            policy,
        }
    }

    fn url(&self, endpoint: &ControlEndpoint, op: &str) -> String {
        format!("http://{endpoint}{}/{op}", self.path_prefix)
    }
}

#[async_trait]
impl TaskControl for HttpTaskControl {
    async fn init(&self, endpoint: &ControlEndpoint, task: &Task) -> Result<(), RequestError> {
        let url = self.url(endpoint, "init");
        self.client
            .call(Method::POST, &url, &task.sanitized(), &self.policy)
            .await?;
        debug!(task_id = %task.id, %endpoint, "Task initialized");
        Ok(())
    }

    async fn heart(&self, endpoint: &ControlEndpoint) -> Result<(), RequestError> {
        let url = self.url(endpoint, "heart");
        self.client
            .call_empty(Method::POST, &url, &self.policy)
            .await
            .map(|_| ())
    }

    async fn assign(
        &self,
        endpoint: &ControlEndpoint,
        resources: &[Resource],
    ) -> Result<(), RequestError> {
        let url = self.url(endpoint, "assignResource");
        self.client
            .call(Method::POST, &url, resources, &self.policy)
            .await
            .map(|_| ())
    }

    async fn revoke(&self, endpoint: &ControlEndpoint, ids: &[String]) -> Result<(), RequestError> {
        let url = self.url(endpoint, "revokeResource");
        self.client
            .call(Method::POST, &url, ids, &self.policy)
            .await
            .map(|_| ())
    }
}

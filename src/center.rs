//! Client for the center, the remote control plane that owns desired task state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CenterConfig;
use crate::error::CenterError;
use crate::http::{RequestClient, RetryPolicy};
use crate::model::Task;

/// Identity this node reports in every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    pub serial_number: String,
    pub model: String,
    pub name: String,
}

/// Node record returned by the center.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NodeInfo {
    #[serde(deserialize_with = "crate::model::lenient_string")]
    pub id: String,
    pub name: Option<String>,
}

/// `data` of a heartbeat response: the node record plus tasks changed since `time`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Heartbeat {
    #[serde(alias = "box", deserialize_with = "crate::model::null_as_default")]
    pub node: NodeInfo,
    #[serde(deserialize_with = "crate::model::null_as_default")]
    pub tasks: Vec<Task>,
}

#[derive(Deserialize)]
struct HeartbeatEnvelope {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Heartbeat>,
}

/// Control-plane operations used by the dispatcher.
#[async_trait]
pub trait CenterClient: Send + Sync {
    /// Center host currently targeted, if configured.
    fn host(&self) -> Option<&str>;

    /// Report this node and fetch tasks changed after version `since`.
    async fn heartbeat(&self, since: i64) -> Result<Heartbeat, CenterError>;

    /// Fetch the CSV bundle of `resource_id`.
    async fn fetch_resources(&self, resource_id: &str) -> Result<String, CenterError>;
}

/// [`CenterClient`] over HTTP.
pub struct HttpCenterClient {
    client: RequestClient,
    config: CenterConfig,
    identity: NodeIdentity,
    resource_policy: RetryPolicy,
}

impl HttpCenterClient {
    pub fn new(
        client: RequestClient,
        config: CenterConfig,
        identity: NodeIdentity,
        resource_policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            config,
            identity,
            resource_policy,
        }
    }

    fn base_url(&self) -> Result<String, CenterError> {
        match self.config.host.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => {
                Ok(format!("http://{host}:{}", self.config.manage_port))
            }
            _ => Err(CenterError::NotConfigured(
                "set AGENT_CENTER_HOST to the control-plane host".to_string(),
            )),
        }
    }
}

#[async_trait]
impl CenterClient for HttpCenterClient {
    fn host(&self) -> Option<&str> {
        self.config.host.as_deref()
    }

    async fn heartbeat(&self, since: i64) -> Result<Heartbeat, CenterError> {
        let url = format!("{}{}?time={since}", self.base_url()?, self.config.heart_path);
        debug!(%url, "Sending heartbeat");

        // A missed heartbeat is retried by the next discovery tick.
        let text = self
            .client
            .post_raw(&url, &self.identity, &RetryPolicy::once())
            .await
            .map_err(CenterError::Heartbeat)?;

        let envelope: HeartbeatEnvelope = serde_json::from_str(&text)
            .map_err(|e| CenterError::InvalidResponse(format!("{e}")))?;

        envelope.data.ok_or_else(|| {
            CenterError::InvalidResponse(format!(
                "missing data (message: {})",
                envelope.message.unwrap_or_default()
            ))
        })
    }

    async fn fetch_resources(&self, resource_id: &str) -> Result<String, CenterError> {
        let url = format!(
            "{}{}/{resource_id}",
            self.base_url()?,
            self.config.resource_path
        );
        self.client
            .fetch_text(&url, &self.resource_policy)
            .await
            .map_err(|source| CenterError::ResourceFetch {
                resource_id: resource_id.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn heartbeat_accepts_box_alias() {
        let hb: Heartbeat = serde_json::from_value(json!({
            "box": {"id": "n1"},
            "tasks": [{"id": "t1", "status": 1, "updateTime": 5}]
        }))
        .unwrap();
        assert_eq!(hb.node.id, "n1");
        assert_eq!(hb.tasks.len(), 1);
        assert_eq!(hb.tasks[0].update_time, 5);

        let empty: Heartbeat =
            serde_json::from_value(json!({"node": {"id": 3}, "tasks": null})).unwrap();
        assert_eq!(empty.node.id, "3");
        assert!(empty.tasks.is_empty());
    }

    #[test]
    fn identity_uses_wire_names() {
        let identity = NodeIdentity {
            serial_number: "SN1".into(),
            model: "edge-x".into(),
            name: "gate".into(),
        };
        assert_eq!(
            serde_json::to_value(&identity).unwrap(),
            json!({"serialNumber": "SN1", "model": "edge-x", "name": "gate"})
        );
    }

    #[tokio::test]
    async fn missing_host_is_a_configuration_error() {
        let client = HttpCenterClient::new(
            RequestClient::new(Duration::from_secs(1)).unwrap(),
            CenterConfig::default(),
            NodeIdentity::default(),
            RetryPolicy::once(),
        );
        assert!(matches!(
            client.heartbeat(0).await,
            Err(CenterError::NotConfigured(_))
        ));
        assert!(matches!(
            client.fetch_resources("r1").await,
            Err(CenterError::NotConfigured(_))
        ));
    }
}

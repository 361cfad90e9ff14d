//! Task: the desired configuration of one containerized unit of work.

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::lenient::{lenient_i64, lenient_string};
use super::resource::{Resource, parse_bundle};
use crate::error::TaskError;

/// `status` value of a running task.
pub const STATUS_RUNNING: i64 = 1;
/// `delFlag` value of a deleted task.
pub const DELETED_FLAG: i64 = 1;

/// Desired task state as declared by the center.
///
/// Treated as an immutable snapshot once shared: a change upstream produces a new
/// `Arc<Task>`, which also invalidates the lazily decoded resource list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub repository: String,
    #[serde(rename = "currentTag", alias = "tag", deserialize_with = "lenient_string")]
    pub tag: String,
    #[serde(deserialize_with = "lenient_string")]
    pub access_type: String,
    pub access_param: Value,
    /// JSON array of port numbers, kept verbatim so changes are detected textually.
    #[serde(deserialize_with = "lenient_string")]
    pub export_ports: String,
    #[serde(deserialize_with = "lenient_string")]
    pub resource_id: String,
    #[serde(
        deserialize_with = "lenient_string",
        skip_serializing_if = "String::is_empty"
    )]
    resource_bytes: String,
    #[serde(deserialize_with = "lenient_i64")]
    pub status: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub del_flag: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub update_time: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub create_time: i64,
    #[serde(
        deserialize_with = "lenient_string",
        skip_serializing_if = "String::is_empty"
    )]
    pub node_id: String,

    #[serde(skip)]
    resources: OnceLock<Arc<[Resource]>>,
}

impl Task {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Running and not deleted.
    pub fn is_active(&self) -> bool {
        self.status == STATUS_RUNNING && self.del_flag != DELETED_FLAG
    }

    /// Version stamp; strictly increases on every upstream change.
    pub fn version(&self) -> i64 {
        self.update_time
    }

    pub fn resource_bytes(&self) -> &str {
        &self.resource_bytes
    }

    /// Replace the resource bundle, dropping any decoded resources.
    pub fn set_resource_bytes(&mut self, bytes: impl Into<String>) {
        self.resource_bytes = bytes.into();
        self.resources = OnceLock::new();
    }

    /// A resource bundle is attached but has not been fetched yet.
    pub fn resources_pending(&self) -> bool {
        !self.resource_id.is_empty() && self.resource_bytes.is_empty()
    }

    /// Resources decoded from the bundle, parsed on first access.
    pub fn resources(&self) -> Arc<[Resource]> {
        Arc::clone(
            self.resources
                .get_or_init(|| parse_bundle(&self.resource_bytes).into()),
        )
    }

    /// Image reference `repository[:tag]`.
    pub fn image(&self) -> Result<String, TaskError> {
        let repository = self.repository.trim();
        if repository.is_empty() {
            return Err(TaskError::MissingImage {
                task_id: self.id.clone(),
            });
        }
        let tag = self.tag.trim();
        if tag.is_empty() {
            Ok(repository.to_string())
        } else {
            Ok(format!("{repository}:{tag}"))
        }
    }

    /// Decode `exportPorts`. Entries may be numbers or numeric strings; anything else
    /// is a configuration error.
    pub fn export_ports(&self) -> Result<Vec<u16>, TaskError> {
        let raw = self.export_ports.trim();
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let invalid = |reason: String| TaskError::InvalidExportPorts {
            task_id: self.id.clone(),
            raw: self.export_ports.clone(),
            reason,
        };

        let entries: Vec<Value> = serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?;
        entries
            .iter()
            .map(|entry| {
                let port = match entry {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.trim().parse::<u64>().ok(),
                    _ => None,
                };
                port.and_then(|p| u16::try_from(p).ok())
                    .filter(|p| *p != 0)
                    .ok_or_else(|| invalid(format!("{entry} is not a port number")))
            })
            .collect()
    }

    /// Copy sent to the task's `init` endpoint: the resource bundle travels separately.
    pub fn sanitized(&self) -> Task {
        let mut copy = self.clone();
        copy.set_resource_bytes(String::new());
        copy
    }

    /// Container image or published ports differ, so the container must be recreated.
    pub fn needs_restart(&self, applied: &Task) -> bool {
        self.repository != applied.repository
            || self.tag != applied.tag
            || self.export_ports != applied.export_ports
    }

    /// Kind-specific configuration differs.
    pub fn access_changed(&self, applied: &Task) -> bool {
        self.access_type != applied.access_type || self.access_param != applied.access_param
    }

    /// Nothing the worker acts on differs.
    pub fn same_revision(&self, applied: &Task) -> bool {
        self.update_time == applied.update_time
            && self.resource_id == applied.resource_id
            && self.resource_bytes == applied.resource_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task_with_ports(raw: &str) -> Task {
        Task {
            export_ports: raw.to_string(),
            ..Task::new("t1")
        }
    }

    #[test]
    fn decodes_loosely_typed_center_payload() {
        let task: Task = serde_json::from_value(json!({
            "id": "t1",
            "name": "gate",
            "repository": "registry/cam",
            "currentTag": "1.2",
            "accessType": "camera",
            "accessParam": {"fps": 5},
            "exportPorts": "[\"80\",\"81\"]",
            "resourceId": "r1",
            "status": "1",
            "delFlag": 0,
            "updateTime": "100",
            "createTime": 90
        }))
        .unwrap();

        assert_eq!(task.tag, "1.2");
        assert_eq!(task.update_time, 100);
        assert!(task.is_active());
        assert!(task.resources_pending());
        assert_eq!(task.image().unwrap(), "registry/cam:1.2");
    }

    #[test]
    fn tag_alias_and_array_ports_are_accepted() {
        let task: Task = serde_json::from_value(json!({
            "id": 7,
            "tag": "latest",
            "exportPorts": [8080, "9090"]
        }))
        .unwrap();
        assert_eq!(task.id, "7");
        assert_eq!(task.tag, "latest");
        assert_eq!(task.export_ports().unwrap(), vec![8080, 9090]);
    }

    #[test]
    fn export_ports_round_trip() {
        assert_eq!(
            task_with_ports("[\"80\",\"81\"]").export_ports().unwrap(),
            vec![80, 81]
        );
        assert_eq!(task_with_ports("").export_ports().unwrap(), Vec::<u16>::new());
    }

    #[test]
    fn malformed_export_ports_are_rejected() {
        for raw in ["not-json", "[\"http\"]", "[70000]", "{\"a\":1}"] {
            let err = task_with_ports(raw).export_ports().unwrap_err();
            assert!(
                matches!(err, TaskError::InvalidExportPorts { .. }),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn deleted_or_stopped_tasks_are_inactive() {
        let mut task = Task::new("t1");
        task.status = STATUS_RUNNING;
        assert!(task.is_active());
        task.del_flag = DELETED_FLAG;
        assert!(!task.is_active());
        task.del_flag = 0;
        task.status = 0;
        assert!(!task.is_active());
    }

    #[test]
    fn sanitized_copy_drops_the_bundle() {
        let mut task = Task::new("t1");
        task.resource_id = "r1".into();
        task.set_resource_bytes("r1,gb1\n");
        assert_eq!(task.resources().len(), 1);

        let clean = task.sanitized();
        let json = serde_json::to_value(&clean).unwrap();
        assert!(json.get("resourceBytes").is_none());
        assert_eq!(json["resourceId"], "r1");
        assert_eq!(json["currentTag"], "");
    }

    #[test]
    fn replacing_bytes_invalidates_decoded_resources() {
        let mut task = Task::new("t1");
        task.set_resource_bytes("r1,gb1\n");
        assert_eq!(task.resources()[0].id, "r1");
        task.set_resource_bytes("r2,gb2\nr3,gb3\n");
        let ids: Vec<_> = task.resources().iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, ["r2", "r3"]);
    }

    #[test]
    fn missing_repository_is_a_configuration_error() {
        assert!(matches!(
            Task::new("t1").image(),
            Err(TaskError::MissingImage { .. })
        ));
    }
}

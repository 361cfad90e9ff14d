//! Task kinds, selected from a task's `accessType`.

use crate::model::Task;

/// Closed set of task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Video/device access; streams arrive over UDP as well as TCP.
    Camera,
    /// Any other workload.
    Generic,
}

/// `accessType` values (case-insensitive) mapped to their kind. Unlisted types are generic.
const KIND_TABLE: &[(&str, TaskKind)] = &[
    ("camera", TaskKind::Camera),
    ("video", TaskKind::Camera),
    ("gb28181", TaskKind::Camera),
    ("rtsp", TaskKind::Camera),
];

impl TaskKind {
    pub fn of(task: &Task) -> Self {
        Self::from_access_type(&task.access_type)
    }

    pub fn from_access_type(access_type: &str) -> Self {
        let access_type = access_type.trim();
        KIND_TABLE
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(access_type))
            .map(|(_, kind)| *kind)
            .unwrap_or(TaskKind::Generic)
    }

    /// Whether published ports are mirrored as UDP.
    pub fn publishes_udp(self) -> bool {
        matches!(self, TaskKind::Camera)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive_and_defaults_to_generic() {
        assert_eq!(TaskKind::from_access_type("Camera"), TaskKind::Camera);
        assert_eq!(TaskKind::from_access_type(" RTSP "), TaskKind::Camera);
        assert_eq!(TaskKind::from_access_type("mqtt"), TaskKind::Generic);
        assert_eq!(TaskKind::from_access_type(""), TaskKind::Generic);
        assert!(TaskKind::Camera.publishes_udp());
        assert!(!TaskKind::Generic.publishes_udp());
    }
}

use std::fmt;
use std::path::PathBuf;

use crate::config::AgentConfig;
use crate::error::TaskError;
use crate::kind::TaskKind;
use crate::model::Task;

/// Name of the container running `task_id`; also its host name on the task network.
pub fn container_name(prefix: &str, task_id: &str) -> String {
    format!("{prefix}{task_id}")
}

/// Node-wide inputs of every `run` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    pub network: String,
    pub name_prefix: String,
    pub log_root: PathBuf,
    pub host: String,
    pub log_level: String,
    pub center_host: Option<String>,
}

impl RunSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            network: config.container.network.clone(),
            name_prefix: config.container.name_prefix.clone(),
            log_root: config.container.log_root.clone(),
            host: config.host.clone(),
            log_level: config.task_log_level.clone(),
            center_host: config.center.host.clone(),
        }
    }
}

/// A fully derived `run --rm -d ...` invocation (arguments after the runtime binary).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommand {
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
}

impl RunCommand {
    /// Derive the run command for `task`. Fails on configuration errors (missing image,
    /// malformed export ports) without touching anything.
    pub fn for_task(
        task: &Task,
        settings: &RunSettings,
        manage_port: u16,
    ) -> Result<Self, TaskError> {
        let image = task.image()?;
        let ports = task.export_ports()?;
        let name = container_name(&settings.name_prefix, &task.id);
        let udp = TaskKind::of(task).publishes_udp();

        let mut args: Vec<String> = ["run", "--rm", "-d"].map(String::from).into();

        for port in ports {
            args.push("-p".into());
            if udp {
                args.push(format!("{port}:{port}/tcp"));
                args.push("-p".into());
                args.push(format!("{port}:{port}/udp"));
            } else {
                args.push(format!("{port}:{port}"));
            }
        }

        args.push("--network".into());
        args.push(settings.network.clone());
        args.push(format!("--name={name}"));

        let mut env = vec![
            ("MANAGE_PORT", manage_port.to_string()),
            ("HOST", settings.host.clone()),
            ("NODE_ID", task.node_id.clone()),
            ("LOG_LEVEL", settings.log_level.clone()),
        ];
        if let Some(center) = &settings.center_host {
            env.push(("CENTER_HOST", center.clone()));
        }
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }

        args.push("-v".into());
        args.push(format!("{}:/logs", settings.log_root.join(&name).display()));
        args.push(image.clone());

        Ok(Self { name, image, args })
    }
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args.join(" "))
    }
}

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{ContainerRuntime, RunCommand};
use crate::error::ContainerError;

/// Maximum stderr kept in an error.
const MAX_STDERR: usize = 2048;

/// Runs the container runtime CLI as a child process.
#[derive(Debug, Clone)]
pub struct ShellRuntime {
    binary: String,
    timeout: Duration,
}

impl ShellRuntime {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Run `<binary> <args..>`, returning trimmed stdout on a zero exit code.
    async fn exec(&self, args: &[String]) -> Result<String, ContainerError> {
        let rendered = format!("{} {}", self.binary, args.join(" "));

        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::Spawn {
                command: rendered.clone(),
                reason: e.to_string(),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ContainerError::Spawn {
                    command: rendered,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ContainerError::Timeout {
                    command: rendered,
                    timeout: self.timeout,
                });
            }
        };

        if !output.status.success() {
            let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.len() > MAX_STDERR {
                let mut end = MAX_STDERR;
                while !stderr.is_char_boundary(end) {
                    end -= 1;
                }
                stderr.truncate(end);
            }
            return Err(ContainerError::Failed {
                command: rendered,
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(command = %rendered, "Container command succeeded");
        Ok(stdout)
    }
}

#[async_trait]
impl ContainerRuntime for ShellRuntime {
    async fn stop(&self, name: &str) -> Result<(), ContainerError> {
        self.exec(&["stop".to_string(), name.to_string()]).await.map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<(), ContainerError> {
        self.exec(&["rm".to_string(), name.to_string()]).await.map(|_| ())
    }

    async fn run(&self, command: &RunCommand) -> Result<String, ContainerError> {
        self.exec(&command.args).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_exit_returns_stdout() {
        let runtime = ShellRuntime::new("echo", Duration::from_secs(5));
        let out = runtime.exec(&["hello".to_string()]).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let runtime = ShellRuntime::new("false", Duration::from_secs(5));
        let err = runtime.stop("task_t1").await.unwrap_err();
        assert!(matches!(err, ContainerError::Failed { code: 1, .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let runtime = ShellRuntime::new("definitely-not-a-runtime-binary", Duration::from_secs(5));
        let err = runtime.remove("task_t1").await.unwrap_err();
        assert!(matches!(err, ContainerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn slow_commands_time_out() {
        let runtime = ShellRuntime::new("sleep", Duration::from_millis(100));
        let err = runtime.exec(&["5".to_string()]).await.unwrap_err();
        assert!(matches!(err, ContainerError::Timeout { .. }));
    }
}

//! Container runtime abstraction.
//!
//! Workers drive task containers through [`ContainerRuntime`]; production uses
//! [`ShellRuntime`], which invokes the runtime CLI (`docker`, `podman`, ...).

mod command;
mod shell;

use async_trait::async_trait;

use crate::error::ContainerError;

pub use command::{RunCommand, RunSettings, container_name};
pub use shell::ShellRuntime;

/// Lifecycle operations on task containers, addressed by container name.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Stop a running container.
    async fn stop(&self, name: &str) -> Result<(), ContainerError>;

    /// Remove a stopped container.
    async fn remove(&self, name: &str) -> Result<(), ContainerError>;

    /// Launch a detached container. Returns the runtime's output (usually the container id).
    async fn run(&self, command: &RunCommand) -> Result<String, ContainerError>;
}

//! Container runtime abstraction.
//!
//! The image builder, provisioner and executor only talk to the container
//! engine through [`ContainerRuntime`]. [`DockerClient`] is the bollard-backed
//! implementation; tests substitute an in-memory fake.
//!
//! Container lifecycle:
//! ```text
//! create → start → (upload → exec)* → remove
//! ```

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::DockerError;

pub mod docker_client;
#[cfg(test)]
pub(crate) mod fake;

pub use docker_client::DockerClient;

/// Result of executing a command in a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Exit code of the command, `-1` when the engine did not report one.
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// What to run when instantiating a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Unique container name.
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: Option<String>,
}

/// Operations the harness needs from a container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build `tag` from a tar archive holding a `Dockerfile` at its root.
    async fn build_image(&self, tag: &str, context: Vec<u8>, nocache: bool)
        -> Result<(), DockerError>;

    /// Every `name:tag` reference known to the engine.
    async fn list_images(&self) -> Result<BTreeSet<String>, DockerError>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError>;

    async fn start_container(&self, id: &str) -> Result<(), DockerError>;

    /// Force-remove a container and its anonymous volumes.
    async fn remove_container(&self, id: &str) -> Result<(), DockerError>;

    /// Write `contents` to the absolute `path` inside a container, mode 0755.
    async fn upload_file(&self, id: &str, path: &str, contents: &[u8]) -> Result<(), DockerError>;

    /// Run `cmd` inside a running container and collect its output.
    async fn exec(&self, id: &str, cmd: &[&str]) -> Result<ExecResult, DockerError>;
}

//! Running scripts inside a live sandbox container.

use std::sync::Arc;
use std::time::Duration;

use super::descriptor::SandboxDescriptor;
use crate::error::SandboxError;
use crate::execution::{ContainerRuntime, ContainerSpec, ExecResult};

/// Where scripts are uploaded inside the sandbox before they run.
const SCRIPT_DIR: &str = "/tmp";

/// A running container instantiated from a [`SandboxDescriptor`].
pub struct Sandbox {
    runtime: Arc<dyn ContainerRuntime>,
    container_id: String,
    image: String,
}

impl Sandbox {
    /// Create and start a container named `name` from `descriptor`.
    pub async fn start(
        runtime: Arc<dyn ContainerRuntime>,
        descriptor: &SandboxDescriptor,
        name: &str,
    ) -> Result<Self, SandboxError> {
        let service = descriptor.service()?;
        let spec = ContainerSpec {
            name: name.to_string(),
            image: service.image.clone(),
            command: vec!["sh".to_string(), "-c".to_string(), service.command.clone()],
            working_dir: Some(service.working_dir.clone()),
        };

        let container_id = runtime.create_container(&spec).await?;
        if let Err(e) = runtime.start_container(&container_id).await {
            if let Err(cleanup) = runtime.remove_container(&container_id).await {
                tracing::warn!(container = %container_id, error = %cleanup, "Failed to remove container after start failure");
            }
            return Err(e.into());
        }

        tracing::debug!(container = %container_id, image = %service.image, "Sandbox started");
        Ok(Self {
            runtime,
            container_id,
            image: service.image.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.container_id
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Run `script` with `bash`, bounded by `timeout`.
    ///
    /// The script is uploaded into the container and run by path, so its
    /// size is not limited by the kernel's per-argument cap. A non-zero exit
    /// status is not an error; the caller inspects the result. No retries.
    pub async fn execute(&self, script: &str, timeout: Duration) -> Result<ExecResult, SandboxError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let path = format!("{SCRIPT_DIR}/sweb-{}.sh", &suffix[..12]);
        let run = async {
            self.runtime
                .upload_file(&self.container_id, &path, script.as_bytes())
                .await?;
            let cmd = ["bash", path.as_str()];
            self.runtime.exec(&self.container_id, &cmd).await
        };
        match tokio::time::timeout(timeout, run).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!(
                    container = %self.container_id,
                    timeout_secs = timeout.as_secs(),
                    "Script execution timed out"
                );
                Err(SandboxError::Timeout {
                    seconds: timeout.as_secs(),
                })
            }
        }
    }

    /// Remove the container.
    pub async fn destroy(self) -> Result<(), SandboxError> {
        self.runtime.remove_container(&self.container_id).await?;
        tracing::debug!(container = %self.container_id, "Sandbox destroyed");
        Ok(())
    }
}

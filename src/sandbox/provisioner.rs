//! Descriptor provisioning with an on-disk cache keyed by image name.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::descriptor::{descriptor_file_name, SandboxDescriptor};
use crate::dataset::BenchmarkInstance;
use crate::error::SandboxError;
use crate::execution::ContainerRuntime;
use crate::images::ImageMappingStore;

pub struct SandboxProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    descriptor_dir: PathBuf,
    working_dir: String,
}

impl SandboxProvisioner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        descriptor_dir: impl Into<PathBuf>,
        working_dir: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            descriptor_dir: descriptor_dir.into(),
            working_dir: working_dir.into(),
        }
    }

    pub fn descriptor_dir(&self) -> &Path {
        &self.descriptor_dir
    }

    /// Path of the descriptor for `image`, creating it on a cache miss.
    ///
    /// A cached descriptor is returned as is. On a miss the image must be
    /// present locally.
    pub async fn provision(&self, image: &str) -> Result<PathBuf, SandboxError> {
        let path = self.descriptor_dir.join(descriptor_file_name(image));
        if path.exists() {
            tracing::debug!(image = %image, path = %path.display(), "Descriptor cache hit");
            return Ok(path);
        }

        let images = self.runtime.list_images().await?;
        if !images.contains(image) {
            return Err(SandboxError::ImageMissing {
                image: image.to_string(),
            });
        }

        let yaml = SandboxDescriptor::for_image(image, &self.working_dir).to_yaml()?;
        std::fs::create_dir_all(&self.descriptor_dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.descriptor_dir)?;
        tmp.write_all(yaml.as_bytes())?;
        tmp.persist(&path).map_err(|e| SandboxError::Io(e.error))?;

        tracing::info!(image = %image, path = %path.display(), "Wrote sandbox descriptor");
        Ok(path)
    }

    /// Resolve the instance's image through `store`, then provision it.
    pub async fn provision_instance(
        &self,
        store: &ImageMappingStore,
        instance: &BenchmarkInstance,
    ) -> Result<PathBuf, SandboxError> {
        let image = store
            .resolve(&instance.instance_id, &instance.environment_setup_commit)
            .await?;
        self.provision(&image).await
    }
}

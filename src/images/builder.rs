//! Environment image builds for a dataset split.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

use super::store::{ImageMappingStore, RecordOutcome};
use crate::dataset::BenchmarkInstance;
use crate::error::{BuildError, DockerError, ScriptError};
use crate::execution::ContainerRuntime;
use crate::scripts::environment::ENV_SCRIPT_NAME;
use crate::scripts::ScriptGenerator;

/// Everything needed to build the environment image of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentBuildSpec {
    pub instance_id: String,
    pub repo: String,
    pub version: String,
    pub base_commit: String,
    pub environment_commit: String,
    pub env_script: String,
    pub dockerfile: String,
    pub image_name: String,
}

impl EnvironmentBuildSpec {
    pub fn for_instance(
        generator: &ScriptGenerator,
        instance: &BenchmarkInstance,
        base_image: &str,
    ) -> Result<Self, ScriptError> {
        let env_script = generator.environment_script(
            &instance.repo,
            &instance.version,
            &instance.environment_setup_commit,
        )?;
        let dockerfile = generator.environment_dockerfile(
            &instance.repo,
            &instance.version,
            &instance.environment_setup_commit,
            base_image,
        )?;
        let image_name =
            environment_image_name(&instance.repo, &instance.version, &dockerfile, &env_script);

        Ok(Self {
            instance_id: instance.instance_id.clone(),
            repo: instance.repo.clone(),
            version: instance.version.clone(),
            base_commit: instance.base_commit.clone(),
            environment_commit: instance.environment_setup_commit.clone(),
            env_script,
            dockerfile,
            image_name,
        })
    }

    /// Tar archive holding `Dockerfile` and the environment script.
    pub fn build_context(&self) -> std::io::Result<Vec<u8>> {
        let mut archive = tar::Builder::new(Vec::new());
        for (name, content, mode) in [
            ("Dockerfile", self.dockerfile.as_bytes(), 0o644),
            (ENV_SCRIPT_NAME, self.env_script.as_bytes(), 0o755),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(mode);
            header.set_mtime(0);
            archive.append_data(&mut header, name, content)?;
        }
        archive.into_inner()
    }
}

/// `sweb.env.<repo-slug>.<version>.<hash>:latest`, where the hash covers the
/// Dockerfile and environment script.
pub fn environment_image_name(
    repo: &str,
    version: &str,
    dockerfile: &str,
    env_script: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dockerfile.as_bytes());
    hasher.update(env_script.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!(
        "sweb.env.{}.{}.{}:latest",
        repo.replace('/', "__").to_lowercase(),
        version,
        &digest[..16]
    )
}

/// Batch build options.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Maximum number of concurrent image builds.
    pub max_workers: usize,
    /// Rebuild images that already exist.
    pub force_rebuild: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            force_rebuild: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildFailure {
    pub instance_id: String,
    pub reason: String,
}

/// Result of a batch build.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    /// Images built in this run.
    pub built: Vec<String>,
    /// Images that already existed.
    pub skipped: Vec<String>,
    pub failed: Vec<BuildFailure>,
    /// Mapping entries newly recorded.
    pub recorded: usize,
    /// Mapping entries that were already present with the same image.
    pub unchanged: usize,
}

/// Builds environment images and records them in the mapping store.
pub struct ImageBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    generator: ScriptGenerator,
    store: Arc<ImageMappingStore>,
    base_image: String,
}

impl ImageBuilder {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        generator: ScriptGenerator,
        store: Arc<ImageMappingStore>,
        base_image: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            generator,
            store,
            base_image: base_image.into(),
        }
    }

    /// Build every image `instances` need and record the mapping.
    ///
    /// Per-instance failures (no specification, failed build) are reported
    /// and skipped. An image missing after a successful build, a mapping
    /// conflict and engine errors abort the batch.
    pub async fn build(
        &self,
        instances: &[BenchmarkInstance],
        options: &BuildOptions,
    ) -> Result<BuildReport, BuildError> {
        let mut report = BuildReport::default();

        let mut planned = Vec::with_capacity(instances.len());
        for instance in instances {
            match EnvironmentBuildSpec::for_instance(&self.generator, instance, &self.base_image) {
                Ok(spec) => planned.push(spec),
                Err(e) => {
                    tracing::warn!(instance_id = %instance.instance_id, error = %e, "Skipping instance");
                    report.failed.push(BuildFailure {
                        instance_id: instance.instance_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        // Equal names hash equal artifacts, so any spec stands for its image.
        let mut unique: BTreeMap<&str, &EnvironmentBuildSpec> = BTreeMap::new();
        for spec in &planned {
            unique.entry(spec.image_name.as_str()).or_insert(spec);
        }

        let existing = self.runtime.list_images().await?;
        let mut to_build = Vec::new();
        for (name, spec) in unique {
            if existing.contains(name) && !options.force_rebuild {
                tracing::debug!(image = %name, "Image exists, skipping build");
                report.skipped.push(name.to_string());
            } else {
                to_build.push(spec);
            }
        }

        tracing::info!(
            instances = instances.len(),
            to_build = to_build.len(),
            skipped = report.skipped.len(),
            max_workers = options.max_workers,
            "Building environment images"
        );

        let semaphore = Arc::new(Semaphore::new(options.max_workers.max(1)));
        let builds = to_build.into_iter().map(|spec| {
            let semaphore = semaphore.clone();
            async move {
                let result = self.build_one(&semaphore, spec, options.force_rebuild).await;
                (spec.image_name.clone(), result)
            }
        });
        let results = futures::future::join_all(builds).await;

        let mut failed_images: BTreeMap<String, String> = BTreeMap::new();
        for (image, result) in results {
            match result {
                Ok(()) => report.built.push(image),
                Err(e) => {
                    tracing::error!(image = %image, error = %e, "Image build failed");
                    failed_images.insert(image, e.to_string());
                }
            }
        }

        let available: BTreeSet<String> = self.runtime.list_images().await?;
        for spec in &planned {
            if let Some(reason) = failed_images.get(&spec.image_name) {
                report.failed.push(BuildFailure {
                    instance_id: spec.instance_id.clone(),
                    reason: reason.clone(),
                });
                continue;
            }
            if !available.contains(&spec.image_name) {
                return Err(BuildError::ImageMissingAfterBuild {
                    instance_id: spec.instance_id.clone(),
                    image: spec.image_name.clone(),
                });
            }
            match self
                .store
                .record(&spec.instance_id, &spec.environment_commit, &spec.image_name)
                .await?
            {
                RecordOutcome::Inserted => report.recorded += 1,
                RecordOutcome::Unchanged => report.unchanged += 1,
            }
        }

        self.store.flush().await?;

        tracing::info!(
            built = report.built.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            recorded = report.recorded,
            "Image build finished"
        );
        Ok(report)
    }

    async fn build_one(
        &self,
        semaphore: &Semaphore,
        spec: &EnvironmentBuildSpec,
        nocache: bool,
    ) -> Result<(), DockerError> {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|e| DockerError::BuildFailed(format!("build queue closed: {e}")))?;
        tracing::info!(image = %spec.image_name, repo = %spec.repo, version = %spec.version, "Building image");
        let context = spec.build_context()?;
        self.runtime
            .build_image(&spec.image_name, context, nocache)
            .await
    }
}

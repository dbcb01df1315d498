//! Error types for swe-bench-harness operations.
//!
//! Defines error types for each subsystem of the evaluation pipeline:
//! - Image mapping persistence and lookup
//! - Docker image, container and exec management
//! - Environment image builds
//! - Sandbox provisioning
//! - Repository specifications and script generation
//! - Dataset loading
//! - Harness configuration

use thiserror::Error;

/// Remediation appended to every "image is not there yet" style error.
pub const BUILD_REMEDY: &str =
    "run `swe-bench-harness build-images --dataset <name> --split <split>` first";

/// Errors raised by the image mapping store.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error(
        "Conflicting image mapping for instance '{instance_id}' at environment commit \
         '{environment_commit}': already mapped to '{existing}', refusing to remap to '{attempted}'"
    )]
    Conflict {
        instance_id: String,
        environment_commit: String,
        existing: String,
        attempted: String,
    },

    #[error(
        "No image mapped for instance '{instance_id}' at environment commit \
         '{environment_commit}'; {remedy}",
        remedy = BUILD_REMEDY
    )]
    NotFound {
        instance_id: String,
        environment_commit: String,
    },

    #[error("Image mapping file '{0}' does not exist; {remedy}", remedy = BUILD_REMEDY)]
    MissingStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker build failed: {0}")]
    BuildFailed(String),

    #[error("Docker run failed: {0}")]
    RunFailed(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to list images: {0}")]
    ListFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal errors of an image build batch. Per-instance failures are reported
/// in the build report instead.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(
        "Image '{image}' for instance '{instance_id}' is missing after its build reported \
         success; the build failed silently"
    )]
    ImageMissingAfterBuild { instance_id: String, image: String },

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Docker(#[from] DockerError),
}

/// Errors that can occur while provisioning or driving a sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Image '{image}' not found among local images; {remedy}", remedy = BUILD_REMEDY)]
    ImageMissing { image: String },

    #[error("Sandbox descriptor '{0}' not found")]
    DescriptorMissing(String),

    #[error("Invalid sandbox descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Execution timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors raised by the repository specification registry.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("No specification registered for repository '{0}'")]
    UnknownRepo(String),

    #[error("No specification registered for repository '{repo}' at version '{version}'")]
    UnknownVersion { repo: String, version: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors raised while generating setup, eval or environment scripts.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Invalid repository name '{value}': {reason}")]
    InvalidRepo { value: String, reason: String },

    #[error("Invalid git ref '{value}': {reason}")]
    InvalidRef { value: String, reason: String },

    #[error(transparent)]
    Spec(#[from] SpecError),
}

/// Errors that can occur while loading a benchmark split.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Failed to parse dataset record: {0}")]
    Parse(String),

    #[error("Instance '{0}' not found in dataset")]
    InstanceNotFound(String),

    #[error("Unsupported dataset file '{0}': expected .json or .jsonl")]
    UnsupportedFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while loading or validating the harness configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_mentions_build_step() {
        let err = MappingError::NotFound {
            instance_id: "pvlib__pvlib-python-1854".to_string(),
            environment_commit: "6072e0982c3c0236f532ddfa48fbf461180d834e".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pvlib__pvlib-python-1854"));
        assert!(msg.contains("build-images"));
    }

    #[test]
    fn test_conflict_names_both_images() {
        let err = MappingError::Conflict {
            instance_id: "a".to_string(),
            environment_commit: "c".to_string(),
            existing: "img-1".to_string(),
            attempted: "img-2".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("img-1"));
        assert!(msg.contains("img-2"));
    }

    #[test]
    fn test_sandbox_error_wraps_mapping_transparently() {
        let inner = MappingError::MissingStore("/tmp/map.json".to_string());
        let expected = inner.to_string();
        let err: SandboxError = inner.into();
        assert_eq!(err.to_string(), expected);
    }
}

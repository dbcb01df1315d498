//! Harness configuration.
//!
//! Every field has a default. A YAML file may override any subset of them and
//! CLI flags override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::scripts::SandboxLayout;

/// Configuration shared by the build and evaluation commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    // Storage
    /// Image mapping file written by `build-images`.
    pub mapping_path: PathBuf,
    /// Directory holding cached sandbox descriptors.
    pub descriptor_dir: PathBuf,
    /// Optional YAML file extending the built-in repository specifications.
    pub specs_path: Option<PathBuf>,

    // Images
    /// Base image for environment images.
    pub base_image: String,
    /// Maximum concurrent image builds.
    pub build_workers: usize,

    // Sandbox layout
    pub repo_dir: String,
    pub conda_root: String,
    pub env_name: String,

    // Evaluation
    /// Timeout for the setup script, in seconds.
    pub setup_timeout_secs: u64,
    /// Timeout for the eval script, in seconds.
    pub eval_timeout_secs: u64,
    /// Maximum concurrent evaluations.
    pub eval_workers: usize,
    /// Keep sandboxes running after evaluation, for debugging.
    pub keep_sandboxes: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mapping_path: PathBuf::from("./swe_bench_images.json"),
            descriptor_dir: PathBuf::from("./compose_files"),
            specs_path: None,

            base_image: "ubuntu:22.04".to_string(),
            build_workers: 4,

            repo_dir: "/testbed".to_string(),
            conda_root: "/opt/miniconda3".to_string(),
            env_name: "testbed".to_string(),

            setup_timeout_secs: 1800, // 30 minutes
            eval_timeout_secs: 1800,
            eval_workers: 1,
            keep_sandboxes: false,
        }
    }
}

impl HarnessConfig {
    /// Parse a configuration from YAML; absent keys keep their defaults.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                let config = Self::from_yaml(&content)?;
                tracing::debug!(path = %path.display(), "Loaded harness configuration");
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| {
            Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            })
        };
        if self.build_workers == 0 {
            return invalid("build_workers", "must be at least 1");
        }
        if self.eval_workers == 0 {
            return invalid("eval_workers", "must be at least 1");
        }
        if self.setup_timeout_secs == 0 {
            return invalid("setup_timeout_secs", "must be greater than 0");
        }
        if self.eval_timeout_secs == 0 {
            return invalid("eval_timeout_secs", "must be greater than 0");
        }
        for (key, value) in [
            ("repo_dir", &self.repo_dir),
            ("conda_root", &self.conda_root),
        ] {
            if !value.starts_with('/') {
                return invalid(key, "must be an absolute path");
            }
        }
        if self.env_name.is_empty() {
            return invalid("env_name", "must not be empty");
        }
        if self.base_image.trim().is_empty() {
            return invalid("base_image", "must not be empty");
        }
        Ok(())
    }

    pub fn layout(&self) -> SandboxLayout {
        SandboxLayout {
            repo_dir: self.repo_dir.clone(),
            conda_root: self.conda_root.clone(),
            env_name: self.env_name.clone(),
        }
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    pub fn eval_timeout(&self) -> Duration {
        Duration::from_secs(self.eval_timeout_secs)
    }
}

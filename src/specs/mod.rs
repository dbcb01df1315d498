//! Repository specifications keyed by `(repo, version)`.
//!
//! A specification tells the harness how to build the environment for a
//! repository version, how to install the checkout, which commands must run
//! before the tests, the test command itself and which log parser reads the
//! output. The built-in table ships with the crate as YAML and can be
//! extended or overridden by a user file with the same layout.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SpecError;
use crate::scoring::LogFormat;

const BUILTIN_SPECS: &str = include_str!("builtin.yaml");

/// Fully resolved specification for one repository version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSpec {
    /// Python version for the conda environment.
    pub python: String,
    /// Test runner invocation; test directives are appended to it.
    pub test_cmd: String,
    /// Version-specific install step, run last during setup.
    pub install: String,
    /// Version-specific steps run before `install`.
    pub pre_install: Vec<String>,
    /// Commands run at the start of the eval script.
    pub eval_commands: Vec<String>,
    /// Extra conda packages for the environment, space separated.
    pub conda_packages: String,
    /// Extra pip packages for the environment.
    pub pip_packages: Vec<String>,
    /// Requirements file path inside the repository, fetched at the
    /// environment-setup commit while building the image.
    pub requirements: Option<String>,
}

/// Partial specification; `None` inherits from the repository defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpecOverrides {
    #[serde(default)]
    pub python: Option<String>,
    #[serde(default)]
    pub test_cmd: Option<String>,
    #[serde(default)]
    pub install: Option<String>,
    #[serde(default)]
    pub pre_install: Option<Vec<String>>,
    #[serde(default)]
    pub eval_commands: Option<Vec<String>>,
    #[serde(default)]
    pub conda_packages: Option<String>,
    #[serde(default)]
    pub pip_packages: Option<Vec<String>>,
    #[serde(default)]
    pub requirements: Option<String>,
}

impl SpecOverrides {
    fn layered_on(&self, base: &SpecOverrides) -> SpecOverrides {
        SpecOverrides {
            python: self.python.clone().or_else(|| base.python.clone()),
            test_cmd: self.test_cmd.clone().or_else(|| base.test_cmd.clone()),
            install: self.install.clone().or_else(|| base.install.clone()),
            pre_install: self.pre_install.clone().or_else(|| base.pre_install.clone()),
            eval_commands: self
                .eval_commands
                .clone()
                .or_else(|| base.eval_commands.clone()),
            conda_packages: self
                .conda_packages
                .clone()
                .or_else(|| base.conda_packages.clone()),
            pip_packages: self
                .pip_packages
                .clone()
                .or_else(|| base.pip_packages.clone()),
            requirements: self
                .requirements
                .clone()
                .or_else(|| base.requirements.clone()),
        }
    }

    fn resolve(self) -> RepoSpec {
        RepoSpec {
            python: self.python.unwrap_or_else(|| "3.9".to_string()),
            test_cmd: self.test_cmd.unwrap_or_else(|| "pytest -rA".to_string()),
            install: self.install.unwrap_or_default(),
            pre_install: self.pre_install.unwrap_or_default(),
            eval_commands: self.eval_commands.unwrap_or_default(),
            conda_packages: self.conda_packages.unwrap_or_default(),
            pip_packages: self.pip_packages.unwrap_or_default(),
            requirements: self.requirements,
        }
    }
}

/// Everything registered for one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoEntry {
    /// Parser variant for this repository's test output.
    pub parser: LogFormat,
    /// Generic install step run before any version-specific step.
    #[serde(default)]
    pub install: String,
    /// Values shared by every version.
    #[serde(default)]
    pub defaults: SpecOverrides,
    /// Supported versions and their overrides.
    #[serde(default)]
    pub versions: BTreeMap<String, SpecOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SpecFile {
    #[serde(default)]
    repos: BTreeMap<String, RepoEntry>,
}

/// Lookup table from repository identifier to its [`RepoEntry`].
#[derive(Debug, Clone, Default)]
pub struct SpecRegistry {
    repos: BTreeMap<String, RepoEntry>,
}

impl SpecRegistry {
    /// Registry holding the built-in table.
    pub fn builtin() -> Result<Self, SpecError> {
        Self::from_yaml(BUILTIN_SPECS)
    }

    /// Parse a registry from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, SpecError> {
        let file: SpecFile = serde_yaml::from_str(content)?;
        Ok(Self { repos: file.repos })
    }

    /// Built-in table extended by the file at `path`, if any.
    pub fn load(path: Option<&Path>) -> Result<Self, SpecError> {
        let mut registry = Self::builtin()?;
        if let Some(path) = path {
            let content = std::fs::read_to_string(path)?;
            let overrides = Self::from_yaml(&content)?;
            tracing::info!(
                path = %path.display(),
                repos = overrides.repos.len(),
                "Loaded repository specification overrides"
            );
            registry.merge(overrides);
        }
        Ok(registry)
    }

    /// Merge `other` into this registry. Repositories in `other` replace the
    /// parser, generic install and defaults; versions are merged per key.
    pub fn merge(&mut self, other: SpecRegistry) {
        for (repo, entry) in other.repos {
            match self.repos.get_mut(&repo) {
                Some(existing) => {
                    existing.parser = entry.parser;
                    existing.install = entry.install;
                    existing.defaults = entry.defaults;
                    existing.versions.extend(entry.versions);
                }
                None => {
                    self.repos.insert(repo, entry);
                }
            }
        }
    }

    fn entry(&self, repo: &str) -> Result<&RepoEntry, SpecError> {
        self.repos
            .get(repo)
            .ok_or_else(|| SpecError::UnknownRepo(repo.to_string()))
    }

    /// Resolved specification for `repo` at `version`.
    pub fn spec(&self, repo: &str, version: &str) -> Result<RepoSpec, SpecError> {
        let entry = self.entry(repo)?;
        let overrides = entry
            .versions
            .get(version)
            .ok_or_else(|| SpecError::UnknownVersion {
                repo: repo.to_string(),
                version: version.to_string(),
            })?;
        Ok(overrides.layered_on(&entry.defaults).resolve())
    }

    /// Generic install step for `repo`.
    pub fn repo_install(&self, repo: &str) -> Result<&str, SpecError> {
        Ok(self.entry(repo)?.install.as_str())
    }

    /// Log parser variant for `repo`.
    pub fn log_format(&self, repo: &str) -> Result<LogFormat, SpecError> {
        Ok(self.entry(repo)?.parser)
    }

    /// Registered repository identifiers.
    pub fn repos(&self) -> impl Iterator<Item = &str> {
        self.repos.keys().map(String::as_str)
    }
}

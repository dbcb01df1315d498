//! Bash script generation for sandboxes and environment images.
//!
//! Everything here is a pure function of its inputs and the
//! [`SpecRegistry`]: the same instance always yields byte-identical scripts.
//! Values interpolated into scripts are either validated ([`validate_repo_name`],
//! [`validate_git_ref`]) or quoted with [`shell_quote`].

use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::error::ScriptError;
use crate::specs::SpecRegistry;

pub mod agent;
pub mod environment;
pub mod eval;
pub mod setup;

/// Where the repository and the conda environment live inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLayout {
    pub repo_dir: String,
    pub conda_root: String,
    pub env_name: String,
}

impl Default for SandboxLayout {
    fn default() -> Self {
        Self {
            repo_dir: "/testbed".to_string(),
            conda_root: "/opt/miniconda3".to_string(),
            env_name: "testbed".to_string(),
        }
    }
}

impl SandboxLayout {
    /// Lines that activate the conda environment.
    fn activate(&self) -> String {
        format!(
            "source {}/bin/activate\nconda activate {}",
            shell_quote(&self.conda_root),
            shell_quote(&self.env_name)
        )
    }
}

/// Produces setup, eval and environment scripts from the registry.
#[derive(Debug, Clone)]
pub struct ScriptGenerator {
    specs: Arc<SpecRegistry>,
    layout: SandboxLayout,
}

impl ScriptGenerator {
    pub fn new(specs: Arc<SpecRegistry>, layout: SandboxLayout) -> Self {
        Self { specs, layout }
    }

    pub fn specs(&self) -> &SpecRegistry {
        &self.specs
    }

    pub fn layout(&self) -> &SandboxLayout {
        &self.layout
    }
}

/// Quote `s` for a POSIX shell.
///
/// Strings made only of safe characters pass through unchanged; anything
/// else is wrapped in single quotes with embedded quotes spelled `'"'"'`.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    let safe = s.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '@' | '%' | '+' | '=' | ':' | ',' | '.' | '/' | '_' | '-')
    });
    if safe {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// Validate a git ref (commit SHA, branch or tag) before interpolating it
/// into a shell command.
pub fn validate_git_ref(s: &str) -> Result<(), ScriptError> {
    let invalid = |reason: String| ScriptError::InvalidRef {
        value: s.to_string(),
        reason,
    };
    if s.is_empty() {
        return Err(invalid("git ref is empty".to_string()));
    }
    if s.len() > 256 {
        return Err(invalid(format!("too long ({} chars, max 256)", s.len())));
    }
    if s.starts_with('-') {
        return Err(invalid(
            "must not start with '-' (could be interpreted as a flag)".to_string(),
        ));
    }
    if s.contains("..") {
        return Err(invalid("must not contain '..'".to_string()));
    }
    if let Some(ch) = s
        .chars()
        .find(|ch| !matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '/' | '.' | '-' | '_' | '~' | '^'))
    {
        return Err(invalid(format!(
            "invalid character '{ch}': only alphanumeric, /, ., -, _, ~, ^ allowed"
        )));
    }
    Ok(())
}

/// Validate a GitHub repository name (`owner/repo`) before interpolating it
/// into a shell command.
pub fn validate_repo_name(s: &str) -> Result<(), ScriptError> {
    let invalid = |reason: String| ScriptError::InvalidRepo {
        value: s.to_string(),
        reason,
    };
    if s.is_empty() {
        return Err(invalid("repository name is empty".to_string()));
    }
    if s.len() > 256 {
        return Err(invalid(format!("too long ({} chars, max 256)", s.len())));
    }
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() != 2 {
        return Err(invalid("expected 'owner/repo' format".to_string()));
    }
    for part in &parts {
        if part.is_empty() {
            return Err(invalid("owner and repo must be non-empty".to_string()));
        }
        if part.starts_with('.') || part.starts_with('-') {
            return Err(invalid("parts must not start with '.' or '-'".to_string()));
        }
        if let Some(ch) = part
            .chars()
            .find(|ch| !matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.'))
        {
            return Err(invalid(format!(
                "invalid character '{ch}': only alphanumeric, -, _, . allowed"
            )));
        }
    }
    Ok(())
}

fn old_file_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^--- a/(.*)$").expect("old file header pattern is valid"))
}

fn diff_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^diff --git a/.* b/(.*)$").expect("diff header pattern is valid")
    })
}

/// Pre-existing files a patch modifies, from its `--- a/` headers.
///
/// Files the patch creates have `--- /dev/null` and are not listed.
pub fn test_patch_files(patch: &str) -> Vec<String> {
    old_file_header()
        .captures_iter(patch)
        .map(|caps| caps[1].trim_end().to_string())
        .collect()
}

/// Extensions of files touched by a test patch that are never test targets.
const NON_TEST_EXTS: [&str; 11] = [
    ".json", ".png", "csv", ".txt", ".md", ".jpg", ".jpeg", ".pkl", ".yml", ".yaml", ".toml",
];

/// Test targets to pass to the test command, derived from the patch's
/// `diff --git` headers.
///
/// Django's runner takes dotted module labels, so for `django/django`
/// `tests/auth_tests/test_views.py` becomes `auth_tests.test_views`.
pub fn test_directives(repo: &str, test_patch: &str) -> Vec<String> {
    let directives = diff_header()
        .captures_iter(test_patch)
        .map(|caps| caps[1].trim_end().to_string())
        .filter(|path| !NON_TEST_EXTS.iter().any(|ext| path.ends_with(ext)));

    if repo != "django/django" {
        return directives.collect();
    }
    directives
        .map(|path| {
            let path = path.strip_suffix(".py").unwrap_or(&path);
            let path = path.strip_prefix("tests/").unwrap_or(path);
            path.replace('/', ".")
        })
        .collect()
}

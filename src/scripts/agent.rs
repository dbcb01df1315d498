//! Scripts that stand in for the agent: apply a candidate patch, and capture
//! whatever the sandbox checkout now differs by.

use super::{shell_quote, validate_git_ref, ScriptGenerator};
use crate::error::ScriptError;
use crate::scoring::APPLY_PATCH_FAIL;

/// Where a candidate patch is written inside the sandbox.
pub const AGENT_PATCH_PATH: &str = "/tmp/agent_patch.diff";

/// Where the captured agent diff is written inside the sandbox.
pub const MODEL_PATCH_PATH: &str = "/tmp/model.patch";

impl ScriptGenerator {
    /// Apply `patch` to the checkout, falling back to fuzzy `patch` when
    /// `git apply` refuses it.
    pub fn apply_patch_script(&self, patch: &str) -> String {
        let repo_dir = shell_quote(&self.layout.repo_dir);
        format!(
            "cd {repo_dir}\n\
             printf '%s' {} > {AGENT_PATCH_PATH}\n\
             git apply -v {AGENT_PATCH_PATH} || patch --batch --fuzz=5 -p1 -i {AGENT_PATCH_PATH} || echo {}\n",
            shell_quote(patch),
            shell_quote(APPLY_PATCH_FAIL)
        )
    }

    /// Print the checkout's diff against `base_commit`, new files included.
    pub fn capture_patch_script(&self, base_commit: &str) -> Result<String, ScriptError> {
        validate_git_ref(base_commit)?;
        let repo_dir = shell_quote(&self.layout.repo_dir);
        Ok(format!(
            "cd {repo_dir}\n\
             git add -A\n\
             git diff --cached {base_commit} > {MODEL_PATCH_PATH}\n\
             cat {MODEL_PATCH_PATH}\n"
        ))
    }
}

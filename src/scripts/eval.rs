//! Eval script: reset test files, apply the hidden test patch, run the tests.

use super::{
    shell_quote, test_directives, test_patch_files, validate_git_ref, validate_repo_name,
    ScriptGenerator,
};
use crate::error::ScriptError;
use crate::scoring::{APPLY_PATCH_FAIL, RESET_FAILED};

/// Where the test patch is written inside the sandbox.
pub const TEST_PATCH_PATH: &str = "/tmp/test_patch.diff";

impl ScriptGenerator {
    /// Script that evaluates the current state of the sandbox checkout.
    ///
    /// Failures to reset or apply echo the scorer's infrastructure
    /// signatures; the script keeps going so the output is always complete.
    pub fn eval_script(
        &self,
        test_patch: &str,
        repo: &str,
        version: &str,
        base_commit: &str,
    ) -> Result<String, ScriptError> {
        validate_repo_name(repo)?;
        validate_git_ref(base_commit)?;
        let spec = self.specs.spec(repo, version)?;
        let repo_dir = shell_quote(&self.layout.repo_dir);
        let activate = format!("set -x\n{}\nset +x", self.layout.activate());

        let mut lines = vec![
            "#!/bin/bash".to_string(),
            "set -uox pipefail".to_string(),
            String::new(),
            format!("cd {repo_dir}"),
            activate.clone(),
            String::new(),
        ];
        lines.extend(spec.eval_commands.iter().cloned());
        lines.push(String::new());
        lines.push(format!("cd {repo_dir}"));
        lines.push(activate);
        lines.push(String::new());

        let files = test_patch_files(test_patch);
        if !files.is_empty() {
            let quoted: Vec<String> = files.iter().map(|f| shell_quote(f)).collect();
            lines.push(format!(
                "git checkout {base_commit} -- {} || echo {}",
                quoted.join(" "),
                shell_quote(RESET_FAILED)
            ));
        }

        lines.push(format!(
            "printf '%s' {} > {TEST_PATCH_PATH}",
            shell_quote(test_patch)
        ));
        lines.push(format!(
            "git apply --check {TEST_PATCH_PATH} || echo {}",
            shell_quote(APPLY_PATCH_FAIL)
        ));
        lines.push(format!(
            "git apply {TEST_PATCH_PATH} || echo {}",
            shell_quote(APPLY_PATCH_FAIL)
        ));
        lines.push(String::new());

        let directives: Vec<String> = test_directives(repo, test_patch)
            .iter()
            .map(|d| shell_quote(d))
            .collect();
        if directives.is_empty() {
            lines.push(spec.test_cmd.clone());
        } else {
            lines.push(format!("{} {}", spec.test_cmd, directives.join(" ")));
        }

        let mut script = lines.join("\n");
        script.push('\n');
        Ok(script)
    }
}

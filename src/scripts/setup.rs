//! Setup script: clone the repository at the base commit and install it.

use super::{shell_quote, validate_git_ref, validate_repo_name, ScriptGenerator};
use crate::error::ScriptError;

impl ScriptGenerator {
    /// Script that prepares a fresh sandbox for `repo` at `base_commit`.
    ///
    /// Install steps run in a fixed order: the repository's generic install,
    /// then the version's pre-install steps, then the version's install step.
    pub fn setup_script(
        &self,
        repo: &str,
        version: &str,
        base_commit: &str,
    ) -> Result<String, ScriptError> {
        validate_repo_name(repo)?;
        validate_git_ref(base_commit)?;
        let spec = self.specs.spec(repo, version)?;
        let generic_install = self.specs.repo_install(repo)?;
        let repo_dir = shell_quote(&format!("{}/", self.layout.repo_dir));

        let mut lines = vec![
            "#!/bin/bash".to_string(),
            "set -euxo pipefail".to_string(),
            String::new(),
            format!("git clone -o origin https://github.com/{repo} {repo_dir}"),
            format!("chmod -R 777 {repo_dir}"),
            format!("cd {repo_dir}"),
            format!("git reset --hard {base_commit}"),
            "git remote remove origin".to_string(),
            String::new(),
            self.layout.activate(),
        ];
        if !generic_install.is_empty() {
            lines.push(generic_install.to_string());
        }
        lines.extend(spec.pre_install.iter().cloned());
        if !spec.install.is_empty() {
            lines.push(spec.install.clone());
        }

        let mut script = lines.join("\n");
        script.push('\n');
        Ok(script)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::scripts::SandboxLayout;
    use crate::specs::SpecRegistry;

    fn generator() -> ScriptGenerator {
        ScriptGenerator::new(
            Arc::new(SpecRegistry::builtin().unwrap()),
            SandboxLayout::default(),
        )
    }

    const BASE: &str = "27a3a07ebc84b11014d3753e4923902adf9a38c0";

    #[test]
    fn test_setup_script_order() {
        let script = generator().setup_script("django/django", "4.0", BASE).unwrap();
        assert!(script.starts_with("#!/bin/bash\nset -euxo pipefail\n"));

        let reset = format!("git reset --hard {BASE}");
        let positions: Vec<usize> = [
            "git clone -o origin https://github.com/django/django /testbed/",
            "chmod -R 777 /testbed/",
            reset.as_str(),
            "git remote remove origin",
            "conda activate testbed",
            "apt-get update && apt-get install -y locales",
            "locale-gen en_US.UTF-8",
            "python -m pip install -e .",
        ]
        .iter()
        .map(|needle| script.find(needle).unwrap_or_else(|| panic!("missing {needle}")))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{script}");
    }

    #[test]
    fn test_setup_script_is_deterministic() {
        let g = generator();
        let a = g.setup_script("pvlib/pvlib-python", "0.9", BASE).unwrap();
        let b = g.setup_script("pvlib/pvlib-python", "0.9", BASE).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_setup_script_rejects_injection() {
        let g = generator();
        assert!(matches!(
            g.setup_script("django/django", "4.0", "abc; rm -rf /"),
            Err(ScriptError::InvalidRef { .. })
        ));
        assert!(matches!(
            g.setup_script("django/django && id", "4.0", BASE),
            Err(ScriptError::InvalidRepo { .. })
        ));
    }

    #[test]
    fn test_setup_script_unknown_version() {
        assert!(matches!(
            generator().setup_script("django/django", "0.1", BASE),
            Err(ScriptError::Spec(_))
        ));
    }
}

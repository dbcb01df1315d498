//! Environment image artifacts: the conda setup script and its Dockerfile.
//!
//! Both embed the environment-setup commit, so the image name derived from
//! their hash changes whenever the dependency state does.

use super::{shell_quote, validate_git_ref, validate_repo_name, ScriptGenerator};
use crate::error::ScriptError;

/// File name of the environment script inside the build context.
pub const ENV_SCRIPT_NAME: &str = "setup_env.sh";

const MINICONDA_URL: &str =
    "https://repo.anaconda.com/miniconda/Miniconda3-py311_23.11.0-2-Linux-x86_64.sh";

const SYSTEM_PACKAGES: &str = "wget git build-essential libffi-dev libtiff-dev python3 \
python3-pip python-is-python3 jq curl locales locales-all tzdata";

impl ScriptGenerator {
    /// Script that creates the conda environment for `repo` at `version`.
    pub fn environment_script(
        &self,
        repo: &str,
        version: &str,
        env_commit: &str,
    ) -> Result<String, ScriptError> {
        validate_repo_name(repo)?;
        validate_git_ref(env_commit)?;
        let spec = self.specs.spec(repo, version)?;
        let conda_root = shell_quote(&self.layout.conda_root);
        let env_name = shell_quote(&self.layout.env_name);

        let mut lines = vec![
            "#!/bin/bash".to_string(),
            "set -euxo pipefail".to_string(),
            format!("source {conda_root}/bin/activate"),
        ];

        let mut create = format!(
            "conda create -n {env_name} python={}",
            shell_quote(&spec.python)
        );
        if !spec.conda_packages.is_empty() {
            create.push(' ');
            create.push_str(&spec.conda_packages);
        }
        create.push_str(" -y");
        lines.push(create);
        lines.push(format!("conda activate {env_name}"));

        if let Some(requirements) = &spec.requirements {
            let url = format!(
                "https://raw.githubusercontent.com/{repo}/{env_commit}/{requirements}"
            );
            lines.push(format!(
                "curl -fsSL {} -o /root/requirements.txt",
                shell_quote(&url)
            ));
            lines.push("python -m pip install -r /root/requirements.txt".to_string());
            lines.push("rm /root/requirements.txt".to_string());
        }

        if !spec.pip_packages.is_empty() {
            let packages: Vec<String> = spec.pip_packages.iter().map(|p| shell_quote(p)).collect();
            lines.push(format!("python -m pip install {}", packages.join(" ")));
        }

        let mut script = lines.join("\n");
        script.push('\n');
        Ok(script)
    }

    /// Dockerfile that installs Miniconda on `base_image` and runs the
    /// environment script.
    pub fn environment_dockerfile(
        &self,
        repo: &str,
        version: &str,
        env_commit: &str,
        base_image: &str,
    ) -> Result<String, ScriptError> {
        validate_repo_name(repo)?;
        validate_git_ref(env_commit)?;
        // Unknown versions are rejected here too so both artifacts agree.
        self.specs.spec(repo, version)?;
        let conda_root = &self.layout.conda_root;
        let env_name = &self.layout.env_name;
        let repo_dir = &self.layout.repo_dir;

        Ok(format!(
            r#"FROM {base_image}

ARG DEBIAN_FRONTEND=noninteractive
ENV TZ=Etc/UTC

RUN apt-get update && apt-get install -y {SYSTEM_PACKAGES} && rm -rf /var/lib/apt/lists/*

RUN wget '{MINICONDA_URL}' -O miniconda.sh \
    && bash miniconda.sh -b -p {conda_root} \
    && rm miniconda.sh
ENV PATH={conda_root}/bin:$PATH
RUN conda init --all
RUN conda config --append channels conda-forge

LABEL swebench.repo="{repo}" swebench.version="{version}" swebench.environment_commit="{env_commit}"

COPY ./{ENV_SCRIPT_NAME} /root/
RUN chmod +x /root/{ENV_SCRIPT_NAME} && /bin/bash -c "source ~/.bashrc && /root/{ENV_SCRIPT_NAME}"

WORKDIR {repo_dir}/
RUN echo "source {conda_root}/etc/profile.d/conda.sh && conda activate {env_name}" > /root/.bashrc
"#
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::scripts::SandboxLayout;
    use crate::specs::SpecRegistry;

    const ENV_COMMIT: &str = "6072e0982c3c0236f532ddfa48fbf461180d834e";

    fn generator() -> ScriptGenerator {
        ScriptGenerator::new(
            Arc::new(SpecRegistry::builtin().unwrap()),
            SandboxLayout::default(),
        )
    }

    #[test]
    fn test_environment_script_fetches_requirements_at_env_commit() {
        let script = generator()
            .environment_script("django/django", "4.0", ENV_COMMIT)
            .unwrap();
        assert!(script.contains("conda create -n testbed python=3.8 -y"));
        assert!(script.contains(&format!(
            "https://raw.githubusercontent.com/django/django/{ENV_COMMIT}/tests/requirements/py3.txt"
        )));
        assert!(script.contains("python -m pip install -r /root/requirements.txt"));
    }

    #[test]
    fn test_environment_script_installs_packages() {
        let script = generator()
            .environment_script("pvlib/pvlib-python", "0.9", ENV_COMMIT)
            .unwrap();
        assert!(script.contains("conda create -n testbed python=3.9 pandas scipy -y"));
        assert!(script.contains("python -m pip install jupyter ipython matplotlib pytest flake8"));
        assert!(!script.contains("requirements.txt"));
    }

    #[test]
    fn test_dockerfile_labels_environment_commit() {
        let dockerfile = generator()
            .environment_dockerfile("pvlib/pvlib-python", "0.9", ENV_COMMIT, "ubuntu:22.04")
            .unwrap();
        assert!(dockerfile.starts_with("FROM ubuntu:22.04\n"));
        assert!(dockerfile.contains(&format!("swebench.environment_commit=\"{ENV_COMMIT}\"")));
        assert!(dockerfile.contains("COPY ./setup_env.sh /root/"));
        assert!(dockerfile.contains("-b -p /opt/miniconda3"));
    }

    #[test]
    fn test_environment_artifacts_reject_bad_commit() {
        let g = generator();
        assert!(g
            .environment_script("pvlib/pvlib-python", "0.9", "$(id)")
            .is_err());
        assert!(g
            .environment_dockerfile("pvlib/pvlib-python", "0.9", "$(id)", "ubuntu:22.04")
            .is_err());
    }
}

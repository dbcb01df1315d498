//! End-to-end evaluation of candidate patches.
//!
//! For each instance: provision the sandbox, start it, run the setup script,
//! apply the candidate patch, capture the resulting diff, run the eval script
//! and score its output. Batches run under a worker ceiling.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::HarnessConfig;
use crate::dataset::BenchmarkInstance;
use crate::error::SandboxError;
use crate::execution::ContainerRuntime;
use crate::images::ImageMappingStore;
use crate::sandbox::{load_descriptor, Sandbox, SandboxProvisioner};
use crate::scoring::{self, LogFormat, Score, Verdict, APPLY_PATCH_FAIL};
use crate::scripts::ScriptGenerator;

/// A candidate patch for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub instance_id: String,
    #[serde(default)]
    pub model_patch: String,
    #[serde(default)]
    pub model_name_or_path: Option<String>,
}

/// Load predictions from a `.json` array or a `.jsonl` file, keyed by
/// instance id. Later entries for the same id win.
pub fn load_predictions(path: &Path) -> Result<BTreeMap<String, Prediction>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read predictions from {}", path.display()))?;

    let predictions: Vec<Prediction> = if path.extension().and_then(|e| e.to_str()) == Some("jsonl")
    {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("{} line {}", path.display(), idx + 1))
            })
            .collect::<Result<_>>()?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse predictions in {}", path.display()))?
    };

    Ok(predictions
        .into_iter()
        .map(|p| (p.instance_id.clone(), p))
        .collect())
}

/// Outcome of evaluating one instance.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    pub instance_id: String,
    pub resolved: bool,
    /// `None` when the pipeline errored before a score existed.
    pub verdict: Option<Verdict>,
    pub score: Option<Score>,
    pub error: Option<String>,
    pub duration_secs: f64,
}

/// Aggregate over a batch.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationSummary {
    pub total: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub infrastructure_failures: usize,
    pub errors: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<EvaluationResult>,
}

impl EvaluationSummary {
    pub fn from_results(results: Vec<EvaluationResult>, started_at: DateTime<Utc>) -> Self {
        let count = |pred: fn(&EvaluationResult) -> bool| results.iter().filter(|r| pred(r)).count();
        Self {
            total: results.len(),
            resolved: count(|r| r.resolved),
            unresolved: count(|r| r.verdict == Some(Verdict::Unresolved)),
            infrastructure_failures: count(|r| r.verdict.is_some_and(|v| v.is_infrastructure())),
            errors: count(|r| r.verdict.is_none()),
            started_at,
            finished_at: Utc::now(),
            results,
        }
    }

    pub fn resolve_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.resolved as f64 / self.total as f64
        }
    }
}

/// Drives instances through provisioned sandboxes.
pub struct Evaluator {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<ImageMappingStore>,
    provisioner: SandboxProvisioner,
    generator: ScriptGenerator,
    config: HarnessConfig,
}

impl Evaluator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<ImageMappingStore>,
        generator: ScriptGenerator,
        config: HarnessConfig,
    ) -> Self {
        let provisioner = SandboxProvisioner::new(
            runtime.clone(),
            config.descriptor_dir.clone(),
            config.repo_dir.clone(),
        );
        Self {
            runtime,
            store,
            provisioner,
            generator,
            config,
        }
    }

    /// Evaluate `agent_patch` against `instance`. Never fails: pipeline
    /// errors are reported in the result.
    pub async fn evaluate(&self, instance: &BenchmarkInstance, agent_patch: &str) -> EvaluationResult {
        let start = Instant::now();
        tracing::info!(instance_id = %instance.instance_id, "Evaluating instance");

        let outcome = self.run(instance, agent_patch).await;
        let duration_secs = start.elapsed().as_secs_f64();

        match outcome {
            Ok(score) => {
                tracing::info!(
                    instance_id = %instance.instance_id,
                    verdict = %score.verdict,
                    value = score.value,
                    "Instance scored"
                );
                EvaluationResult {
                    instance_id: instance.instance_id.clone(),
                    resolved: score.is_resolved(),
                    verdict: Some(score.verdict),
                    score: Some(score),
                    error: None,
                    duration_secs,
                }
            }
            Err(e) => {
                tracing::error!(instance_id = %instance.instance_id, error = %e, "Evaluation failed");
                EvaluationResult {
                    instance_id: instance.instance_id.clone(),
                    resolved: false,
                    verdict: None,
                    score: None,
                    error: Some(format!("{e:#}")),
                    duration_secs,
                }
            }
        }
    }

    /// Evaluate every `(instance, patch)` pair with at most `eval_workers`
    /// running at once. Results keep the input order.
    pub async fn evaluate_all(&self, jobs: &[(BenchmarkInstance, String)]) -> EvaluationSummary {
        let started_at = Utc::now();
        let semaphore = Arc::new(Semaphore::new(self.config.eval_workers.max(1)));
        let futures = jobs.iter().map(|(instance, patch)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await;
                self.evaluate(instance, patch).await
            }
        });
        let results = futures::future::join_all(futures).await;
        let summary = EvaluationSummary::from_results(results, started_at);

        tracing::info!(
            total = summary.total,
            resolved = summary.resolved,
            unresolved = summary.unresolved,
            infrastructure_failures = summary.infrastructure_failures,
            errors = summary.errors,
            "Evaluation finished"
        );
        summary
    }

    async fn run(&self, instance: &BenchmarkInstance, agent_patch: &str) -> Result<Score> {
        // Everything that can be rejected without a sandbox is checked first.
        let log_format = self.generator.specs().log_format(&instance.repo)?;
        let setup = self
            .generator
            .setup_script(&instance.repo, &instance.version, &instance.base_commit)?;
        let eval = self.generator.eval_script(
            &instance.test_patch,
            &instance.repo,
            &instance.version,
            &instance.base_commit,
        )?;
        let capture = self.generator.capture_patch_script(&instance.base_commit)?;

        let path = self
            .provisioner
            .provision_instance(&self.store, instance)
            .await?;
        let descriptor = load_descriptor(&path)?;
        let sandbox = Sandbox::start(
            self.runtime.clone(),
            &descriptor,
            &container_name(&instance.instance_id),
        )
        .await
        .context("Failed to start sandbox")?;

        let scripts = InstanceScripts {
            setup,
            eval,
            capture,
            log_format,
        };
        let result = self.run_in_sandbox(&sandbox, instance, agent_patch, &scripts).await;

        if self.config.keep_sandboxes {
            tracing::info!(instance_id = %instance.instance_id, container = %sandbox.id(), "Keeping sandbox");
        } else if let Err(e) = sandbox.destroy().await {
            tracing::warn!(instance_id = %instance.instance_id, error = %e, "Failed to remove sandbox");
        }
        result
    }

    async fn run_in_sandbox(
        &self,
        sandbox: &Sandbox,
        instance: &BenchmarkInstance,
        agent_patch: &str,
        scripts: &InstanceScripts,
    ) -> Result<Score> {
        let setup_timeout = self.config.setup_timeout();

        let setup = match sandbox.execute(&scripts.setup, setup_timeout).await {
            Ok(out) => out,
            Err(SandboxError::Timeout { seconds }) => return Ok(Score::timeout(seconds, "", "")),
            Err(e) => return Err(e).context("Setup script failed to run"),
        };
        if !setup.success() {
            anyhow::bail!(
                "Setup script exited with {}: {}",
                setup.exit_code,
                truncate(&setup.stderr, 2000)
            );
        }

        if !agent_patch.trim().is_empty() {
            let script = self.generator.apply_patch_script(agent_patch);
            let applied = sandbox
                .execute(&script, setup_timeout)
                .await
                .context("Failed to apply candidate patch")?;
            if applied.stdout.contains(APPLY_PATCH_FAIL) {
                tracing::warn!(instance_id = %instance.instance_id, "Candidate patch did not apply");
                return Ok(Score::infrastructure_failure(&applied.stdout, agent_patch));
            }
        }

        let model_patch = sandbox
            .execute(&scripts.capture, setup_timeout)
            .await
            .context("Failed to capture agent patch")?
            .stdout;

        match sandbox.execute(&scripts.eval, self.config.eval_timeout()).await {
            Ok(out) => Ok(scoring::score(
                &out.stdout,
                instance,
                scripts.log_format,
                &model_patch,
            )),
            Err(SandboxError::Timeout { seconds }) => Ok(Score::timeout(seconds, "", &model_patch)),
            Err(e) => Err(e).context("Eval script failed to run"),
        }
    }
}

struct InstanceScripts {
    setup: String,
    eval: String,
    capture: String,
    log_format: LogFormat,
}

fn container_name(instance_id: &str) -> String {
    let safe: String = instance_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '-' })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("sweb-eval-{}-{}", safe, &suffix[..8])
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}... [truncated]", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::fake::FakeRuntime;
    use crate::execution::ExecResult;
    use crate::scripts::SandboxLayout;
    use crate::specs::SpecRegistry;

    const IMAGE: &str = "sweb.env.pvlib__pvlib-python.0.9.0123456789abcdef:latest";

    fn instance() -> BenchmarkInstance {
        BenchmarkInstance {
            instance_id: "pvlib__pvlib-python-1854".to_string(),
            repo: "pvlib/pvlib-python".to_string(),
            version: "0.9".to_string(),
            base_commit: "27a3a07ebc84b11014d3753e4923902adf9a38c0".to_string(),
            environment_setup_commit: "6072e0982c3c0236f532ddfa48fbf461180d834e".to_string(),
            test_patch: "diff --git a/pvlib/tests/test_x.py b/pvlib/tests/test_x.py\n".to_string(),
            patch: String::new(),
            pass_to_pass: vec!["pvlib/tests/test_x.py::test_a".to_string()],
            fail_to_pass: vec!["pvlib/tests/test_x.py::test_b".to_string()],
            problem_statement: String::new(),
        }
    }

    async fn evaluator(runtime: FakeRuntime, dir: &Path) -> (Evaluator, Arc<FakeRuntime>) {
        let store = Arc::new(ImageMappingStore::open(dir.join("map.json")).unwrap());
        let inst = instance();
        store
            .record(&inst.instance_id, &inst.environment_setup_commit, IMAGE)
            .await
            .unwrap();
        let runtime = Arc::new(runtime.with_image(IMAGE));
        let config = HarnessConfig {
            descriptor_dir: dir.join("compose"),
            ..Default::default()
        };
        let generator = ScriptGenerator::new(
            Arc::new(SpecRegistry::builtin().unwrap()),
            SandboxLayout::default(),
        );
        (
            Evaluator::new(runtime.clone(), store, generator, config),
            runtime,
        )
    }

    fn respond(script: &str, test_output: &'static str) -> ExecResult {
        let stdout = if script.contains("git diff --cached") {
            "diff --git a/pvlib/x.py b/pvlib/x.py\n".to_string()
        } else if script.contains("set -uox pipefail") {
            test_output.to_string()
        } else {
            String::new()
        };
        ExecResult {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        }
    }

    #[tokio::test]
    async fn test_resolved_instance() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeRuntime::new().with_handler(|s| {
            respond(
                s,
                "PASSED pvlib/tests/test_x.py::test_a\nPASSED pvlib/tests/test_x.py::test_b\n",
            )
        });
        let (evaluator, runtime) = evaluator(fake, dir.path()).await;

        let result = evaluator.evaluate(&instance(), "diff --git a/pvlib/x.py b/pvlib/x.py\n").await;
        assert!(result.resolved, "{:?}", result.error);
        let score = result.score.unwrap();
        assert_eq!(score.metadata.model_patch, "diff --git a/pvlib/x.py b/pvlib/x.py\n");

        let scripts = runtime.scripts.lock().unwrap().clone();
        assert_eq!(scripts.len(), 4);
        assert!(scripts[0].contains("set -euxo pipefail"));
        assert!(scripts[1].contains("git apply -v"));
        assert!(scripts[2].contains("git diff --cached"));
        assert!(scripts[3].contains("set -uox pipefail"));
        assert!(runtime.containers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_patch_skips_apply_step() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeRuntime::new().with_handler(|s| {
            respond(
                s,
                "PASSED pvlib/tests/test_x.py::test_a\nFAILED pvlib/tests/test_x.py::test_b - x\n",
            )
        });
        let (evaluator, runtime) = evaluator(fake, dir.path()).await;

        let result = evaluator.evaluate(&instance(), "").await;
        assert!(!result.resolved);
        assert_eq!(result.verdict, Some(Verdict::Unresolved));
        assert_eq!(runtime.scripts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_patch_that_does_not_apply() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeRuntime::new().with_handler(|s| ExecResult {
            exit_code: 0,
            stdout: if s.contains("agent_patch.diff") {
                format!("error: corrupt patch\n{APPLY_PATCH_FAIL}\n")
            } else {
                String::new()
            },
            stderr: String::new(),
        });
        let (evaluator, _) = evaluator(fake, dir.path()).await;

        let result = evaluator.evaluate(&instance(), "garbage").await;
        assert_eq!(result.verdict, Some(Verdict::InfrastructureFailure));
    }

    #[tokio::test]
    async fn test_setup_timeout_scores_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeRuntime::new();
        fake.exec_delay = Some(std::time::Duration::from_secs(5));
        let (mut evaluator, _) = evaluator(fake, dir.path()).await;
        evaluator.config.setup_timeout_secs = 1;

        let result = evaluator.evaluate(&instance(), "").await;
        let score = result.score.unwrap();
        assert_eq!(score.value, 0.0);
        assert!(score.explanation.contains(scoring::TESTS_TIMEOUT));
    }

    #[tokio::test]
    async fn test_unmapped_instance_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (evaluator, _) = evaluator(FakeRuntime::new(), dir.path()).await;
        let mut other = instance();
        other.instance_id = "pvlib__pvlib-python-9999".to_string();

        let result = evaluator.evaluate(&other, "").await;
        assert!(result.verdict.is_none());
        assert!(result.error.unwrap().contains("build-images"));
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeRuntime::new().with_handler(|s| {
            respond(
                s,
                "PASSED pvlib/tests/test_x.py::test_a\nPASSED pvlib/tests/test_x.py::test_b\n",
            )
        });
        let (evaluator, _) = evaluator(fake, dir.path()).await;
        let mut unknown = instance();
        unknown.instance_id = "missing-1".to_string();

        let summary = evaluator
            .evaluate_all(&[(instance(), String::new()), (unknown, String::new())])
            .await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.results[1].instance_id, "missing-1");
        assert!((summary.resolve_rate() - 0.5).abs() < f64::EPSILON);
        assert!(summary.finished_at >= summary.started_at);
    }

    #[test]
    fn test_load_predictions_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preds.jsonl");
        std::fs::write(
            &path,
            "{\"instance_id\": \"a\", \"model_patch\": \"p1\", \"model_name_or_path\": \"m\"}\n\n{\"instance_id\": \"b\", \"model_patch\": \"p2\"}\n",
        )
        .unwrap();
        let preds = load_predictions(&path).unwrap();
        assert_eq!(preds.len(), 2);
        assert_eq!(preds["a"].model_patch, "p1");
        assert_eq!(preds["b"].model_name_or_path, None);
    }

    #[test]
    fn test_container_name_is_docker_safe() {
        let name = container_name("django/django 1");
        assert!(name.starts_with("sweb-eval-django-django-1-"));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
    }
}

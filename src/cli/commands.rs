//! CLI command definitions for swe-bench-harness.
//!
//! The harness has two phases. `build-images` runs once per split and fills
//! the image mapping; `evaluate` then scores candidate patches inside
//! sandboxes started from those images. `provision`, `scripts` and `score`
//! expose the individual steps for debugging.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::dataset::{self, BenchmarkInstance, DEFAULT_DATASET, DEFAULT_SPLIT};
use crate::evaluation::{load_predictions, EvaluationSummary, Evaluator};
use crate::execution::{ContainerRuntime, DockerClient};
use crate::images::{BuildOptions, ImageBuilder, ImageMappingStore};
use crate::sandbox::SandboxProvisioner;
use crate::scoring;
use crate::scripts::ScriptGenerator;
use crate::specs::SpecRegistry;

/// Evaluation harness for SWE-bench style repository tasks.
#[derive(Parser)]
#[command(name = "swe-bench-harness")]
#[command(about = "Build sandbox images and score patches against SWE-bench instances")]
#[command(version)]
#[command(
    long_about = "swe-bench-harness builds per-instance environment images, provisions sandboxes from them and scores candidate patches by running the instance's tests.\n\nExample usage:\n  swe-bench-harness build-images --dataset princeton-nlp/SWE-bench_Lite --split dev\n  swe-bench-harness evaluate --predictions preds.jsonl --output report.json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file.
    #[arg(short, long, env = "SWE_HARNESS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Image mapping file (overrides the configuration).
    #[arg(long, env = "SWE_HARNESS_MAPPING", global = true)]
    pub mapping_path: Option<PathBuf>,

    /// Sandbox descriptor directory (overrides the configuration).
    #[arg(long, env = "SWE_HARNESS_DESCRIPTOR_DIR", global = true)]
    pub descriptor_dir: Option<PathBuf>,

    /// YAML file extending the built-in repository specifications.
    #[arg(long, global = true)]
    pub specs: Option<PathBuf>,

    /// Output JSON to stdout instead of human readable text.
    #[arg(short = 'j', long, global = true)]
    pub json: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Build environment images for a split and record the image mapping.
    #[command(name = "build-images")]
    BuildImages(BuildImagesArgs),

    /// Write (or reuse) the sandbox descriptor for one instance.
    Provision(ProvisionArgs),

    /// Print a generated script for one instance.
    Scripts(ScriptsArgs),

    /// Score candidate patches (or the gold patches) in sandboxes.
    #[command(alias = "eval")]
    Evaluate(EvaluateArgs),

    /// Score captured eval-script output without running anything.
    Score(ScoreArgs),
}

/// Dataset selection shared by every subcommand.
#[derive(Parser, Debug, Clone)]
pub struct DatasetArgs {
    /// HuggingFace dataset name, or a local .json / .jsonl export.
    #[arg(short, long, env = "SWE_HARNESS_DATASET", default_value = DEFAULT_DATASET)]
    pub dataset: String,

    /// Dataset split.
    #[arg(short, long, default_value = DEFAULT_SPLIT)]
    pub split: String,
}

/// Arguments for `swe-bench-harness build-images`.
#[derive(Parser, Debug)]
pub struct BuildImagesArgs {
    #[command(flatten)]
    pub dataset: DatasetArgs,

    /// Comma-separated instance ids to build (default: the whole split).
    #[arg(long, value_delimiter = ',')]
    pub instance_ids: Vec<String>,

    /// Maximum concurrent builds (overrides the configuration).
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Base image for environment images (overrides the configuration).
    #[arg(long)]
    pub base_image: Option<String>,

    /// Rebuild images that already exist.
    #[arg(long)]
    pub force_rebuild: bool,
}

/// Arguments for `swe-bench-harness provision`.
#[derive(Parser, Debug)]
pub struct ProvisionArgs {
    #[command(flatten)]
    pub dataset: DatasetArgs,

    /// Instance to provision.
    #[arg(short, long)]
    pub instance_id: String,
}

/// Which script `swe-bench-harness scripts` prints.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// Sandbox setup: checkout, conda activation, install.
    Setup,
    /// Test patch application and test run.
    Eval,
    /// Environment image provisioning script.
    Env,
    /// Environment image Dockerfile.
    Dockerfile,
}

/// Arguments for `swe-bench-harness scripts`.
#[derive(Parser, Debug)]
pub struct ScriptsArgs {
    /// Script to print.
    #[arg(value_enum)]
    pub kind: ScriptKind,

    #[command(flatten)]
    pub dataset: DatasetArgs,

    /// Instance to generate the script for.
    #[arg(short, long)]
    pub instance_id: String,

    /// Base image for the Dockerfile (overrides the configuration).
    #[arg(long)]
    pub base_image: Option<String>,
}

/// Arguments for `swe-bench-harness evaluate`.
#[derive(Parser, Debug)]
pub struct EvaluateArgs {
    #[command(flatten)]
    pub dataset: DatasetArgs,

    /// Predictions file (.json array or .jsonl) with instance_id and model_patch.
    #[arg(short, long, required_unless_present = "gold", conflicts_with = "gold")]
    pub predictions: Option<PathBuf>,

    /// Evaluate each instance's reference patch instead of predictions.
    #[arg(long)]
    pub gold: bool,

    /// Comma-separated instance ids to evaluate (default: all available).
    #[arg(long, value_delimiter = ',')]
    pub instance_ids: Vec<String>,

    /// Write the JSON report to this file.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Maximum concurrent evaluations (overrides the configuration).
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Leave sandboxes running after evaluation.
    #[arg(long)]
    pub keep_sandboxes: bool,
}

/// Arguments for `swe-bench-harness score`.
#[derive(Parser, Debug)]
pub struct ScoreArgs {
    #[command(flatten)]
    pub dataset: DatasetArgs,

    /// Instance the output belongs to.
    #[arg(short, long)]
    pub instance_id: String,

    /// File holding the captured eval-script stdout.
    #[arg(long)]
    pub stdout_file: PathBuf,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = resolve_config(&cli)?;
    let json = cli.json;
    match cli.command {
        Commands::BuildImages(args) => run_build_images_command(args, config, json).await,
        Commands::Provision(args) => run_provision_command(args, config, json).await,
        Commands::Scripts(args) => run_scripts_command(args, config).await,
        Commands::Evaluate(args) => run_evaluate_command(args, config, json).await,
        Commands::Score(args) => run_score_command(args, config, json).await,
    }
}

/// Configuration file first, then global flags on top.
fn resolve_config(cli: &Cli) -> anyhow::Result<HarnessConfig> {
    let mut config = HarnessConfig::load(cli.config.as_deref())?;
    if let Some(path) = &cli.mapping_path {
        config.mapping_path = path.clone();
    }
    if let Some(dir) = &cli.descriptor_dir {
        config.descriptor_dir = dir.clone();
    }
    if let Some(path) = &cli.specs {
        config.specs_path = Some(path.clone());
    }
    config.validate()?;
    Ok(config)
}

fn script_generator(config: &HarnessConfig) -> anyhow::Result<ScriptGenerator> {
    let specs = SpecRegistry::load(config.specs_path.as_deref())
        .context("Failed to load repository specifications")?;
    Ok(ScriptGenerator::new(Arc::new(specs), config.layout()))
}

async fn docker_runtime() -> anyhow::Result<Arc<dyn ContainerRuntime>> {
    let client = DockerClient::new()?;
    client.ping().await?;
    Ok(Arc::new(client))
}

async fn load_instances(
    args: &DatasetArgs,
    instance_ids: &[String],
) -> anyhow::Result<Vec<BenchmarkInstance>> {
    let source = dataset::open_source(&args.dataset, &args.split)?;
    info!("Loading {} split '{}'", source.name(), args.split);
    let instances = source.load().await?;

    if instance_ids.is_empty() {
        return Ok(instances);
    }
    let wanted: BTreeSet<&str> = instance_ids.iter().map(String::as_str).collect();
    let selected: Vec<BenchmarkInstance> = instances
        .into_iter()
        .filter(|i| wanted.contains(i.instance_id.as_str()))
        .collect();
    if selected.len() < wanted.len() {
        let found: BTreeSet<&str> = selected.iter().map(|i| i.instance_id.as_str()).collect();
        for id in wanted.difference(&found) {
            warn!(instance_id = %id, "Instance not found in dataset");
        }
    }
    Ok(selected)
}

async fn load_instance(args: &DatasetArgs, instance_id: &str) -> anyhow::Result<BenchmarkInstance> {
    let source = dataset::open_source(&args.dataset, &args.split)?;
    let instances = source.load().await?;
    Ok(dataset::find_instance(&instances, instance_id)?.clone())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// build-images
// ============================================================================

async fn run_build_images_command(
    args: BuildImagesArgs,
    mut config: HarnessConfig,
    json: bool,
) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config.build_workers = workers;
    }
    if let Some(base_image) = args.base_image {
        config.base_image = base_image;
    }
    config.validate()?;

    let instances = load_instances(&args.dataset, &args.instance_ids).await?;
    if instances.is_empty() {
        anyhow::bail!("No instances selected from {}", args.dataset.dataset);
    }

    let store = Arc::new(ImageMappingStore::open(&config.mapping_path)?);
    let builder = ImageBuilder::new(
        docker_runtime().await?,
        script_generator(&config)?,
        store,
        config.base_image.clone(),
    );
    let options = BuildOptions {
        max_workers: config.build_workers,
        force_rebuild: args.force_rebuild,
    };
    let report = builder.build(&instances, &options).await?;

    if json {
        print_json(&report)?;
    } else {
        println!("\n=== Environment Images ===");
        println!("Instances:      {}", instances.len());
        println!("Built:          {}", report.built.len());
        println!("Already present:{}", report.skipped.len());
        println!("Failed:         {}", report.failed.len());
        println!("Recorded:       {}", report.recorded);
        println!("Mapping file:   {}", config.mapping_path.display());
        for failure in &report.failed {
            println!("  {}: {}", failure.instance_id, failure.reason);
        }
    }
    Ok(())
}

// ============================================================================
// provision
// ============================================================================

#[derive(Debug, Serialize)]
struct ProvisionOutput {
    instance_id: String,
    descriptor: PathBuf,
}

async fn run_provision_command(
    args: ProvisionArgs,
    config: HarnessConfig,
    json: bool,
) -> anyhow::Result<()> {
    let instance = load_instance(&args.dataset, &args.instance_id).await?;
    let store = ImageMappingStore::open_existing(&config.mapping_path)?;
    let provisioner = SandboxProvisioner::new(
        docker_runtime().await?,
        config.descriptor_dir.clone(),
        config.repo_dir.clone(),
    );
    let descriptor = provisioner.provision_instance(&store, &instance).await?;

    if json {
        print_json(&ProvisionOutput {
            instance_id: instance.instance_id,
            descriptor,
        })?;
    } else {
        println!("{}", descriptor.display());
    }
    Ok(())
}

// ============================================================================
// scripts
// ============================================================================

async fn run_scripts_command(args: ScriptsArgs, config: HarnessConfig) -> anyhow::Result<()> {
    let instance = load_instance(&args.dataset, &args.instance_id).await?;
    let generator = script_generator(&config)?;
    let base_image = args.base_image.unwrap_or(config.base_image);
    print!("{}", render_script(&generator, &instance, args.kind, &base_image)?);
    Ok(())
}

fn render_script(
    generator: &ScriptGenerator,
    instance: &BenchmarkInstance,
    kind: ScriptKind,
    base_image: &str,
) -> anyhow::Result<String> {
    let script = match kind {
        ScriptKind::Setup => {
            generator.setup_script(&instance.repo, &instance.version, &instance.base_commit)?
        }
        ScriptKind::Eval => generator.eval_script(
            &instance.test_patch,
            &instance.repo,
            &instance.version,
            &instance.base_commit,
        )?,
        ScriptKind::Env => generator.environment_script(
            &instance.repo,
            &instance.version,
            &instance.environment_setup_commit,
        )?,
        ScriptKind::Dockerfile => generator.environment_dockerfile(
            &instance.repo,
            &instance.version,
            &instance.environment_setup_commit,
            base_image,
        )?,
    };
    Ok(script)
}

// ============================================================================
// evaluate
// ============================================================================

async fn run_evaluate_command(
    args: EvaluateArgs,
    mut config: HarnessConfig,
    json: bool,
) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config.eval_workers = workers;
    }
    config.keep_sandboxes |= args.keep_sandboxes;
    config.validate()?;

    let instances = load_instances(&args.dataset, &args.instance_ids).await?;
    let jobs = match &args.predictions {
        Some(path) => pair_predictions(instances, path)?,
        None => instances
            .into_iter()
            .map(|i| {
                let patch = i.patch.clone();
                (i, patch)
            })
            .collect(),
    };
    if jobs.is_empty() {
        anyhow::bail!("Nothing to evaluate: no instance has a patch to score");
    }

    let store = Arc::new(ImageMappingStore::open_existing(&config.mapping_path)?);
    let evaluator = Evaluator::new(
        docker_runtime().await?,
        store,
        script_generator(&config)?,
        config,
    );

    info!("Evaluating {} instances", jobs.len());
    let summary = evaluator.evaluate_all(&jobs).await;

    if let Some(output) = &args.output {
        write_report(output, &summary)?;
    }
    if json {
        print_json(&summary)?;
    } else {
        print_summary(&summary);
    }
    Ok(())
}

/// Pair each instance with its prediction; instances without one are skipped.
fn pair_predictions(
    instances: Vec<BenchmarkInstance>,
    path: &Path,
) -> anyhow::Result<Vec<(BenchmarkInstance, String)>> {
    let mut predictions = load_predictions(path)?;
    let jobs: Vec<(BenchmarkInstance, String)> = instances
        .into_iter()
        .filter_map(|instance| {
            let prediction = predictions.remove(&instance.instance_id)?;
            Some((instance, prediction.model_patch))
        })
        .collect();
    for id in predictions.keys() {
        warn!(instance_id = %id, "Prediction has no matching instance, ignoring");
    }
    Ok(jobs)
}

fn write_report(path: &Path, summary: &EvaluationSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(summary)?)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    info!("Report written to {}", path.display());
    Ok(())
}

fn print_summary(summary: &EvaluationSummary) {
    println!("\n=== Evaluation Results ===");
    println!("Total:          {}", summary.total);
    println!("Resolved:       {}", summary.resolved);
    println!("Unresolved:     {}", summary.unresolved);
    println!("Infra failures: {}", summary.infrastructure_failures);
    println!("Errors:         {}", summary.errors);
    println!("Resolve rate:   {:.1}%", summary.resolve_rate() * 100.0);
    println!();

    for r in &summary.results {
        let verdict = r
            .verdict
            .map(|v| v.to_string())
            .unwrap_or_else(|| "error".to_string());
        println!("  {} [{}] {:.1}s", r.instance_id, verdict, r.duration_secs);
        if let Some(err) = &r.error {
            println!("    error: {err}");
        }
    }
}

// ============================================================================
// score
// ============================================================================

async fn run_score_command(args: ScoreArgs, config: HarnessConfig, json: bool) -> anyhow::Result<()> {
    let instance = load_instance(&args.dataset, &args.instance_id).await?;
    let stdout = std::fs::read_to_string(&args.stdout_file)
        .with_context(|| format!("Failed to read {}", args.stdout_file.display()))?;
    let specs = SpecRegistry::load(config.specs_path.as_deref())?;
    let format = specs.log_format(&instance.repo)?;

    let score = scoring::score(&stdout, &instance, format, "");
    if json {
        print_json(&score)?;
    } else {
        println!("{} [{}] score={}", instance.instance_id, score.verdict, score.value);
        println!("{}", score.explanation);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_evaluate_requires_predictions_or_gold() {
        assert!(Cli::try_parse_from(["swe-bench-harness", "evaluate"]).is_err());
        assert!(Cli::try_parse_from([
            "swe-bench-harness",
            "evaluate",
            "--gold",
            "--predictions",
            "p.jsonl"
        ])
        .is_err());

        let cli = Cli::try_parse_from([
            "swe-bench-harness",
            "evaluate",
            "--predictions",
            "p.jsonl",
            "--instance-ids",
            "a,b",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Evaluate(args) => {
                assert_eq!(args.instance_ids, vec!["a", "b"]);
                assert_eq!(args.dataset.dataset, DEFAULT_DATASET);
                assert_eq!(args.dataset.split, DEFAULT_SPLIT);
            }
            _ => panic!("expected evaluate"),
        }
    }

    #[test]
    fn test_scripts_kind_parses() {
        let cli = Cli::try_parse_from([
            "swe-bench-harness",
            "scripts",
            "dockerfile",
            "--instance-id",
            "x",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Scripts(ScriptsArgs {
                kind: ScriptKind::Dockerfile,
                ..
            })
        ));
    }

    #[test]
    fn test_global_flags_override_config() {
        let cli = Cli::try_parse_from([
            "swe-bench-harness",
            "score",
            "-i",
            "x",
            "--stdout-file",
            "out.txt",
            "--mapping-path",
            "/tmp/map.json",
        ])
        .unwrap();
        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.mapping_path, PathBuf::from("/tmp/map.json"));
        assert_eq!(config.descriptor_dir, HarnessConfig::default().descriptor_dir);
    }

    #[test]
    fn test_render_script_uses_instance_fields() {
        let instance: BenchmarkInstance = serde_json::from_value(serde_json::json!({
            "instance_id": "pvlib__pvlib-python-1854",
            "repo": "pvlib/pvlib-python",
            "version": "0.9",
            "base_commit": "27a3a07ebc84b11014d3753e4923902adf9a38c0",
            "environment_setup_commit": "6072e0982c3c0236f532ddfa48fbf461180d834e",
            "test_patch": "",
        }))
        .unwrap();
        let generator = script_generator(&HarnessConfig::default()).unwrap();

        let setup = render_script(&generator, &instance, ScriptKind::Setup, "ubuntu:22.04").unwrap();
        assert!(setup.contains("27a3a07ebc84b11014d3753e4923902adf9a38c0"));
        let dockerfile =
            render_script(&generator, &instance, ScriptKind::Dockerfile, "ubuntu:22.04").unwrap();
        assert!(dockerfile.starts_with("FROM ubuntu:22.04"));
    }

    #[test]
    fn test_pair_predictions_skips_unpredicted_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preds.json");
        std::fs::write(
            &path,
            r#"[{"instance_id": "a", "model_patch": "pa"}, {"instance_id": "zzz", "model_patch": "pz"}]"#,
        )
        .unwrap();
        let instance = |id: &str| BenchmarkInstance {
            instance_id: id.to_string(),
            repo: "pvlib/pvlib-python".to_string(),
            version: "0.9".to_string(),
            base_commit: "abc".to_string(),
            environment_setup_commit: "def".to_string(),
            test_patch: String::new(),
            patch: String::new(),
            pass_to_pass: vec![],
            fail_to_pass: vec![],
            problem_statement: String::new(),
        };

        let jobs = pair_predictions(vec![instance("a"), instance("b")], &path).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0.instance_id, "a");
        assert_eq!(jobs[0].1, "pa");
    }
}

//! swe-bench-harness: evaluation harness for SWE-bench style tasks.
//!
//! Resolves a benchmark instance to a prebuilt environment image, provisions
//! a sandbox from it, generates the scripts that run inside it, and turns the
//! raw test-runner output into a verdict and a score.

pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod execution;
pub mod images;
pub mod sandbox;
pub mod scoring;
pub mod scripts;
pub mod specs;

// Re-export commonly used types
pub use config::HarnessConfig;
pub use error::{
    BuildError, ConfigError, DatasetError, DockerError, MappingError, SandboxError, ScriptError,
    SpecError,
};
pub use evaluation::{EvaluationResult, EvaluationSummary, Evaluator, Prediction};
pub use scoring::{score, Score, Verdict};

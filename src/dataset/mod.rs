//! Benchmark instances and the loaders that produce them.
//!
//! A split is an ordered sequence of [`BenchmarkInstance`]s. Records can come
//! from a local `.json` / `.jsonl` export or straight from the HuggingFace
//! datasets-server rows API; both are exposed through [`DatasetSource`].

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DatasetError;

pub mod loader;

pub use loader::{open_source, HuggingFaceDataset, LocalDataset};

/// Default dataset name on HuggingFace.
pub const DEFAULT_DATASET: &str = "princeton-nlp/SWE-bench_Lite";

/// Default split to evaluate.
pub const DEFAULT_SPLIT: &str = "dev";

/// One benchmark task: a real repository issue with a known reference fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkInstance {
    /// Stable identifier, e.g. `pvlib__pvlib-python-1854`.
    pub instance_id: String,
    /// GitHub repository in `owner/repo` form.
    pub repo: String,
    /// Version tag keying the repository specification.
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
    /// Commit the task starts from.
    pub base_commit: String,
    /// Commit whose dependency state determines the environment image.
    pub environment_setup_commit: String,
    /// Hidden test patch applied before running the suite.
    pub test_patch: String,
    /// Reference solution patch.
    #[serde(default)]
    pub patch: String,
    /// Tests expected to pass both before and after a correct fix.
    #[serde(rename = "PASS_TO_PASS", deserialize_with = "test_id_list", default)]
    pub pass_to_pass: Vec<String>,
    /// Tests expected to fail before and pass after a correct fix.
    #[serde(rename = "FAIL_TO_PASS", deserialize_with = "test_id_list", default)]
    pub fail_to_pass: Vec<String>,
    /// Issue text handed to the agent.
    #[serde(default)]
    pub problem_statement: String,
}

/// A source of benchmark splits.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Human readable name used in logs.
    fn name(&self) -> String;

    /// Load every instance of the split, in dataset order.
    async fn load(&self) -> Result<Vec<BenchmarkInstance>, DatasetError>;
}

/// Find a single instance by id.
pub fn find_instance<'a>(
    instances: &'a [BenchmarkInstance],
    instance_id: &str,
) -> Result<&'a BenchmarkInstance, DatasetError> {
    instances
        .iter()
        .find(|i| i.instance_id == instance_id)
        .ok_or_else(|| DatasetError::InstanceNotFound(instance_id.to_string()))
}

/// Accept `"3.0"` as well as a bare JSON number like `3.0`.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number for version, got {other}"
        ))),
    }
}

/// Test id lists are JSON arrays in exports but JSON-encoded strings in the
/// HuggingFace rows API (`"[\"t1\", \"t2\"]"`). Accept both.
fn test_id_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|v| match v {
                serde_json::Value::String(s) => Ok(s),
                other => Err(serde::de::Error::custom(format!(
                    "expected test id string, got {other}"
                ))),
            })
            .collect(),
        serde_json::Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(Vec::new());
            }
            serde_json::from_str::<Vec<String>>(trimmed).map_err(serde::de::Error::custom)
        }
        other => Err(serde::de::Error::custom(format!(
            "expected test id list, got {other}"
        ))),
    }
}

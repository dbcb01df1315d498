//! Dataset loaders: local JSON/JSONL exports and the HuggingFace rows API.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{BenchmarkInstance, DatasetSource};
use crate::error::DatasetError;

/// Base URL for HuggingFace datasets server rows API.
const HUGGINGFACE_ROWS_API: &str = "https://datasets-server.huggingface.co/rows";

/// The rows API caps a page at 100 records.
const MAX_PAGE_SIZE: usize = 100;

/// Delay between page requests in milliseconds.
const RATE_LIMIT_DELAY_MS: u64 = 100;

/// Pick a loader for `source`: an existing path is read locally, anything
/// else is treated as a HuggingFace dataset identifier.
pub fn open_source(source: &str, split: &str) -> Result<Box<dyn DatasetSource>, DatasetError> {
    let path = Path::new(source);
    if path.exists() {
        Ok(Box::new(LocalDataset::new(path)))
    } else {
        Ok(Box::new(HuggingFaceDataset::new(source, split)?))
    }
}

/// A split exported to disk, either a JSON array or one record per line.
#[derive(Debug, Clone)]
pub struct LocalDataset {
    path: PathBuf,
}

impl LocalDataset {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn parse(&self, content: &str) -> Result<Vec<BenchmarkInstance>, DatasetError> {
        let ext = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        match ext {
            "json" => Ok(serde_json::from_str(content)?),
            "jsonl" => content
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(idx, line)| {
                    serde_json::from_str(line).map_err(|e| {
                        DatasetError::Parse(format!(
                            "{} line {}: {}",
                            self.path.display(),
                            idx + 1,
                            e
                        ))
                    })
                })
                .collect(),
            _ => Err(DatasetError::UnsupportedFormat(
                self.path.display().to_string(),
            )),
        }
    }
}

#[async_trait]
impl DatasetSource for LocalDataset {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self) -> Result<Vec<BenchmarkInstance>, DatasetError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let instances = self.parse(&content)?;
        tracing::info!(path = %self.path.display(), count = instances.len(), "Loaded local dataset");
        Ok(instances)
    }
}

/// A split fetched page by page from the HuggingFace datasets server.
pub struct HuggingFaceDataset {
    http_client: Client,
    dataset_name: String,
    split: String,
}

#[derive(Debug, Deserialize)]
struct RowsResponse {
    rows: Vec<RowEntry>,
    #[serde(default)]
    num_rows_total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RowEntry {
    row: serde_json::Value,
}

impl HuggingFaceDataset {
    pub fn new(
        dataset_name: impl Into<String>,
        split: impl Into<String>,
    ) -> Result<Self, DatasetError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| DatasetError::Http(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http_client,
            dataset_name: dataset_name.into(),
            split: split.into(),
        })
    }

    fn page_url(&self, offset: usize) -> String {
        format!(
            "{}?dataset={}&config=default&split={}&offset={}&length={}",
            HUGGINGFACE_ROWS_API,
            urlencoding::encode(&self.dataset_name),
            urlencoding::encode(&self.split),
            offset,
            MAX_PAGE_SIZE
        )
    }

    async fn fetch_page(&self, offset: usize) -> Result<RowsResponse, DatasetError> {
        let response = self
            .http_client
            .get(self.page_url(offset))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| DatasetError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(DatasetError::Http(format!(
                "API returned status {}: {}",
                status, error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| DatasetError::Parse(format!("Failed to parse response: {e}")))
    }
}

#[async_trait]
impl DatasetSource for HuggingFaceDataset {
    fn name(&self) -> String {
        format!("{}:{}", self.dataset_name, self.split)
    }

    async fn load(&self) -> Result<Vec<BenchmarkInstance>, DatasetError> {
        let mut instances = Vec::new();
        let mut offset = 0usize;

        loop {
            let page = self.fetch_page(offset).await?;
            let fetched = page.rows.len();
            for entry in page.rows {
                let instance: BenchmarkInstance = serde_json::from_value(entry.row)
                    .map_err(|e| DatasetError::Parse(format!("row {}: {}", offset, e)))?;
                instances.push(instance);
            }
            offset += fetched;

            let done = match page.num_rows_total {
                Some(total) => offset >= total,
                None => fetched < MAX_PAGE_SIZE,
            };
            if done || fetched == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(RATE_LIMIT_DELAY_MS)).await;
        }

        tracing::info!(
            dataset = %self.dataset_name,
            split = %self.split,
            count = instances.len(),
            "Fetched dataset from HuggingFace"
        );
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json(id: &str) -> String {
        serde_json::json!({
            "instance_id": id,
            "repo": "pvlib/pvlib-python",
            "version": "0.9",
            "base_commit": "27a3a07ebc84b11014d3753e4923902adf9a38c0",
            "environment_setup_commit": "6072e0982c3c0236f532ddfa48fbf461180d834e",
            "test_patch": "",
            "PASS_TO_PASS": "[]",
            "FAIL_TO_PASS": "[\"pvlib/tests/test_x.py::test_y\"]",
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_load_jsonl_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("split.jsonl");
        let content = format!("{}\n\n{}\n", sample_json("b-2"), sample_json("a-1"));
        std::fs::write(&path, content).unwrap();

        let instances = LocalDataset::new(&path).load().await.unwrap();
        let ids: Vec<_> = instances.iter().map(|i| i.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["b-2", "a-1"]);
        assert_eq!(instances[0].fail_to_pass.len(), 1);
    }

    #[tokio::test]
    async fn test_load_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("split.json");
        std::fs::write(&path, format!("[{}]", sample_json("x-1"))).unwrap();

        let instances = LocalDataset::new(&path).load().await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].version, "0.9");
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("split.csv");
        std::fs::write(&path, "a,b").unwrap();

        let result = LocalDataset::new(&path).load().await;
        assert!(matches!(result, Err(DatasetError::UnsupportedFormat(_))));
    }

    #[tokio::test]
    async fn test_jsonl_error_names_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("split.jsonl");
        std::fs::write(&path, format!("{}\n{{broken\n", sample_json("a"))).unwrap();

        match LocalDataset::new(&path).load().await {
            Err(DatasetError::Parse(msg)) => assert!(msg.contains("line 2")),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_page_url_encodes_dataset_name() {
        let ds = HuggingFaceDataset::new("princeton-nlp/SWE-bench_Lite", "dev").unwrap();
        let url = ds.page_url(200);
        assert!(url.contains("dataset=princeton-nlp%2FSWE-bench_Lite"));
        assert!(url.contains("offset=200"));
        assert!(url.contains("split=dev"));
    }

    #[test]
    fn test_open_source_picks_local_for_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("split.json");
        std::fs::write(&path, "[]").unwrap();
        let source = open_source(path.to_str().unwrap(), "dev").unwrap();
        assert_eq!(source.name(), path.display().to_string());
    }
}

//! Outcome classification and scoring.
//!
//! Scoring runs in three phases with no way back:
//! 1. scan the raw output for infrastructure failure signatures,
//! 2. parse it with the repository's [`LogFormat`],
//! 3. partition the parsed verdicts into the instance's `PASS_TO_PASS` and
//!    `FAIL_TO_PASS` sets and reduce to a binary score.
//!
//! Every path produces a [`Score`] with an explanation; nothing here fails.

use serde::{Serialize, Serializer};

use crate::dataset::BenchmarkInstance;

pub mod parsers;

pub use parsers::{LogFormat, LogParser, TestOutcome, TestStatus};

/// Echoed by the eval script when the test patch does not apply.
pub const APPLY_PATCH_FAIL: &str = ">>>>> Patch Apply Failed";
/// Echoed by the eval script when reverting test files fails.
pub const RESET_FAILED: &str = ">>>>> Reset Failed";
/// Emitted when the test runner itself errored.
pub const TESTS_ERROR: &str = ">>>>> Tests Errored";
/// Emitted when the test run exceeded its time budget.
pub const TESTS_TIMEOUT: &str = ">>>>> Tests Timed Out";
/// Emitted by the sandbox when the task environment could not be reset.
pub const TASK_ENV_RESET_FAILED: &str = "Failed to reset task environment";

/// Signatures that mark a run as an infrastructure failure, in report order.
pub const INFRA_SIGNATURES: [&str; 5] = [
    APPLY_PATCH_FAIL,
    RESET_FAILED,
    TESTS_ERROR,
    TESTS_TIMEOUT,
    TASK_ENV_RESET_FAILED,
];

/// Final classification of one evaluated instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Resolved,
    Unresolved,
    InfrastructureFailure,
    MalformedOutput,
}

impl Verdict {
    /// Whether the run never got far enough to judge the patch.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::InfrastructureFailure | Self::MalformedOutput)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolved => write!(f, "resolved"),
            Self::Unresolved => write!(f, "unresolved"),
            Self::InfrastructureFailure => write!(f, "infrastructure_failure"),
            Self::MalformedOutput => write!(f, "malformed_output"),
        }
    }
}

/// Whether one signature was found in the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureMatch {
    pub signature: &'static str,
    pub matched: bool,
}

/// Observed result of one expected test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestVerdict {
    Observed(TestStatus),
    /// The test never appeared in the parsed output.
    Missing,
}

impl TestVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Observed(TestStatus::Passed))
    }
}

impl std::fmt::Display for TestVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Observed(status) => write!(f, "{status}"),
            Self::Missing => write!(f, "missing"),
        }
    }
}

impl Serialize for TestVerdict {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// An expected test and what happened to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestEntry {
    pub test: String,
    pub status: TestVerdict,
}

/// Structured detail behind a score.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScoreBreakdown {
    pub signatures: Vec<SignatureMatch>,
    /// Failing entries first, otherwise in dataset order.
    pub pass_to_pass: Vec<TestEntry>,
    /// Failing entries first, otherwise in dataset order.
    pub fail_to_pass: Vec<TestEntry>,
    pub parsed_tests: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScoreMetadata {
    /// The agent's changes as a diff against the base commit.
    pub model_patch: String,
}

/// Scored result of one evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct Score {
    /// Either `0.0` or `1.0`.
    pub value: f64,
    pub verdict: Verdict,
    pub explanation: String,
    pub breakdown: ScoreBreakdown,
    pub metadata: ScoreMetadata,
}

impl Score {
    pub fn is_resolved(&self) -> bool {
        self.verdict == Verdict::Resolved
    }

    /// Infrastructure failure built from a signature scan of `stdout`.
    pub fn infrastructure_failure(stdout: &str, agent_patch: &str) -> Self {
        let signatures = scan_signatures(stdout);
        let mut explanation = String::from("Infrastructure failure detected:\n");
        for m in &signatures {
            explanation.push_str(&format!("{}: {}\n", m.signature, m.matched));
        }
        explanation.push_str("\nOutput:\n");
        explanation.push_str(stdout);

        Self {
            value: 0.0,
            verdict: Verdict::InfrastructureFailure,
            explanation,
            breakdown: ScoreBreakdown {
                signatures,
                ..Default::default()
            },
            metadata: ScoreMetadata {
                model_patch: agent_patch.to_string(),
            },
        }
    }

    /// Infrastructure failure for a run that exceeded its time budget.
    pub fn timeout(seconds: u64, partial_output: &str, agent_patch: &str) -> Self {
        let stdout = format!(
            "{partial_output}\n{TESTS_TIMEOUT}: execution exceeded {seconds} seconds\n"
        );
        Self::infrastructure_failure(&stdout, agent_patch)
    }

    fn malformed(stdout: &str, format: LogFormat, agent_patch: &str) -> Self {
        Self {
            value: 0.0,
            verdict: Verdict::MalformedOutput,
            explanation: format!(
                "No test results could be parsed from the output (log format: {:?}).\n\nOutput:\n{}",
                format, stdout
            ),
            breakdown: ScoreBreakdown {
                signatures: scan_signatures(stdout),
                ..Default::default()
            },
            metadata: ScoreMetadata {
                model_patch: agent_patch.to_string(),
            },
        }
    }
}

/// Check every infrastructure signature against `stdout`.
pub fn scan_signatures(stdout: &str) -> Vec<SignatureMatch> {
    INFRA_SIGNATURES
        .into_iter()
        .map(|signature| SignatureMatch {
            signature,
            matched: stdout.contains(signature),
        })
        .collect()
}

/// Score captured eval-script output for `instance`.
pub fn score(
    stdout: &str,
    instance: &BenchmarkInstance,
    format: LogFormat,
    agent_patch: &str,
) -> Score {
    let signatures = scan_signatures(stdout);
    if signatures.iter().any(|m| m.matched) {
        tracing::debug!(instance_id = %instance.instance_id, "Infrastructure signature found in output");
        return Score::infrastructure_failure(stdout, agent_patch);
    }

    let outcome = format.parse(stdout);
    if outcome.is_empty() {
        tracing::warn!(
            instance_id = %instance.instance_id,
            format = ?format,
            "Parser recognized no test results"
        );
        return Score::malformed(stdout, format, agent_patch);
    }

    let pass_to_pass = partition(&instance.pass_to_pass, &outcome);
    let fail_to_pass = partition(&instance.fail_to_pass, &outcome);
    let resolved = pass_to_pass
        .iter()
        .chain(fail_to_pass.iter())
        .all(|e| e.status.passed());

    let explanation = format!(
        "PASS_TO_PASS:\n\n{}\n\nFAIL_TO_PASS:\n\n{}\n\n",
        render_partition(&pass_to_pass),
        render_partition(&fail_to_pass)
    );

    Score {
        value: if resolved { 1.0 } else { 0.0 },
        verdict: if resolved {
            Verdict::Resolved
        } else {
            Verdict::Unresolved
        },
        explanation,
        breakdown: ScoreBreakdown {
            signatures,
            pass_to_pass,
            fail_to_pass,
            parsed_tests: outcome.len(),
        },
        metadata: ScoreMetadata {
            model_patch: agent_patch.to_string(),
        },
    }
}

fn partition(expected: &[String], outcome: &TestOutcome) -> Vec<TestEntry> {
    let mut entries: Vec<TestEntry> = expected
        .iter()
        .map(|test| TestEntry {
            test: test.clone(),
            status: outcome
                .get(test)
                .copied()
                .map(TestVerdict::Observed)
                .unwrap_or(TestVerdict::Missing),
        })
        .collect();
    // Stable: ties keep dataset order.
    entries.sort_by_key(|e| e.status.passed());
    entries
}

fn render_partition(entries: &[TestEntry]) -> String {
    let map: serde_json::Map<String, serde_json::Value> = entries
        .iter()
        .map(|e| (e.test.clone(), serde_json::Value::String(e.status.to_string())))
        .collect();
    format!("{:#}", serde_json::Value::Object(map))
}

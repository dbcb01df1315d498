//! Test-runner log parsers.
//!
//! Each supported runner output format is one [`LogFormat`] variant. The
//! repository specification registry maps a repository to its variant, so
//! adding a format means adding a variant here, never branching on
//! repository names.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Verdict for a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Error,
    Xfail,
}

impl TestStatus {
    const ALL: [TestStatus; 5] = [
        TestStatus::Failed,
        TestStatus::Passed,
        TestStatus::Skipped,
        TestStatus::Error,
        TestStatus::Xfail,
    ];

    /// Token used by pytest in its short summary.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Error => "ERROR",
            Self::Xfail => "XFAIL",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == token)
    }

    fn prefixes(line: &str) -> bool {
        Self::ALL.iter().any(|s| line.starts_with(s.as_str()))
    }

    fn suffixes(line: &str) -> bool {
        Self::ALL.iter().any(|s| line.ends_with(s.as_str()))
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed test results keyed by test identifier.
pub type TestOutcome = BTreeMap<String, TestStatus>;

/// Capability of turning raw runner output into per-test verdicts.
pub trait LogParser {
    fn parse(&self, log: &str) -> TestOutcome;
}

/// Supported test-runner output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// pytest `-rA` short summary: `PASSED path::test`.
    Pytest,
    /// pytest summary with parametrized ids whose options embed paths.
    PytestOptions,
    /// pytest summary or verbose lines, possibly colored.
    PytestV2,
    /// Django `runtests.py --verbosity 2`.
    Django,
    /// SymPy `bin/test --verbose`.
    Sympy,
    /// Seaborn's pytest output.
    Seaborn,
    /// Matplotlib's pytest output, with enum reprs normalized.
    Matplotlib,
}

impl LogParser for LogFormat {
    fn parse(&self, log: &str) -> TestOutcome {
        match self {
            Self::Pytest => parse_pytest(log),
            Self::PytestOptions => parse_pytest_options(log),
            Self::PytestV2 => parse_pytest_v2(log),
            Self::Django => parse_django(log),
            Self::Sympy => parse_sympy(log),
            Self::Seaborn => parse_seaborn(log),
            Self::Matplotlib => parse_matplotlib(log),
        }
    }
}

/// Split a summary line into `(status, test_id)`.
fn summary_entry(line: &str) -> Option<(TestStatus, String)> {
    let line = if line.starts_with(TestStatus::Failed.as_str()) {
        line.replace(" - ", " ")
    } else {
        line.to_string()
    };
    let mut parts = line.split_whitespace();
    let status = TestStatus::from_token(parts.next()?)?;
    let test = parts.next()?;
    Some((status, test.to_string()))
}

fn parse_pytest(log: &str) -> TestOutcome {
    log.lines()
        .filter(|line| TestStatus::prefixes(line))
        .filter_map(summary_entry)
        .map(|(status, test)| (test, status))
        .collect()
}

fn option_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*?)\[(.*)\]$").expect("option pattern is valid"))
}

fn parse_pytest_options(log: &str) -> TestOutcome {
    let mut outcome = TestOutcome::new();
    for line in log.lines().filter(|line| TestStatus::prefixes(line)) {
        let Some((status, test)) = summary_entry(line) else {
            continue;
        };
        let name = match option_pattern().captures(&test) {
            Some(caps) => {
                let main = &caps[1];
                let mut option = caps[2].to_string();
                // Absolute paths inside ids vary per machine; keep the file name.
                if option.starts_with('/') && !option.starts_with("//") && !option.contains('*')
                {
                    let last = option.rsplit('/').next().unwrap_or_default().to_string();
                    option = format!("/{last}");
                }
                format!("{main}[{option}]")
            }
            None => test,
        };
        outcome.insert(name, status);
    }
    outcome
}

fn ansi_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+)m").expect("ansi pattern is valid"))
}

fn parse_pytest_v2(log: &str) -> TestOutcome {
    let mut outcome = TestOutcome::new();
    for raw in log.lines() {
        let stripped = ansi_pattern().replace_all(raw, "");
        let line: String = stripped
            .chars()
            .filter(|c| !matches!(*c as u32, 1..=31))
            .collect();

        if TestStatus::prefixes(&line) {
            if let Some((status, test)) = summary_entry(&line) {
                outcome.insert(test, status);
            }
        } else if TestStatus::suffixes(&line) {
            let mut parts = line.split_whitespace();
            if let (Some(test), Some(token)) = (parts.next(), parts.next()) {
                if let Some(status) = TestStatus::from_token(token) {
                    outcome.insert(test.to_string(), status);
                }
            }
        }
    }
    outcome
}

fn parse_django(log: &str) -> TestOutcome {
    let mut outcome = TestOutcome::new();
    for line in log.lines().map(str::trim) {
        if line.ends_with(" ... ok") || line.ends_with(" ... OK") || line.ends_with(" ...  OK") {
            if let Some((test, _)) = line.split_once(" ... ") {
                outcome.insert(test.to_string(), TestStatus::Passed);
            }
        } else if let Some((test, _)) = line.split_once(" ... skipped") {
            outcome.insert(test.to_string(), TestStatus::Skipped);
        } else if let Some(test) = line.strip_suffix(" ... FAIL") {
            outcome.insert(test.to_string(), TestStatus::Failed);
        } else if let Some(test) = line.strip_suffix(" ... ERROR") {
            outcome.insert(test.to_string(), TestStatus::Error);
        } else if let Some(test) = line.strip_prefix("FAIL:") {
            outcome.insert(test.trim().to_string(), TestStatus::Failed);
        } else if let Some(test) = line.strip_prefix("ERROR:") {
            outcome.insert(test.trim().to_string(), TestStatus::Error);
        }
    }
    outcome
}

fn sympy_failure_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^_+ (.+)\.py:(\S+) _+$").expect("sympy header pattern is valid")
    })
}

fn parse_sympy(log: &str) -> TestOutcome {
    let mut outcome = TestOutcome::new();
    for caps in sympy_failure_header().captures_iter(log) {
        outcome.insert(format!("{}.py:{}", &caps[1], &caps[2]), TestStatus::Failed);
    }
    for line in log.lines().map(str::trim) {
        if !line.starts_with("test_") {
            continue;
        }
        let status = if line.ends_with(" E") {
            TestStatus::Error
        } else if line.ends_with(" F") {
            TestStatus::Failed
        } else if line.ends_with(" ok") {
            TestStatus::Passed
        } else {
            continue;
        };
        if let Some(test) = line.split_whitespace().next() {
            outcome.insert(test.to_string(), status);
        }
    }
    outcome
}

fn parse_seaborn(log: &str) -> TestOutcome {
    let mut outcome = TestOutcome::new();
    let passed = TestStatus::Passed.as_str();
    for line in log.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if line.starts_with(TestStatus::Failed.as_str()) {
            if let Some(test) = parts.get(1) {
                outcome.insert(test.to_string(), TestStatus::Failed);
            }
        } else if line.contains(&format!(" {passed} ")) {
            if parts.get(1) == Some(&passed) {
                outcome.insert(parts[0].to_string(), TestStatus::Passed);
            }
        } else if line.starts_with(passed) {
            if let Some(test) = parts.get(1) {
                outcome.insert(test.to_string(), TestStatus::Passed);
            }
        }
    }
    outcome
}

fn parse_matplotlib(log: &str) -> TestOutcome {
    let normalized = log
        .replace("MouseButton.LEFT", "1")
        .replace("MouseButton.RIGHT", "3");
    parse_pytest(&normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pytest_summary() {
        let log = "\
============ short test summary info ============
PASSED tests/test_a.py::test_one
FAILED tests/test_a.py::test_two - AssertionError: boom
SKIPPED [1] tests/test_a.py:10: unconditional skip
ERROR tests/test_b.py::test_three
XFAIL tests/test_a.py::test_four
PASSEDWITHOUTSPACE
some other line
";
        let outcome = LogFormat::Pytest.parse(log);
        assert_eq!(outcome["tests/test_a.py::test_one"], TestStatus::Passed);
        assert_eq!(outcome["tests/test_a.py::test_two"], TestStatus::Failed);
        assert_eq!(outcome["tests/test_b.py::test_three"], TestStatus::Error);
        assert_eq!(outcome["tests/test_a.py::test_four"], TestStatus::Xfail);
        assert_eq!(outcome["[1]"], TestStatus::Skipped);
        assert_eq!(outcome.len(), 5);
    }

    #[test]
    fn test_pytest_ignores_traced_commands() {
        let log = "+ git apply /tmp/test_patch.diff\n+ pytest -rA tests/test_a.py\n";
        assert!(LogFormat::Pytest.parse(log).is_empty());
    }

    #[test]
    fn test_pytest_options_normalizes_absolute_paths() {
        let log = "\
PASSED test_requests.py::test_path[/home/runner/data/file.txt]
PASSED test_requests.py::test_url[//example.com/a]
FAILED test_requests.py::test_plain - ValueError
";
        let outcome = LogFormat::PytestOptions.parse(log);
        assert_eq!(
            outcome["test_requests.py::test_path[/file.txt]"],
            TestStatus::Passed
        );
        assert_eq!(
            outcome["test_requests.py::test_url[//example.com/a]"],
            TestStatus::Passed
        );
        assert_eq!(outcome["test_requests.py::test_plain"], TestStatus::Failed);
    }

    #[test]
    fn test_pytest_v2_strips_colors_and_reads_verbose_lines() {
        let log = "\
\x1b[32mPASSED\x1b[0m tests/test_build.py::test_html
tests/test_build.py::test_text FAILED
tests/test_build.py::test_latex PASSED
";
        let outcome = LogFormat::PytestV2.parse(log);
        assert_eq!(outcome["tests/test_build.py::test_html"], TestStatus::Passed);
        assert_eq!(outcome["tests/test_build.py::test_text"], TestStatus::Failed);
        assert_eq!(outcome["tests/test_build.py::test_latex"], TestStatus::Passed);
    }

    #[test]
    fn test_django_verbose_output() {
        let log = "\
test_add (admin_views.tests.AdminViewTest) ... ok
test_change (admin_views.tests.AdminViewTest) ... FAIL
test_delete (admin_views.tests.AdminViewTest) ... ERROR
test_skip (admin_views.tests.AdminViewTest) ... skipped 'no db'
======================================================================
FAIL: test_other (admin_views.tests.OtherTest)
";
        let outcome = LogFormat::Django.parse(log);
        assert_eq!(
            outcome["test_add (admin_views.tests.AdminViewTest)"],
            TestStatus::Passed
        );
        assert_eq!(
            outcome["test_change (admin_views.tests.AdminViewTest)"],
            TestStatus::Failed
        );
        assert_eq!(
            outcome["test_delete (admin_views.tests.AdminViewTest)"],
            TestStatus::Error
        );
        assert_eq!(
            outcome["test_skip (admin_views.tests.AdminViewTest)"],
            TestStatus::Skipped
        );
        assert_eq!(
            outcome["test_other (admin_views.tests.OtherTest)"],
            TestStatus::Failed
        );
    }

    #[test]
    fn test_sympy_output() {
        let log = "\
sympy/core/tests/test_basic.py[3]
test_one ok
test_two F
test_three E
________________ sympy/core/tests/test_basic.py:test_two ________________
";
        let outcome = LogFormat::Sympy.parse(log);
        assert_eq!(outcome["test_one"], TestStatus::Passed);
        assert_eq!(outcome["test_two"], TestStatus::Failed);
        assert_eq!(outcome["test_three"], TestStatus::Error);
        assert_eq!(
            outcome["sympy/core/tests/test_basic.py:test_two"],
            TestStatus::Failed
        );
    }

    #[test]
    fn test_seaborn_output() {
        let log = "\
tests/test_core.py::test_a PASSED [ 10%]
PASSED tests/test_core.py::test_b
FAILED tests/test_core.py::test_c - KeyError
";
        let outcome = LogFormat::Seaborn.parse(log);
        assert_eq!(outcome["tests/test_core.py::test_a"], TestStatus::Passed);
        assert_eq!(outcome["tests/test_core.py::test_b"], TestStatus::Passed);
        assert_eq!(outcome["tests/test_core.py::test_c"], TestStatus::Failed);
    }

    #[test]
    fn test_matplotlib_normalizes_mouse_buttons() {
        let log = "PASSED lib/matplotlib/tests/test_widgets.py::test_span[MouseButton.LEFT]\n";
        let outcome = LogFormat::Matplotlib.parse(log);
        assert_eq!(
            outcome["lib/matplotlib/tests/test_widgets.py::test_span[1]"],
            TestStatus::Passed
        );
    }

    #[test]
    fn test_log_format_deserializes_snake_case() {
        let format: LogFormat = serde_yaml::from_str("pytest_options").unwrap();
        assert_eq!(format, LogFormat::PytestOptions);
    }
}

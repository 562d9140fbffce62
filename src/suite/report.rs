use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

/// Final state of a top-level test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Skip,
}

impl TestStatus {
    /// Failure takes precedence over skip.
    pub fn from_flags(failed: bool, skipped: bool) -> Self {
        if failed {
            Self::Fail
        } else if skipped {
            Self::Skip
        } else {
            Self::Pass
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

/// One top-level test in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub name: String,
    pub status: TestStatus,
    pub duration_ms: u64,
}

/// Summary statistics in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub success: bool,
}

/// Serializable outcome of a suite run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub duration_ms: u64,
    pub tests: Vec<TestReport>,
    pub summary: SummaryReport,
}

impl SuiteReport {
    pub fn new(tests: Vec<TestReport>, duration: Duration) -> Self {
        let count = |status| tests.iter().filter(|t| t.status == status).count();
        let summary = SummaryReport {
            total: tests.len(),
            passed: count(TestStatus::Pass),
            failed: count(TestStatus::Fail),
            skipped: count(TestStatus::Skip),
            success: tests.iter().all(|t| t.status != TestStatus::Fail),
        };
        Self {
            duration_ms: duration.as_millis() as u64,
            tests,
            summary,
        }
    }

    pub fn success(&self) -> bool {
        self.summary.success
    }

    /// Serialize as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, HarnessError> {
        serde_json::to_string_pretty(self).map_err(|e| HarnessError::Report(e.to_string()))
    }

    /// Write the JSON report to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn write_json(&self, path: &Path) -> Result<(), HarnessError> {
        let json = self.to_json()?;
        std::fs::write(path, json + "\n")
            .map_err(|e| HarnessError::Report(format!("{}: {e}", path.display())))
    }
}

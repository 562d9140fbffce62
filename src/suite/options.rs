use std::path::{Path, PathBuf};
use std::thread;

use serde::Deserialize;

use crate::error::HarnessError;
use crate::suite::matcher::Matcher;

/// Configuration for a suite run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Report passing and skipped tests and print `=== RUN` lines.
    pub verbose: bool,
    /// Maximum number of tests running at once.
    pub parallel: usize,
    /// Slash-separated per-level regular expressions selecting tests.
    pub pattern: Option<String>,
    /// Root of the per-test output directories; also receives `test.tap`
    /// and `report.json`.
    pub output_dir: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            verbose: false,
            parallel: thread::available_parallelism().map_or(1, |n| n.get()),
            pattern: None,
            output_dir: None,
        }
    }
}

impl Options {
    /// Load options from a YAML file. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self, HarnessError> {
        let text = std::fs::read_to_string(path).map_err(|source| HarnessError::ConfigRead {
            path: path.to_owned(),
            source,
        })?;
        Self::from_yaml_str(&text).map_err(|source| HarnessError::ConfigParse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Check the options and compile the test pattern.
    ///
    /// # Errors
    ///
    /// Returns an error if `parallel` is zero or the pattern does not compile.
    pub fn validate(&self) -> Result<Matcher, HarnessError> {
        if self.parallel == 0 {
            return Err(HarnessError::InvalidOptions(
                "parallel must be at least 1".to_owned(),
            ));
        }
        Matcher::new(self.pattern.as_deref().unwrap_or(""))
    }
}

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the suite layer and by unit resource helpers.
///
/// Inside a running unit these never reach the test body: resource errors
/// are logged into the unit and turned into an abrupt failure instead.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Failed to create output dir {path}: {source}")]
    OutputDir { path: PathBuf, source: io::Error },

    #[error("Failed to create temp dir: {0}")]
    TempDir(#[source] io::Error),

    #[error("Failed to create temp file: {0}")]
    TempFile(#[source] io::Error),

    #[error("Failed to create TAP file {path}: {source}")]
    Tap { path: PathBuf, source: io::Error },

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("invalid pattern element {element:?}: {source}")]
    Pattern {
        element: String,
        source: regex::Error,
    },

    #[error("failed to read config {path}: {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("failed to write report: {0}")]
    Report(String),

    #[error("harness: test suite failed")]
    SuiteFailed,
}

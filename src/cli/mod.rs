//! Command-line flags for programs that embed a [`Suite`](crate::Suite).
//!
//! Flatten [`HarnessArgs`] into your own `clap` parser and turn it into
//! [`Options`] with [`HarnessArgs::into_options`].

use std::path::PathBuf;

use clap::Args;

use crate::error::HarnessError;
use crate::suite::Options;

#[derive(Debug, Clone, Default, Args)]
pub struct HarnessArgs {
    /// Report every test, not only failures
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Maximum number of tests to run at once
    #[arg(long, value_name = "N")]
    pub parallel: Option<usize>,

    /// Run only tests matching this slash-separated regex list
    #[arg(long = "run", value_name = "PATTERN")]
    pub pattern: Option<String>,

    /// Directory for per-test output, test.tap and report.json
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// YAML file with default options; flags override it
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl HarnessArgs {
    /// Resolve the final options: defaults, then the config file, then flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be loaded.
    pub fn into_options(self) -> Result<Options, HarnessError> {
        let mut options = match &self.config {
            Some(path) => Options::from_yaml_file(path)?,
            None => Options::default(),
        };
        if self.verbose {
            options.verbose = true;
        }
        if let Some(parallel) = self.parallel {
            options.parallel = parallel;
        }
        if self.pattern.is_some() {
            options.pattern = self.pattern;
        }
        if self.output_dir.is_some() {
            options.output_dir = self.output_dir;
        }
        Ok(options)
    }
}

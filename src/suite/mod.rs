//! The selection and reporting layer that drives the engine: options, test
//! name matching, the concurrency gate, TAP and JSON output.

pub mod matcher;
pub mod options;
pub mod report;

use std::fs::{self, File};
use std::io;
use std::panic;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::{debug, info};

use crate::error::HarnessError;
use crate::runner::lifecycle::{Body, run_tree};
use crate::runner::output::write_sink;
use crate::runner::unit::Unit;
use crate::runner::{CountingGate, Environment, H, ParallelGate, Sink};

pub use matcher::Matcher;
pub use options::Options;
pub use report::{SuiteReport, SummaryReport, TestReport, TestStatus};

/// A top-level test body.
pub type TestFn = Arc<dyn Fn(&H) + Send + Sync + 'static>;

/// An ordered collection of top-level tests and the options to run them
/// with.
pub struct Suite {
    options: Options,
    gate: Arc<dyn ParallelGate>,
    tests: Vec<(String, TestFn)>,
}

impl Suite {
    /// Create a suite whose concurrency gate admits `options.parallel` tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn new(options: Options) -> Result<Self, HarnessError> {
        let gate = Arc::new(CountingGate::new(options.parallel));
        Self::with_gate(options, gate)
    }

    /// Create a suite that limits concurrency with `gate` instead of a gate
    /// sized from the options.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn with_gate(options: Options, gate: Arc<dyn ParallelGate>) -> Result<Self, HarnessError> {
        options.validate()?;
        Ok(Self {
            options,
            gate,
            tests: Vec::new(),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Register a top-level test. Tests run in registration order.
    pub fn add<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&H) + Send + Sync + 'static,
    {
        self.tests.push((name.into(), Arc::new(f)));
        self
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Run the suite, reporting to stdout.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::SuiteFailed`] if any test failed, or an error
    /// if the output directory or TAP file cannot be created.
    pub fn run(&self) -> Result<SuiteReport, HarnessError> {
        let out: Sink = Arc::new(Mutex::new(io::stdout()));
        let report = self.run_with(out, None)?;
        if report.success() {
            Ok(report)
        } else {
            Err(HarnessError::SuiteFailed)
        }
    }

    /// Run the suite, reporting to `out`. TAP goes to `tap` if given,
    /// otherwise to `test.tap` in the output directory if one is configured.
    ///
    /// Test failures are part of the returned report. A panic in a test body
    /// or a broken calling contract aborts the run by re-raising the panic
    /// here.
    ///
    /// # Errors
    ///
    /// Returns an error if the output directory, TAP file or JSON report
    /// cannot be written.
    pub fn run_with(&self, out: Sink, tap: Option<Sink>) -> Result<SuiteReport, HarnessError> {
        let start = Instant::now();
        let matcher = self.options.validate()?;
        let env = Arc::new(Environment::new(
            Box::new(matcher),
            Arc::clone(&self.gate),
            self.options.verbose,
            self.output_root(),
        ));

        let tap = match tap {
            Some(tap) => Some(tap),
            None => self.open_tap()?,
        };
        if let Some(tap) = &tap {
            write_sink(tap, format!("1..{}\n", self.tests.len()).as_bytes());
        }

        info!(tests = self.tests.len(), parallel = self.options.parallel, "running suite");
        let units: Arc<Mutex<Vec<Arc<Unit>>>> = Arc::default();
        let body = self.root_body(Arc::clone(&units));

        // The root holds a slot like any sequential test.
        self.gate.acquire();
        let outcome = run_tree(&env, Arc::clone(&out), tap, body);
        self.gate.release();

        if let Some(fault) = outcome.fault {
            panic::resume_unwind(fault);
        }

        if !outcome.ran {
            write_sink(&out, b"harness: warning: no tests to run\n");
        }
        write_sink(&out, if outcome.failed { b"FAIL\n" } else { b"PASS\n" });

        let tests = units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|unit| {
                let state = unit.read();
                TestReport {
                    name: unit.name.clone(),
                    status: TestStatus::from_flags(state.failed, state.skipped),
                    duration_ms: state.duration.as_millis() as u64,
                }
            })
            .collect();
        let report = SuiteReport::new(tests, start.elapsed());

        if let Some(dir) = &self.options.output_dir {
            report.write_json(&dir.join("report.json"))?;
        }
        info!(
            passed = report.summary.passed,
            failed = report.summary.failed,
            skipped = report.summary.skipped,
            "suite finished"
        );
        Ok(report)
    }

    fn root_body(&self, units: Arc<Mutex<Vec<Arc<Unit>>>>) -> Body {
        let tests = self.tests.clone();
        Box::new(move |h: &H| {
            for (name, f) in tests {
                if let Some(unit) = h.run_unit(&name, move |h: &H| f(h)) {
                    units
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(unit);
                }
            }
        })
    }

    fn output_root(&self) -> PathBuf {
        self.options.output_dir.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("harness-{}", std::process::id()))
        })
    }

    fn open_tap(&self) -> Result<Option<Sink>, HarnessError> {
        let Some(dir) = &self.options.output_dir else {
            return Ok(None);
        };
        fs::create_dir_all(dir).map_err(|source| HarnessError::OutputDir {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join("test.tap");
        let file = File::create(&path).map_err(|source| HarnessError::Tap {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "writing TAP log");
        Ok(Some(Arc::new(Mutex::new(file))))
    }
}

use std::fmt;
use std::fs::{self, File};
use std::panic::Location;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{
    Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    Weak,
};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::HarnessError;
use crate::runner::context::Context;
use crate::runner::env::{Environment, Sink, protocol_violation};
use crate::runner::latch::Latch;
use crate::runner::lifecycle::{Signal, abrupt_exit};

/// Log lines are indented 8 spaces to set them apart from subtest headers.
const LOG_INDENT: &str = "        ";

/// Handle passed to every test body to manage test state and write logs.
///
/// Logs accumulate while the test runs and are written out, indented under
/// the test's status line, when the test completes.
///
/// A test ends when its body returns or calls any of [`H::fail_now`],
/// [`H::fatal`], [`H::skip_now`] or [`H::skip`]. Those methods, as well as
/// [`H::run`] and [`H::parallel`], must be called only from the thread running
/// the body. The logging and [`H::fail`] family may be called from any thread
/// holding a clone of the handle.
#[derive(Clone)]
pub struct H {
    pub(crate) unit: Arc<Unit>,
}

/// One node of the test tree.
pub(crate) struct Unit {
    pub(crate) name: String,
    pub(crate) level: usize,
    /// Used for failure propagation and output flushing only. The parent
    /// outlives its running children because it waits for all of them.
    pub(crate) parent: Option<Weak<Unit>>,
    pub(crate) env: Arc<Environment>,
    /// The root's sink, shared by the whole tree: where the root's report
    /// and `=== RUN` lines go.
    pub(crate) sink: Sink,
    /// Set on the root only.
    pub(crate) tap: Option<Sink>,
    /// Opened by this unit's finalization to release its parallel subtests.
    pub(crate) barrier: Latch,
    pub(crate) ctx: Context,
    pub(crate) owner: OnceLock<ThreadId>,
    pub(crate) state: RwLock<State>,
    pub(crate) links: Mutex<Links>,
}

/// Flags, timing and buffered output guarded by the unit's lock.
#[derive(Debug)]
pub(crate) struct State {
    pub(crate) output: Vec<u8>,
    /// The test (or one of its subtests) was executed.
    pub(crate) ran: bool,
    pub(crate) failed: bool,
    pub(crate) skipped: bool,
    /// The body has completed.
    pub(crate) finished: bool,
    /// Finished and every parallel subtest has completed.
    pub(crate) done: bool,
    pub(crate) has_sub: bool,
    pub(crate) is_parallel: bool,
    pub(crate) start: Instant,
    pub(crate) duration: Duration,
}

/// Signal plumbing between a unit and the caller of `run`.
#[derive(Default)]
pub(crate) struct Links {
    /// Completion channel of each parallel subtest, in registration order.
    pub(crate) sub: Vec<Receiver<Signal>>,
    /// This unit's side of its completion channel.
    pub(crate) signal: Option<Sender<Signal>>,
}

impl State {
    fn new() -> Self {
        Self {
            output: Vec::new(),
            ran: false,
            failed: false,
            skipped: false,
            finished: false,
            done: false,
            has_sub: false,
            is_parallel: false,
            start: Instant::now(),
            duration: Duration::ZERO,
        }
    }
}

impl Unit {
    pub(crate) fn root(
        env: Arc<Environment>,
        sink: Sink,
        tap: Option<Sink>,
        ctx: Context,
        signal: Sender<Signal>,
    ) -> Self {
        Self {
            name: String::new(),
            level: 0,
            parent: None,
            env,
            sink,
            tap,
            barrier: Latch::new(),
            ctx,
            owner: OnceLock::new(),
            state: RwLock::new(State::new()),
            links: Mutex::new(Links {
                sub: Vec::new(),
                signal: Some(signal),
            }),
        }
    }

    pub(crate) fn child(parent: &Arc<Unit>, name: String, signal: Sender<Signal>) -> Self {
        Self {
            name,
            level: parent.level + 1,
            parent: Some(Arc::downgrade(parent)),
            env: Arc::clone(&parent.env),
            sink: Arc::clone(&parent.sink),
            tap: None,
            barrier: Latch::new(),
            ctx: parent.ctx.child(),
            owner: OnceLock::new(),
            state: RwLock::new(State::new()),
            links: Mutex::new(Links {
                sub: Vec::new(),
                signal: Some(signal),
            }),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn links(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn parent(&self) -> Option<Arc<Unit>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Panic unless called from the thread running this unit's body.
    pub(crate) fn check_owner(&self, op: &str) {
        let current = thread::current().id();
        if self.owner.get() != Some(&current) {
            protocol_violation(
                &self.env,
                format!(
                    "harness: {op} called on {:?} from a thread other than the one running it",
                    self.name
                ),
            );
        }
    }

    /// Mark this unit and all its ancestors failed.
    pub(crate) fn fail(&self) {
        if let Some(parent) = self.parent() {
            parent.fail();
        }
        let mut state = self.write();
        // `done` is checked under the lock to synchronize with the parent's
        // finalization.
        if state.done {
            drop(state);
            protocol_violation(
                &self.env,
                format!("Fail in thread after {} has completed", self.name),
            );
        }
        state.failed = true;
    }

    pub(crate) fn set_ran(&self) {
        if let Some(parent) = self.parent() {
            parent.set_ran();
        }
        self.write().ran = true;
    }

    fn log_at(&self, location: &Location<'_>, message: &str) {
        let path = location.file();
        let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
        let mut line = format!("{LOG_INDENT}{file}:{}: {message}", location.line());
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let mut state = self.write();
        if state.done {
            warn!(test = %self.name, "log after test completed is discarded");
        }
        state.output.extend_from_slice(line.as_bytes());
    }

    fn make_output_dir(&self) -> Result<PathBuf, HarnessError> {
        let path = self.env.output_path(&self.name);
        fs::create_dir_all(&path).map_err(|source| HarnessError::OutputDir {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

impl H {
    /// Full name of the running test, e.g. `Top/sub`.
    pub fn name(&self) -> &str {
        &self.unit.name
    }

    /// Whether the suite runs in verbose mode.
    pub fn verbose(&self) -> bool {
        self.unit.env.verbose()
    }

    /// Cancellation context for the current test. It is cancelled when the
    /// test finishes, so threads started by the body can watch it to know
    /// when to exit.
    pub fn context(&self) -> &Context {
        &self.unit.ctx
    }

    /// Mark the test as having failed but continue execution.
    ///
    /// # Panics
    ///
    /// Panics if the test has already completed: a thread that outlives its
    /// test and reports on it is a broken contract, not a test failure.
    pub fn fail(&self) {
        self.unit.fail();
    }

    pub fn failed(&self) -> bool {
        self.unit.read().failed
    }

    /// Mark the test as having failed and stop its execution. Execution
    /// continues at the next test. Values owned by the body are dropped
    /// before the test is reported.
    ///
    /// Does not stop other threads the test started.
    pub fn fail_now(&self) -> ! {
        self.unit.check_owner("fail_now");
        self.unit.fail();
        self.unit.write().finished = true;
        abrupt_exit()
    }

    /// Mark the test as skipped and stop its execution. A test that failed
    /// before being skipped is still reported as failed.
    pub fn skip_now(&self) -> ! {
        self.unit.check_owner("skip_now");
        {
            let mut state = self.unit.write();
            state.skipped = true;
            state.finished = true;
        }
        abrupt_exit()
    }

    pub fn skipped(&self) -> bool {
        self.unit.read().skipped
    }

    /// Record text in the test log. It is printed only if the test fails or
    /// the suite is verbose.
    #[track_caller]
    pub fn log(&self, message: impl fmt::Display) {
        self.unit.log_at(Location::caller(), &message.to_string());
    }

    /// Equivalent to `log` followed by `fail`.
    #[track_caller]
    pub fn error(&self, message: impl fmt::Display) {
        self.unit.log_at(Location::caller(), &message.to_string());
        self.fail();
    }

    /// Equivalent to `log` followed by `fail_now`.
    #[track_caller]
    pub fn fatal(&self, message: impl fmt::Display) -> ! {
        self.unit.log_at(Location::caller(), &message.to_string());
        self.fail_now()
    }

    /// Equivalent to `log` followed by `skip_now`.
    #[track_caller]
    pub fn skip(&self, message: impl fmt::Display) -> ! {
        self.unit.log_at(Location::caller(), &message.to_string());
        self.skip_now()
    }

    /// Directory for storing data used by the current test, created on first
    /// use. Only test frameworks should need this; tests should normally use
    /// [`H::temp_dir`] or [`H::temp_file`].
    ///
    /// Failing to create the directory fails the test immediately.
    #[track_caller]
    pub fn output_dir(&self) -> PathBuf {
        let location = Location::caller();
        self.output_dir_at(location)
    }

    /// Create a new directory under [`H::output_dir`]. It is left in place
    /// after the test.
    #[track_caller]
    pub fn temp_dir(&self, prefix: &str) -> PathBuf {
        let location = Location::caller();
        let dir = self.output_dir_at(location);
        match tempfile::Builder::new().prefix(prefix).tempdir_in(&dir) {
            Ok(tmp) => tmp.keep(),
            Err(e) => self.fatal_at(location, &HarnessError::TempDir(e)),
        }
    }

    /// Create a new file under [`H::output_dir`]. It is left in place after
    /// the test.
    #[track_caller]
    pub fn temp_file(&self, prefix: &str) -> (File, PathBuf) {
        let location = Location::caller();
        let dir = self.output_dir_at(location);
        let created = tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(&dir)
            .and_then(|tmp| tmp.keep().map_err(|e| e.error));
        match created {
            Ok(kept) => kept,
            Err(e) => self.fatal_at(location, &HarnessError::TempFile(e)),
        }
    }

    fn output_dir_at(&self, location: &Location<'_>) -> PathBuf {
        match self.unit.make_output_dir() {
            Ok(dir) => dir,
            Err(e) => self.fatal_at(location, &e),
        }
    }

    fn fatal_at(&self, location: &Location<'_>, err: &HarnessError) -> ! {
        self.unit.log_at(location, &err.to_string());
        self.fail_now()
    }
}

impl fmt::Debug for H {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H")
            .field("name", &self.unit.name)
            .field("level", &self.unit.level)
            .finish_non_exhaustive()
    }
}

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use tracing::{debug, trace};

use crate::runner::env::protocol_violation;
use crate::runner::lifecycle::{Signal, drive, propagate_fault};
use crate::runner::unit::{H, Unit};

impl H {
    /// Run `f` as a subtest of this test called `name` and report whether it
    /// succeeded. A name rejected by the suite's pattern counts as success.
    ///
    /// Blocks until the subtest has completed, or until it calls
    /// [`H::parallel`], in which case it continues once this test's body has
    /// returned.
    #[track_caller]
    pub fn run<F>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(&H) + Send + 'static,
    {
        self.run_unit(name, f).is_none_or(|child| !child.read().failed)
    }

    /// `run`, handing back the subtest's unit, or `None` when the name was
    /// filtered out.
    #[track_caller]
    pub(crate) fn run_unit<F>(&self, name: &str, f: F) -> Option<Arc<Unit>>
    where
        F: FnOnce(&H) + Send + 'static,
    {
        let parent = &self.unit;
        parent.check_owner("run");
        if parent.env.has_fault() {
            // The run is being torn down: start nothing new.
            debug!(test = %parent.name, subtest = name, "run faulted; subtest not started");
            propagate_fault();
        }
        parent.write().has_sub = true;

        let (full_name, matched) = parent.env.resolve(&parent.name, name);
        if !matched {
            trace!(test = %full_name, "filtered out");
            return None;
        }

        let (tx, rx) = mpsc::channel();
        let child = Arc::new(Unit::child(parent, full_name, tx));

        if parent.env.verbose() {
            // Straight to the root so there is no delay.
            parent.print_to_root(&format!("=== RUN   {}\n", child.name));
        }

        // The subtest inherits this test's gate slot; finalization keeps the
        // count right, so a run of sequential subtests is never preempted.
        let h = H {
            unit: Arc::clone(&child),
        };
        let spawned = thread::Builder::new()
            .name(child.name.clone())
            .spawn(move || drive(h, Box::new(f)));
        if let Err(e) = spawned {
            self.fatal(format!("failed to start {}: {e}", child.name));
        }

        match rx.recv() {
            Ok(Signal::Done) => {}
            Ok(Signal::Detached) => {
                debug!(test = %child.name, "registered parallel subtest");
                parent.links().sub.push(rx);
            }
            Ok(Signal::Fault) | Err(_) => propagate_fault(),
        }
        Some(child)
    }

    /// Signal that this test is to be run in parallel with (and only with)
    /// other parallel tests.
    ///
    /// Control returns to the caller of [`H::run`] immediately; this test
    /// resumes once its parent's body has returned and the suite's
    /// concurrency gate admits it.
    ///
    /// # Panics
    ///
    /// Panics when called twice, on the root, or from another thread.
    pub fn parallel(&self) {
        let unit = &self.unit;
        unit.check_owner("parallel");
        let Some(parent) = unit.parent() else {
            protocol_violation(&unit.env, "harness: parallel called on the root".to_owned());
        };

        {
            let mut state = unit.write();
            if state.is_parallel {
                drop(state);
                protocol_violation(
                    &unit.env,
                    "harness: parallel called multiple times".to_owned(),
                );
            }
            state.is_parallel = true;
            // Time spent waiting for sequential tests is not part of this
            // test's duration.
            let elapsed = state.start.elapsed();
            state.duration += elapsed;
        }

        if let Some(tx) = &unit.links().signal {
            // Release the calling test.
            let _ = tx.send(Signal::Detached);
        }
        trace!(test = %unit.name, "waiting for parent to finish");
        parent.barrier.wait();
        // The slot is held even on the way out: finalization gives it back.
        unit.env.gate().acquire();
        if unit.env.has_fault() {
            debug!(test = %unit.name, "run faulted; parallel test not resumed");
            propagate_fault();
        }
        debug!(test = %unit.name, "parallel test admitted");
        unit.write().start = Instant::now();
    }
}

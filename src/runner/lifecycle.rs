use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use tracing::{debug, error};

use crate::runner::context::Context;
use crate::runner::env::{Environment, Fault, Sink, describe};
use crate::runner::unit::{H, Unit};

/// Test body as stored by the engine.
pub(crate) type Body = Box<dyn FnOnce(&H) + Send + 'static>;

/// Messages a unit sends to whoever waits on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// The unit called `parallel`; the caller of `run` may proceed.
    Detached,
    /// The unit and all its parallel subtests have completed.
    Done,
    /// The unit, or something below it, faulted. The run must be torn down.
    Fault,
}

/// Unwind payload for `fail_now`/`skip_now`.
pub(crate) struct AbruptExit;

/// Unwind payload raised in a parent body when a subtest faulted.
pub(crate) struct FaultPropagation;

/// Leave the current test body. Drops run as for a panic, but the panic hook
/// is not invoked.
pub(crate) fn abrupt_exit() -> ! {
    panic::resume_unwind(Box::new(AbruptExit))
}

/// Unwind the current test body because the run has faulted.
pub(crate) fn propagate_fault() -> ! {
    panic::resume_unwind(Box::new(FaultPropagation))
}

/// Execute `body` as the unit behind `h` and finalize it, whatever way the
/// body ends. Runs on the unit's own thread.
pub(crate) fn drive(h: H, body: Body) {
    let unit = Arc::clone(&h.unit);
    let _ = unit.owner.set(thread::current().id());
    debug!(test = %unit.name, level = unit.level, "test started");

    unit.write().start = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&h)));
    if outcome.is_ok() {
        unit.write().finished = true;
    }
    drop(h);
    finalize(&unit, outcome);
}

fn finalize(unit: &Unit, outcome: thread::Result<()>) {
    let finished = {
        let mut state = unit.write();
        let elapsed = state.start.elapsed();
        state.duration += elapsed;
        state.finished
    };

    let fault: Option<Fault> = match outcome {
        Ok(()) => None,
        Err(payload) if payload.is::<AbruptExit>() => (!finished).then(|| {
            Box::new("test executed an abrupt exit without finishing".to_owned()) as Fault
        }),
        Err(payload) => Some(payload),
    };

    let mut faulted = false;
    if let Some(fault) = fault {
        if fault.is::<FaultPropagation>() {
            debug!(test = %unit.name, "test torn down with the run");
        } else {
            error!(test = %unit.name, cause = %describe(&fault), "test body faulted");
        }
        unit.env.record_fault(fault);
        unit.fail();
        faulted = true;
    }

    if join_parallel_subtests(unit) && !faulted {
        unit.fail();
        faulted = true;
    }

    // Report after all subtests have finished.
    unit.report();

    let has_sub = {
        let mut state = unit.write();
        state.done = true;
        state.has_sub
    };
    if unit.parent.is_some() && !has_sub {
        unit.set_ran();
    }
    unit.ctx.cancel();

    let signal = if faulted { Signal::Fault } else { Signal::Done };
    debug!(test = %unit.name, ?signal, "test completed");
    if let Some(tx) = unit.links().signal.take() {
        // The receiver only disappears when the waiting thread is itself
        // unwinding, in which case nobody is left to tell.
        let _ = tx.send(signal);
    }
}

/// Release this unit's parallel subtests and wait for all of them. Returns
/// whether any of them faulted.
fn join_parallel_subtests(unit: &Unit) -> bool {
    let subs = mem::take(&mut unit.links().sub);
    let is_parallel = unit.read().is_parallel;
    let gate = unit.env.gate();

    if subs.is_empty() {
        // Only a parallel test gave up its parent's slot and took its own.
        if is_parallel {
            gate.release();
        }
        return false;
    }

    // Give up this test's slot so the subtests can use it.
    gate.release();
    debug!(test = %unit.name, count = subs.len(), "releasing parallel subtests");
    unit.barrier.open();

    let mut any_fault = false;
    for rx in subs {
        if !matches!(rx.recv(), Ok(Signal::Done)) {
            any_fault = true;
        }
    }

    if !is_parallel {
        // A sequential test always holds a slot while active.
        gate.acquire();
    }
    any_fault
}

/// Outcome of running a whole tree from its root.
pub(crate) struct TreeOutcome {
    pub(crate) failed: bool,
    pub(crate) ran: bool,
    pub(crate) fault: Option<Fault>,
}

/// Run `body` as the root of a new tree on its own thread and wait for it.
///
/// The caller is expected to hold one gate slot on the root's behalf for the
/// duration of the call.
pub(crate) fn run_tree(
    env: &Arc<Environment>,
    sink: Sink,
    tap: Option<Sink>,
    body: Body,
) -> TreeOutcome {
    let (tx, rx) = mpsc::channel();
    let root = Arc::new(Unit::root(
        Arc::clone(env),
        sink,
        tap,
        Context::background(),
        tx,
    ));
    let h = H {
        unit: Arc::clone(&root),
    };

    let spawned = thread::Builder::new()
        .name("harness-root".to_owned())
        .spawn(move || drive(h, body));
    let signal = match spawned {
        Ok(_) => rx.recv().ok(),
        Err(e) => {
            error!(error = %e, "failed to start root test thread");
            env.record_fault(Box::new(format!("failed to start root test thread: {e}")));
            None
        }
    };

    let state = root.read();
    let mut fault = env.take_fault();
    if fault.is_none() && signal != Some(Signal::Done) {
        fault = Some(Box::new("root test ended without completing".to_owned()));
    }
    TreeOutcome {
        failed: state.failed,
        ran: state.ran,
        fault,
    }
}

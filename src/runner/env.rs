use std::any::Any;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use crate::runner::gate::ParallelGate;
use crate::runner::lifecycle::FaultPropagation;

/// A shared text destination (the root report stream or the TAP log).
pub type Sink = Arc<Mutex<dyn Write + Send>>;

/// Payload of a panic that escaped a test body.
pub(crate) type Fault = Box<dyn Any + Send + 'static>;

/// Decides the fully-qualified name of a subtest and whether it should run.
pub trait NameResolver: Send + Sync {
    /// `parent` is the parent's full name (empty for top-level tests).
    fn full_name(&self, parent: &str, name: &str) -> (String, bool);
}

/// Run-wide collaborator state every unit in a tree refers to.
pub struct Environment {
    resolver: Box<dyn NameResolver>,
    gate: Arc<dyn ParallelGate>,
    verbose: bool,
    output_root: PathBuf,
    fault: Mutex<Option<Fault>>,
}

impl Environment {
    pub fn new(
        resolver: Box<dyn NameResolver>,
        gate: Arc<dyn ParallelGate>,
        verbose: bool,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            resolver,
            gate,
            verbose,
            output_root: output_root.into(),
            fault: Mutex::new(None),
        }
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn gate(&self) -> &dyn ParallelGate {
        self.gate.as_ref()
    }

    pub fn resolve(&self, parent: &str, name: &str) -> (String, bool) {
        self.resolver.full_name(parent, name)
    }

    /// Directory reserved for the test called `full_name`.
    pub fn output_path(&self, full_name: &str) -> PathBuf {
        self.output_root.join(full_name)
    }

    /// Remember the first fault of the run. Propagation markers are not
    /// faults in their own right and are ignored.
    pub(crate) fn record_fault(&self, fault: Fault) {
        if fault.is::<FaultPropagation>() {
            return;
        }
        let mut slot = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(fault);
        }
    }

    pub(crate) fn take_fault(&self) -> Option<Fault> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn has_fault(&self) -> bool {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Abort the run for a broken calling contract.
///
/// The message is recorded as the run's fault before panicking so the run is
/// torn down even when the offending call came from a thread the engine does
/// not own.
pub(crate) fn protocol_violation(env: &Environment, message: String) -> ! {
    tracing::error!(%message, "harness protocol violation");
    env.record_fault(Box::new(message.clone()));
    panic!("{message}");
}

/// Best-effort text of a panic payload.
pub(crate) fn describe(fault: &Fault) -> String {
    if let Some(s) = fault.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = fault.downcast_ref::<String>() {
        s.clone()
    } else if fault.is::<FaultPropagation>() {
        "subtest faulted".to_owned()
    } else {
        "non-string panic payload".to_owned()
    }
}

use std::sync::{Condvar, Mutex, PoisonError};

use tracing::trace;

/// Global limiter on how many units may execute at once.
///
/// A sequential unit inherits its parent's slot; only parallel units, and
/// units re-entering after joining their parallel children, call `acquire`.
pub trait ParallelGate: Send + Sync {
    /// Block until a slot is available and take it.
    fn acquire(&self);

    /// Return a slot taken by `acquire`. Never blocks.
    fn release(&self);
}

/// Admits at most `max` holders at a time. Waiters are woken one per release.
#[derive(Debug)]
pub struct CountingGate {
    max: usize,
    running: Mutex<usize>,
    cond: Condvar,
}

impl CountingGate {
    /// `max` is clamped to at least one slot.
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            running: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Number of slots currently held.
    pub fn running(&self) -> usize {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ParallelGate for CountingGate {
    fn acquire(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let mut running = self
            .cond
            .wait_while(running, |running| *running >= self.max)
            .unwrap_or_else(PoisonError::into_inner);
        *running += 1;
        trace!(running = *running, max = self.max, "gate slot acquired");
    }

    fn release(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(*running > 0, "gate slot released more often than acquired");
        *running = running.saturating_sub(1);
        trace!(running = *running, max = self.max, "gate slot released");
        drop(running);
        self.cond.notify_one();
    }
}

/// A gate that never blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnboundedGate;

impl ParallelGate for UnboundedGate {
    fn acquire(&self) {}

    fn release(&self) {}
}

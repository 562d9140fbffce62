use std::sync::{Condvar, Mutex, PoisonError};

/// A one-shot gate. Starts closed to waiters; once opened it stays open and
/// every current and future `wait` returns immediately.
///
/// Opening twice is a usage error.
#[derive(Debug, Default)]
pub struct Latch {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release every waiter.
    ///
    /// # Panics
    ///
    /// Panics if the latch was already opened.
    pub fn open(&self) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(!*open, "harness: barrier opened more than once");
        *open = true;
        drop(open);
        self.cond.notify_all();
    }

    /// Block until the latch is opened.
    pub fn wait(&self) {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        let _open = self
            .cond
            .wait_while(open, |open| !*open)
            .unwrap_or_else(PoisonError::into_inner);
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

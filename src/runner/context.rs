use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Duration;

/// Cancellation handle carried by every unit.
///
/// A unit's context is cancelled when its body has completed (normally or
/// abruptly) and its parallel subtests have been joined. Threads started by
/// a test body can poll `is_cancelled` or block in `wait` to learn that the
/// test is over; the engine never joins them.
///
/// Cancelling a context cancels every context derived from it.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

#[derive(Debug, Default)]
struct ContextInner {
    state: Mutex<ContextState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct ContextState {
    cancelled: bool,
    children: Vec<Weak<ContextInner>>,
}

impl Context {
    /// A root context that is only cancelled explicitly.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(ContextInner::default()),
        }
    }

    /// Derive a context that is cancelled when `self` is. A child of an
    /// already-cancelled context starts cancelled.
    pub fn child(&self) -> Self {
        let child = Self::background();
        let mut state = self.inner.lock();
        if state.cancelled {
            child.inner.lock().cancelled = true;
        } else {
            state.children.retain(|c| c.strong_count() > 0);
            state.children.push(Arc::downgrade(&child.inner));
        }
        child
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Block until the context is cancelled.
    pub fn wait(&self) {
        let state = self.inner.lock();
        let _state = self
            .inner
            .cond
            .wait_while(state, |s| !s.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Block until the context is cancelled or `timeout` elapses. Returns
    /// whether the context was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.inner.lock();
        let (state, _) = self
            .inner
            .cond
            .wait_timeout_while(state, timeout, |s| !s.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        state.cancelled
    }
}

impl ContextInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self) {
        let children = {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.children)
        };
        self.cond.notify_all();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

#![forbid(unsafe_code)]

//! Reactive runtime: the context object that owns a graph's tracking stack
//! and batch state.
//!
//! Every cell is bound to the runtime that was current when it was created.
//! Reads register in that runtime's tracker and writes consult that runtime's
//! batch, so independent runtimes never see each other's evaluations.
//!
//! # Design
//!
//! There is no process-wide singleton. Each thread lazily creates its own
//! default runtime (configured from the environment), and [`Runtime::enter`]
//! pushes another runtime onto a thread-local stack for the duration of a
//! closure. [`Runtime::scope`] does the same with a fresh, isolated runtime,
//! which is what tests use to keep graphs apart.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::batch::{BatchScope, BatchState};
use crate::config::ReactiveConfig;
use crate::error::ReactiveError;
use crate::notifier::RoundFailure;
use crate::tracker::{Dependencies, Tracker};

pub(crate) struct RuntimeInner {
    config: ReactiveConfig,
    tracker: Tracker,
    batch: BatchState,
    notify_depth: Cell<usize>,
}

impl RuntimeInner {
    pub(crate) fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub(crate) fn batch(&self) -> &BatchState {
        &self.batch
    }

    /// Enter one notification round.
    ///
    /// # Panics
    ///
    /// Panics with [`ReactiveError::NotifyDepthExceeded`] when rounds nest
    /// deeper than the configured limit (a listener feedback loop).
    pub(crate) fn enter_notify(&self) -> DepthGuard<'_> {
        let depth = self.notify_depth.get() + 1;
        let limit = self.config.max_notify_depth;
        if depth > limit {
            tracing::error!(depth, limit, "notification depth limit exceeded");
            panic!("{}", ReactiveError::NotifyDepthExceeded { depth, limit });
        }
        DepthGuard::enter(&self.notify_depth)
    }

    /// Delivery rounds currently on the stack.
    pub(crate) fn notify_depth(&self) -> usize {
        self.notify_depth.get()
    }

    /// Deliver ordinary listeners of every queued cell.
    ///
    /// Runs after the outermost batch has closed, so a listener that writes
    /// another cell during the flush is delivered synchronously inside its
    /// own `set`, not queued behind the rest.
    pub(crate) fn flush(&self) -> Result<(), RoundFailure> {
        let pending = self.batch.len();
        if pending == 0 {
            return Ok(());
        }
        tracing::debug!(pending, "flushing batch");

        let mut delivered = 0usize;
        let mut failure: Option<RoundFailure> = None;
        while let Some(node) = self.batch.pop() {
            delivered += 1;
            if let Err(round) = node.deliver() {
                RoundFailure::merge(&mut failure, round);
            }
        }

        tracing::debug!(delivered, failed = failure.is_some(), "batch flushed");
        match failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

/// Increments a counter for its lifetime.
pub(crate) struct DepthGuard<'a> {
    counter: &'a Cell<usize>,
}

impl<'a> DepthGuard<'a> {
    pub(crate) fn enter(counter: &'a Cell<usize>) -> Self {
        counter.set(counter.get() + 1);
        Self { counter }
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.counter.set(self.counter.get().saturating_sub(1));
    }
}

/// Handle to a reactive graph context. Cloning shares the same context.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

thread_local! {
    static DEFAULT_RUNTIME: Runtime = Runtime::with_config(ReactiveConfig::from_env());
    static RUNTIME_STACK: RefCell<Vec<Runtime>> = const { RefCell::new(Vec::new()) };
}

impl Runtime {
    /// A fresh runtime with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ReactiveConfig::default())
    }

    #[must_use]
    pub fn with_config(config: ReactiveConfig) -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                config,
                tracker: Tracker::default(),
                batch: BatchState::default(),
                notify_depth: Cell::new(0),
            }),
        }
    }

    /// The innermost entered runtime, or this thread's default runtime.
    #[must_use]
    pub fn current() -> Self {
        RUNTIME_STACK
            .with(|stack| stack.borrow().last().cloned())
            .unwrap_or_else(|| DEFAULT_RUNTIME.with(Runtime::clone))
    }

    /// Run `f` with `self` as the current runtime.
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        RUNTIME_STACK.with(|stack| stack.borrow_mut().push(self.clone()));
        let _pop = StackGuard;
        f()
    }

    /// Run `f` inside a fresh, isolated runtime.
    pub fn scope<R>(f: impl FnOnce() -> R) -> R {
        Self::new().enter(f)
    }

    #[must_use]
    pub fn config(&self) -> ReactiveConfig {
        self.inner.config
    }

    /// Run `f` in a new tracking frame and return what it read.
    ///
    /// Cells record reads in the runtime they were created in, so cells
    /// from other runtimes never appear in the result.
    pub fn track<R>(&self, f: impl FnOnce() -> R) -> (R, Dependencies) {
        self.inner.tracker.track(f)
    }

    /// Run `f` without recording any reads.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.tracker.untracked(f)
    }

    #[must_use]
    pub fn is_tracking(&self) -> bool {
        self.inner.tracker.is_tracking()
    }

    /// Snapshot of the active tracking frame, if any.
    #[must_use]
    pub fn current_reads(&self) -> Option<Dependencies> {
        self.inner.tracker.current()
    }

    /// Run `f` as one batch; see [`Transaction::run`](crate::Transaction::run).
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let _scope = BatchScope::enter(self);
        f()
    }

    #[must_use]
    pub fn in_batch(&self) -> bool {
        self.inner.batch.is_active()
    }

    /// Cells waiting for the outermost batch to end.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.batch.len()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn inner(&self) -> &Rc<RuntimeInner> {
        &self.inner
    }

    #[cfg(test)]
    pub(crate) fn into_inner(self) -> Rc<RuntimeInner> {
        self.inner
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("tracking_depth", &self.inner.tracker.depth())
            .field("batch_depth", &self.inner.batch.depth())
            .field("pending", &self.inner.batch.len())
            .field("notify_depth", &self.inner.notify_depth())
            .finish()
    }
}

struct StackGuard;

impl Drop for StackGuard {
    fn drop(&mut self) {
        RUNTIME_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};

    #[test]
    fn current_defaults_to_thread_runtime() {
        let a = Runtime::current();
        let b = Runtime::current();
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn enter_switches_and_restores() {
        let outer = Runtime::current();
        let rt = Runtime::new();
        rt.enter(|| {
            assert!(Runtime::current().ptr_eq(&rt));
            Runtime::scope(|| {
                assert!(!Runtime::current().ptr_eq(&rt));
            });
            assert!(Runtime::current().ptr_eq(&rt));
        });
        assert!(Runtime::current().ptr_eq(&outer));
    }

    #[test]
    fn enter_restores_after_panic() {
        let outer = Runtime::current();
        let rt = Runtime::new();
        let result = panic::catch_unwind(AssertUnwindSafe(|| rt.enter(|| panic!("inside"))));
        assert!(result.is_err());
        assert!(Runtime::current().ptr_eq(&outer));
    }

    #[test]
    fn notify_depth_is_bounded() {
        let rt = Runtime::with_config(ReactiveConfig::default().with_max_notify_depth(2));
        let inner = rt.inner();
        let _one = inner.enter_notify();
        let _two = inner.enter_notify();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _three = inner.enter_notify();
        }));
        let payload = result.expect_err("third round must be refused");
        let message = payload
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        assert!(message.contains("notification depth 3 exceeded the limit of 2"));
    }

    #[test]
    fn depth_guard_restores_counter() {
        let counter = Cell::new(0);
        {
            let _a = DepthGuard::enter(&counter);
            let _b = DepthGuard::enter(&counter);
            assert_eq!(counter.get(), 2);
        }
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn debug_reports_state() {
        let dbg = format!("{:?}", Runtime::new());
        assert!(dbg.contains("Runtime"));
        assert!(dbg.contains("pending"));
    }
}

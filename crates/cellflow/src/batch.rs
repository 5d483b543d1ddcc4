#![forbid(unsafe_code)]

//! Batched transactions: defer notifications until the outermost batch ends.
//!
//! # Usage
//!
//! ```
//! use cellflow::{Observable, Transaction};
//!
//! let x = Observable::new(0);
//! let y = Observable::new(0);
//!
//! Transaction::run(|| {
//!     x.set(1);
//!     y.set(2);
//!     assert_eq!(x.get(), 1); // values update immediately
//! }); // listeners of x and y run here, once each
//! ```
//!
//! # Invariants
//!
//! 1. While any [`BatchScope`] of a runtime is alive, writes queue their cell
//!    instead of notifying.
//! 2. A cell is queued at most once until it is delivered, however many times
//!    it is written.
//! 3. Only the outermost scope flushes; nested scopes join it.
//! 4. Depth is restored and the queue flushed even when the batched closure
//!    panics. Listener panics raised by such a flush are logged, not
//!    re-raised, since the thread is already unwinding.
//! 5. The flush runs with the batch closed. A listener that writes another
//!    cell during the flush notifies that cell's listeners before its `set`
//!    returns.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::thread;

use ahash::AHashSet;

use crate::error::Result;
use crate::notifier::{CellId, Notifier};
use crate::runtime::Runtime;

// ─── Batch state ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct BatchState {
    depth: Cell<usize>,
    pending: RefCell<PendingQueue>,
}

#[derive(Default)]
struct PendingQueue {
    order: VecDeque<Rc<Notifier>>,
    queued: AHashSet<CellId>,
}

impl BatchState {
    pub(crate) fn is_active(&self) -> bool {
        self.depth.get() > 0
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth.get()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.borrow().order.len()
    }

    fn enter(&self) {
        self.depth.set(self.depth.get() + 1);
    }

    /// Leave one level; `true` when this closed the outermost batch.
    fn exit(&self) -> bool {
        let depth = self.depth.get().saturating_sub(1);
        self.depth.set(depth);
        depth == 0
    }

    pub(crate) fn enqueue(&self, node: &Rc<Notifier>) {
        let mut pending = self.pending.borrow_mut();
        if pending.queued.insert(node.id()) {
            pending.order.push_back(Rc::clone(node));
        }
    }

    pub(crate) fn pop(&self) -> Option<Rc<Notifier>> {
        let mut pending = self.pending.borrow_mut();
        let node = pending.order.pop_front()?;
        pending.queued.remove(&node.id());
        Some(node)
    }
}

// ─── BatchScope ──────────────────────────────────────────────────────────────

/// RAII guard that keeps a batch open on a runtime.
///
/// Dropping the outermost scope flushes the queued notifications. A listener
/// panic during that flush is re-raised from `drop` once every queued cell has
/// been delivered; use [`BatchScope::finish`] to get it as an error instead.
#[must_use = "dropping a BatchScope immediately ends the batch"]
pub struct BatchScope {
    runtime: Runtime,
    open: bool,
}

impl BatchScope {
    /// Open a batch on the current runtime.
    pub fn new() -> Self {
        Self::enter(&Runtime::current())
    }

    /// Open a batch on `runtime`.
    pub fn enter(runtime: &Runtime) -> Self {
        runtime.inner().batch().enter();
        Self {
            runtime: runtime.clone(),
            open: true,
        }
    }

    /// End the batch, reporting listener panics from the flush as an error.
    pub fn finish(mut self) -> Result<()> {
        self.open = false;
        let inner = self.runtime.inner();
        if inner.batch().exit() {
            inner.flush().map_err(|failure| failure.into_error())?;
        }
        Ok(())
    }

    /// Nesting depth of the runtime's batch, this scope included.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.runtime.inner().batch().depth()
    }
}

impl Default for BatchScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BatchScope {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let inner = self.runtime.inner();
        if !inner.batch().exit() {
            return;
        }
        if let Err(failure) = inner.flush() {
            if thread::panicking() {
                failure.log();
            } else {
                failure.resume();
            }
        }
    }
}

impl fmt::Debug for BatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchScope")
            .field("open", &self.open)
            .field("depth", &self.depth())
            .finish()
    }
}

// ─── Transaction ─────────────────────────────────────────────────────────────

/// Entry points for batching writes on the current runtime.
pub struct Transaction;

impl Transaction {
    /// Run `f` as one batch. Every cell written inside is notified exactly
    /// once, after `f` returns and the outermost batch closes.
    ///
    /// The batch is opened on [`Runtime::current`]. A cell stays bound to the
    /// runtime it was created in, so writes to cells of another runtime are
    /// not deferred here; wrap them in that runtime's [`Runtime::batch`].
    pub fn run<R>(f: impl FnOnce() -> R) -> R {
        let _scope = BatchScope::new();
        f()
    }

    /// Like [`run`](Self::run), but listener panics raised by the flush come
    /// back as [`ReactiveError::ListenerPanicked`](crate::ReactiveError).
    /// Batches [`Runtime::current`] only, as `run` does.
    pub fn try_run<R>(f: impl FnOnce() -> R) -> Result<R> {
        let scope = BatchScope::new();
        let result = f();
        scope.finish()?;
        Ok(result)
    }

    #[must_use]
    pub fn in_batch() -> bool {
        Runtime::current().in_batch()
    }

    #[must_use]
    pub fn pending_len() -> usize {
        Runtime::current().pending_len()
    }
}

/// Shorthand for [`Transaction::run`].
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    Transaction::run(f)
}

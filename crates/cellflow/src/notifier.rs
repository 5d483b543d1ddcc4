#![forbid(unsafe_code)]

//! Per-cell listener registries: the notification bus shared by every cell.
//!
//! A [`Notifier`] owns the ordered listener list of one cell. Both
//! [`Observable`](crate::Observable) and [`Computed`](crate::Computed) compose
//! one; the [`Listenable`] trait is the seam external consumers (a UI rebuild
//! mechanism, an [`Effect`](crate::Effect)) program against.
//!
//! # Delivery
//!
//! A notification has two phases. First every computed cell downstream of
//! the write is marked dirty, walking the graph with a worklist so chain
//! length is unbounded and no user code runs. Then ordinary listeners are
//! delivered: inline, before `set` returns, when no batch is open; at the
//! end of the outermost batch otherwise. A listener that writes another cell
//! outside a batch is a synchronous nested call, bounded by
//! [`ReactiveConfig::max_notify_depth`](crate::ReactiveConfig).
//!
//! # Invariants
//!
//! 1. Listeners run in registration order.
//! 2. Registration is idempotent per listener identity ([`Listener`] clones
//!    share identity).
//! 3. A listener removed, or a notifier disposed, during a round is not
//!    invoked for the rest of that round.
//! 4. A panicking listener does not stop the other listeners of the round;
//!    the panic is surfaced once the round completes.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ReactiveError, Result};
use crate::runtime::RuntimeInner;

// ─── Cell identity ───────────────────────────────────────────────────────────

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a reactive cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

// ─── Listener ────────────────────────────────────────────────────────────────

/// Invalidation callbacks return the cell they turned dirty, if any.
type Callback = Rc<dyn Fn() -> Option<Rc<Notifier>>>;

/// A notification callback with pointer identity.
///
/// Cloning a `Listener` yields the same identity, so registering a clone of an
/// already registered listener has no effect.
#[derive(Clone)]
pub struct Listener {
    callback: Callback,
    phase: Phase,
}

/// Which half of a notification a listener belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Invalidate,
    Deliver,
}

impl Listener {
    pub fn new(callback: impl Fn() + 'static) -> Self {
        Self {
            callback: Rc::new(move || {
                callback();
                None
            }),
            phase: Phase::Deliver,
        }
    }

    /// A listener for the invalidation walk. `mark` must not run user code;
    /// it returns the cell it turned from clean to dirty so the walk can
    /// continue from there.
    pub(crate) fn invalidation(mark: impl Fn() -> Option<Rc<Notifier>> + 'static) -> Self {
        Self {
            callback: Rc::new(mark),
            phase: Phase::Invalidate,
        }
    }

    /// Invoke the callback directly.
    pub fn call(&self) {
        let _ = (self.callback)();
    }

    #[must_use]
    pub fn same_as(&self, other: &Listener) -> bool {
        Rc::ptr_eq(&self.callback, &other.callback)
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Listener {}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("ptr", &Rc::as_ptr(&self.callback).cast::<()>())
            .field("phase", &self.phase)
            .finish()
    }
}

// ─── Round failures ──────────────────────────────────────────────────────────

/// Panics caught while delivering one notification round (or one flush).
pub(crate) struct RoundFailure {
    cell: CellId,
    payloads: Vec<Box<dyn Any + Send>>,
}

impl RoundFailure {
    fn new(cell: CellId) -> Self {
        Self {
            cell,
            payloads: Vec::new(),
        }
    }

    /// Fold a later failure into this one, keeping the first cell.
    pub(crate) fn absorb(&mut self, other: RoundFailure) {
        self.payloads.extend(other.payloads);
    }

    /// Accumulate `next` into `acc`.
    pub(crate) fn merge(acc: &mut Option<RoundFailure>, next: RoundFailure) {
        match acc {
            Some(first) => first.absorb(next),
            None => *acc = Some(next),
        }
    }

    pub(crate) fn message(&self) -> String {
        self.payloads
            .first()
            .map(|payload| payload_message(payload.as_ref()))
            .unwrap_or_default()
    }

    pub(crate) fn into_error(self) -> ReactiveError {
        ReactiveError::ListenerPanicked {
            cell: self.cell,
            failures: self.payloads.len(),
            message: self.message(),
        }
    }

    /// Re-raise the first caught panic on the current thread.
    pub(crate) fn resume(self) -> ! {
        let cell = self.cell;
        match self.payloads.into_iter().next() {
            Some(payload) => panic::resume_unwind(payload),
            None => panic!("listener round of {cell} failed without a panic payload"),
        }
    }

    /// Report without unwinding; used when the thread is already panicking.
    pub(crate) fn log(&self) {
        tracing::error!(
            cell = %self.cell,
            failures = self.payloads.len(),
            message = %self.message(),
            "listener panics dropped while unwinding"
        );
    }
}

impl fmt::Debug for RoundFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundFailure")
            .field("cell", &self.cell)
            .field("failures", &self.payloads.len())
            .field("message", &self.message())
            .finish()
    }
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ─── Notifier ────────────────────────────────────────────────────────────────

/// Listener registry and notification entry point for one cell.
pub(crate) struct Notifier {
    id: CellId,
    runtime: Rc<RuntimeInner>,
    listeners: RefCell<Vec<Listener>>,
    disposed: Cell<bool>,
}

impl Notifier {
    pub(crate) fn new(runtime: Rc<RuntimeInner>) -> Rc<Self> {
        Rc::new(Self {
            id: CellId::next(),
            runtime,
            listeners: RefCell::new(Vec::new()),
            disposed: Cell::new(false),
        })
    }

    pub(crate) fn id(&self) -> CellId {
        self.id
    }

    pub(crate) fn runtime(&self) -> &Rc<RuntimeInner> {
        &self.runtime
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Register `listener`; `false` if already registered or disposed.
    pub(crate) fn add(&self, listener: &Listener) -> bool {
        if self.disposed.get() {
            return false;
        }
        let mut listeners = self.listeners.borrow_mut();
        if listeners.iter().any(|l| l.same_as(listener)) {
            return false;
        }
        listeners.push(listener.clone());
        true
    }

    /// Unregister `listener`; `false` if it was not registered.
    pub(crate) fn remove(&self, listener: &Listener) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        match listeners.iter().position(|l| l.same_as(listener)) {
            Some(index) => {
                listeners.remove(index);
                true
            }
            None => false,
        }
    }

    fn is_registered(&self, listener: &Listener) -> bool {
        self.listeners.borrow().iter().any(|l| l.same_as(listener))
    }

    /// Drop every listener and refuse new ones. Idempotent.
    pub(crate) fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        // Take first so listener destructors run without the borrow held.
        let released = std::mem::take(&mut *self.listeners.borrow_mut());
        tracing::trace!(cell = %self.id, released = released.len(), "cell disposed");
        drop(released);
    }

    /// Record a read of this cell in the active tracking frame, if any.
    pub(crate) fn track_read(self: &Rc<Self>) {
        self.runtime.tracker().record(self);
    }

    /// Mark dependents dirty, then deliver ordinary listeners.
    ///
    /// Inside a batch delivery waits for the outermost batch to end; outside
    /// one every affected cell is delivered before this returns.
    ///
    /// # Panics
    ///
    /// Panics with [`ReactiveError::NotifyDepthExceeded`] when nested
    /// delivery rounds exceed the configured limit.
    pub(crate) fn notify(self: &Rc<Self>) -> std::result::Result<(), RoundFailure> {
        if self.disposed.get() {
            return Ok(());
        }
        let changed = self.invalidate_downstream();
        let batch = self.runtime.batch();
        if batch.is_active() {
            for node in &changed {
                batch.enqueue(node);
            }
            return Ok(());
        }

        let mut failure: Option<RoundFailure> = None;
        for node in &changed {
            if let Err(round) = node.deliver() {
                RoundFailure::merge(&mut failure, round);
            }
        }
        match failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    /// Walk invalidation listeners breadth-first from this cell.
    ///
    /// Returns this cell followed by every cell that went from clean to
    /// dirty, in discovery order. Iterative, so it never touches the notify
    /// depth.
    pub(crate) fn invalidate_downstream(self: &Rc<Self>) -> Vec<Rc<Notifier>> {
        let mut changed = vec![Rc::clone(self)];
        let mut next = 0;
        while next < changed.len() {
            let node = Rc::clone(&changed[next]);
            next += 1;
            for listener in node.snapshot(Phase::Invalidate) {
                if let Some(dirtied) = (listener.callback)() {
                    changed.push(dirtied);
                }
            }
        }
        if changed.len() > 1 {
            tracing::trace!(cell = %self.id, dirtied = changed.len() - 1, "invalidation walk");
        }
        changed
    }

    /// Run this cell's ordinary listeners over a snapshot of the list.
    pub(crate) fn deliver(&self) -> std::result::Result<(), RoundFailure> {
        let _depth = self.runtime.enter_notify();
        let mut failure: Option<RoundFailure> = None;
        for listener in &self.snapshot(Phase::Deliver) {
            if self.disposed.get() {
                break;
            }
            if !self.is_registered(listener) {
                continue;
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener.call())) {
                tracing::debug!(cell = %self.id, "listener panicked during notification");
                failure
                    .get_or_insert_with(|| RoundFailure::new(self.id))
                    .payloads
                    .push(payload);
            }
        }
        match failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn snapshot(&self, phase: Phase) -> Vec<Listener> {
        self.listeners
            .borrow()
            .iter()
            .filter(|l| l.phase == phase)
            .cloned()
            .collect()
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("id", &self.id)
            .field("listeners", &self.listeners.borrow().len())
            .field("disposed", &self.disposed.get())
            .finish()
    }
}

// ─── Subscription ────────────────────────────────────────────────────────────

/// RAII guard that removes its listener when dropped.
#[must_use = "dropping a Subscription immediately removes its listener"]
pub struct Subscription {
    notifier: Weak<Notifier>,
    listener: Listener,
}

impl Subscription {
    pub(crate) fn attach(notifier: &Rc<Notifier>, listener: Listener) -> Self {
        notifier.add(&listener);
        Self {
            notifier: Rc::downgrade(notifier),
            listener,
        }
    }

    /// Whether the listener is still registered on a live cell.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.notifier
            .upgrade()
            .is_some_and(|n| !n.is_disposed() && n.is_registered(&self.listener))
    }

    /// The listener this subscription keeps registered.
    #[must_use]
    pub fn listener(&self) -> &Listener {
        &self.listener
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(notifier) = self.notifier.upgrade() {
            notifier.remove(&self.listener);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

// ─── Listenable ──────────────────────────────────────────────────────────────

/// The capability shared by every cell: listener registration and disposal.
///
/// Infallible methods are silent no-ops on a disposed cell; `try_add_listener`
/// reports [`ReactiveError::UseAfterDispose`] instead.
pub trait Listenable {
    fn id(&self) -> CellId;

    /// Register `listener`; `false` when it was already registered or the
    /// cell is disposed.
    fn add_listener(&self, listener: &Listener) -> bool;

    /// Unregister `listener`; `false` when it was not registered.
    fn remove_listener(&self, listener: &Listener) -> bool;

    /// Register `listener` for as long as the returned guard lives.
    fn listen(&self, listener: Listener) -> Subscription;

    fn is_disposed(&self) -> bool;

    /// Release every listener. Idempotent.
    fn dispose(&self);

    fn try_add_listener(&self, listener: &Listener) -> Result<bool> {
        if self.is_disposed() {
            return Err(ReactiveError::use_after_dispose(self.id(), "add_listener"));
        }
        Ok(self.add_listener(listener))
    }
}

/// Shared `add_listener` body with the disposed-cell warning.
pub(crate) fn add_or_warn(notifier: &Notifier, listener: &Listener) -> bool {
    if notifier.is_disposed() {
        tracing::warn!(cell = %notifier.id(), "add_listener on disposed cell ignored");
        return false;
    }
    notifier.add(listener)
}

#![forbid(unsafe_code)]

//! Mutable observable cells.
//!
//! # Invariants
//!
//! 1. Version increments exactly once per write that changes the value.
//! 2. Writing a value equal to the current one is a no-op: no version bump,
//!    no notification. Computed graphs rely on this to settle.
//! 3. Outside a batch, listeners run synchronously in registration order,
//!    after the new value is stored.
//! 4. Inside a batch, the cell is queued and notified once when the
//!    outermost batch ends.
//!
//! # Failure Modes
//!
//! - **Use after dispose**: `get` returns the last stored value without
//!   tracking, `set`/`update` are ignored, and nothing is ever notified again.
//!   The `try_*` variants return [`ReactiveError::UseAfterDispose`].
//! - **Listener panics**: every listener of the round still runs, then `set`
//!   re-raises the first panic (`try_set` returns it as an error).
//! - **Re-entrant borrow**: writing a cell from inside its own
//!   [`with`](Observable::with) closure panics.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::{ReactiveError, Result};
use crate::notifier::{self, CellId, Listenable, Listener, Notifier, RoundFailure, Subscription};
use crate::runtime::Runtime;

struct ObservableInner<T> {
    node: Rc<Notifier>,
    value: RefCell<T>,
    version: Cell<u64>,
}

/// A shared, version-tracked value that notifies listeners on change.
///
/// Cloning an `Observable` creates a new handle to the **same** cell.
pub struct Observable<T> {
    inner: Rc<ObservableInner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("id", &self.inner.node.id())
            .field("value", &self.inner.value.borrow())
            .field("version", &self.inner.version.get())
            .field("listeners", &self.inner.node.listener_count())
            .field("disposed", &self.inner.node.is_disposed())
            .finish()
    }
}

impl<T: Clone + PartialEq + 'static> Observable<T> {
    /// Create a cell in the current runtime.
    pub fn new(value: T) -> Self {
        Self::new_in(&Runtime::current(), value)
    }

    /// Create a cell bound to `runtime`.
    pub fn new_in(runtime: &Runtime, value: T) -> Self {
        Self {
            inner: Rc::new(ObservableInner {
                node: Notifier::new(Rc::clone(runtime.inner())),
                value: RefCell::new(value),
                version: Cell::new(0),
            }),
        }
    }

    /// Current value, recorded as a dependency of the active evaluation.
    #[must_use]
    pub fn get(&self) -> T {
        if self.inner.node.is_disposed() {
            tracing::warn!(cell = %self.id(), "get on disposed observable is untracked");
        } else {
            self.inner.node.track_read();
        }
        self.inner.value.borrow().clone()
    }

    pub fn try_get(&self) -> Result<T> {
        self.ensure_live("get")?;
        Ok(self.get())
    }

    /// Current value without recording a dependency.
    #[must_use]
    pub fn get_untracked(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Borrow the current value, recording a dependency.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        if !self.inner.node.is_disposed() {
            self.inner.node.track_read();
        }
        f(&self.inner.value.borrow())
    }

    /// Store `value` and notify if it differs from the current value.
    ///
    /// # Panics
    ///
    /// Re-raises the first listener panic after all listeners have run.
    pub fn set(&self, value: T) {
        if self.inner.node.is_disposed() {
            tracing::warn!(cell = %self.id(), "set on disposed observable ignored");
            return;
        }
        if let Err(failure) = self.store(value) {
            failure.resume();
        }
    }

    /// Like [`set`](Self::set), reporting disposal and listener panics as
    /// errors. Returns whether the value changed.
    pub fn try_set(&self, value: T) -> Result<bool> {
        self.ensure_live("set")?;
        let before = self.version();
        self.store(value).map_err(RoundFailure::into_error)?;
        Ok(self.version() != before)
    }

    /// Mutate a copy of the value in place, then [`set`](Self::set) it.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut next = self.get_untracked();
        f(&mut next);
        self.set(next);
    }

    /// [`set`](Self::set) and return the previous value.
    pub fn replace(&self, value: T) -> T {
        let previous = self.get_untracked();
        self.set(value);
        previous
    }

    /// Subscribe a callback that receives the new value on every change.
    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> Subscription {
        let weak: Weak<ObservableInner<T>> = Rc::downgrade(&self.inner);
        let listener = Listener::new(move || {
            if let Some(inner) = weak.upgrade() {
                let value = inner.value.borrow().clone();
                callback(&value);
            }
        });
        self.listen(listener)
    }

    /// Number of changing writes so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.node.listener_count()
    }

    fn ensure_live(&self, operation: &'static str) -> Result<()> {
        if self.inner.node.is_disposed() {
            return Err(ReactiveError::use_after_dispose(self.id(), operation));
        }
        Ok(())
    }

    fn store(&self, value: T) -> std::result::Result<(), RoundFailure> {
        {
            let mut current = self.inner.value.borrow_mut();
            if *current == value {
                return Ok(());
            }
            *current = value;
        }
        self.inner.version.set(self.inner.version.get() + 1);
        self.inner.node.notify()
    }
}

impl<T: Clone + PartialEq + Default + 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + PartialEq + 'static> Listenable for Observable<T> {
    fn id(&self) -> CellId {
        self.inner.node.id()
    }

    fn add_listener(&self, listener: &Listener) -> bool {
        notifier::add_or_warn(&self.inner.node, listener)
    }

    fn remove_listener(&self, listener: &Listener) -> bool {
        self.inner.node.remove(listener)
    }

    fn listen(&self, listener: Listener) -> Subscription {
        if self.inner.node.is_disposed() {
            tracing::warn!(cell = %self.id(), "listen on disposed observable is inert");
        }
        Subscription::attach(&self.inner.node, listener)
    }

    fn is_disposed(&self) -> bool {
        self.inner.node.is_disposed()
    }

    fn dispose(&self) {
        self.inner.node.dispose();
    }
}

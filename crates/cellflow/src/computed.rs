#![forbid(unsafe_code)]

//! Lazy computed values with automatic dependency tracking.
//!
//! # Design
//!
//! [`Computed<T>`] wraps a derivation closure and its cached result in shared,
//! reference-counted storage. Each recomputation runs the closure inside a
//! tracking frame; the cells it reads become the computed's sources. When any
//! source notifies, the cached value is invalidated (marked dirty) and the
//! computed notifies its own listeners. The next read recomputes.
//!
//! Invalidation is pushed eagerly, values are pulled lazily: a source that
//! changes ten times between two reads costs one recomputation.
//!
//! # Invariants
//!
//! 1. `get()` always returns a value consistent with the current state of all
//!    sources.
//! 2. The derivation runs at most once between two reads, however many times
//!    the sources change.
//! 3. Sources are re-collected on every recomputation; a source that is no
//!    longer read stops invalidating the computed.
//! 4. Listeners fire once per clean-to-dirty transition, whether or not the
//!    recomputed value ends up different.
//! 5. Version increments by exactly 1 per recomputation.
//!
//! # Failure Modes
//!
//! - **Derivation panics**: The cached value remains from the last successful
//!   computation and the dirty flag stays set, so the next `get()` retries.
//!   Sources are left as they were before the failed run.
//! - **Cycle**: Reading a computed from inside its own derivation (directly
//!   or through other computed cells) is detected; `get()` panics with
//!   [`ReactiveError::CyclicDependency`] and `try_get()` returns it.
//! - **Use after dispose**: `get()` returns the last cached value untracked
//!   (deriving once, untracked, if it never ran); `try_get()` returns
//!   [`ReactiveError::UseAfterDispose`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::{ReactiveError, Result};
use crate::notifier::{self, CellId, Listenable, Listener, Notifier, Subscription};
use crate::observable::Observable;
use crate::runtime::Runtime;
use crate::tracker::{self, Dependencies};

/// Shared interior for [`Computed<T>`].
struct ComputedInner<T> {
    node: Rc<Notifier>,
    /// The derivation function.
    derive: Box<dyn Fn() -> T>,
    /// Cached result (None only before first computation).
    cached: RefCell<Option<T>>,
    dirty: Cell<bool>,
    /// Set while the derivation runs; a read in that window is a cycle.
    evaluating: Cell<bool>,
    /// Cells read by the last successful derivation.
    sources: RefCell<Dependencies>,
    /// Registered on every source; marks this computed dirty.
    invalidator: Listener,
    version: Cell<u64>,
}

impl<T: Clone + 'static> ComputedInner<T> {
    /// Flag the cached value stale; `true` on a clean-to-dirty transition.
    /// Runs inside the invalidation walk, so it must not notify.
    fn mark_dirty(&self) -> bool {
        if self.node.is_disposed() || self.dirty.replace(true) {
            return false;
        }
        tracing::trace!(cell = %self.node.id(), "computed invalidated");
        true
    }

    fn refresh(&self) -> Result<()> {
        if !self.dirty.get() && self.cached.borrow().is_some() {
            return Ok(());
        }
        if self.evaluating.get() {
            return Err(ReactiveError::CyclicDependency {
                cell: self.node.id(),
            });
        }

        let (value, next) = {
            let _evaluating = EvaluatingGuard::enter(&self.evaluating);
            self.node.runtime().tracker().track(|| (self.derive)())
        };

        let prev = self.sources.replace(next);
        tracker::rewire(&prev, &self.sources.borrow(), &self.invalidator);

        let stale = self.cached.replace(Some(value));
        self.dirty.set(false);
        self.version.set(self.version.get() + 1);
        tracing::trace!(
            cell = %self.node.id(),
            version = self.version.get(),
            sources = self.sources.borrow().len(),
            "computed recomputed"
        );
        drop(stale);
        Ok(())
    }

    fn cached_clone(&self) -> Option<T> {
        self.cached.borrow().clone()
    }

    fn release_sources(&self) {
        let sources = self.sources.take();
        tracker::detach(&sources, &self.invalidator);
    }
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        tracker::detach(self.sources.get_mut(), &self.invalidator);
    }
}

struct EvaluatingGuard<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> EvaluatingGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self { flag }
    }
}

impl Drop for EvaluatingGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

/// A lazily-evaluated, memoized value derived from other cells.
///
/// Cloning a `Computed` creates a new handle to the **same** inner state.
/// Dropping the last handle unsubscribes from every source.
pub struct Computed<T> {
    inner: Rc<ComputedInner<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.node.id())
            .field("cached", &self.inner.cached.borrow())
            .field("dirty", &self.inner.dirty.get())
            .field("version", &self.inner.version.get())
            .field("sources", &*self.inner.sources.borrow())
            .finish()
    }
}

impl<T: Clone + 'static> Computed<T> {
    /// Create a computed value in the current runtime. Nothing runs until
    /// the first read.
    pub fn new(derive: impl Fn() -> T + 'static) -> Self {
        Self::new_in(&Runtime::current(), derive)
    }

    /// Create a computed value bound to `runtime`.
    pub fn new_in(runtime: &Runtime, derive: impl Fn() -> T + 'static) -> Self {
        let node = Notifier::new(Rc::clone(runtime.inner()));
        let inner = Rc::new_cyclic(|weak: &Weak<ComputedInner<T>>| {
            let weak = weak.clone();
            ComputedInner {
                node,
                derive: Box::new(derive),
                cached: RefCell::new(None),
                dirty: Cell::new(true),
                evaluating: Cell::new(false),
                sources: RefCell::new(Dependencies::new()),
                invalidator: Listener::invalidation(move || {
                    let inner = weak.upgrade()?;
                    inner.mark_dirty().then(|| Rc::clone(&inner.node))
                }),
                version: Cell::new(0),
            }
        });
        Self { inner }
    }

    /// Create a computed value derived from a single observable.
    pub fn from_observable<S: Clone + PartialEq + 'static>(
        source: &Observable<S>,
        map: impl Fn(&S) -> T + 'static,
    ) -> Self {
        let source = source.clone();
        Self::new(move || source.with(|v| map(v)))
    }

    /// Create a computed value derived from two observables.
    pub fn from2<S1, S2>(
        s1: &Observable<S1>,
        s2: &Observable<S2>,
        map: impl Fn(&S1, &S2) -> T + 'static,
    ) -> Self
    where
        S1: Clone + PartialEq + 'static,
        S2: Clone + PartialEq + 'static,
    {
        let (s1, s2) = (s1.clone(), s2.clone());
        Self::new(move || s1.with(|v1| s2.with(|v2| map(v1, v2))))
    }

    /// Get the current value, recomputing if any source has changed.
    ///
    /// # Panics
    ///
    /// Panics with [`ReactiveError::CyclicDependency`] when called from
    /// inside this computed's own derivation.
    #[must_use]
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(ReactiveError::UseAfterDispose { .. }) => {
                tracing::warn!(cell = %self.id(), "get on disposed computed is untracked");
                self.disposed_value()
            }
            Err(err) => panic!("{err}"),
        }
    }

    pub fn try_get(&self) -> Result<T> {
        if self.inner.node.is_disposed() {
            return Err(ReactiveError::use_after_dispose(self.id(), "get"));
        }
        self.inner.refresh()?;
        self.inner.node.track_read();
        match self.inner.cached_clone() {
            Some(value) => Ok(value),
            None => unreachable!("refresh leaves a cached value"),
        }
    }

    /// Current value without recording a dependency. Still recomputes when
    /// dirty.
    #[must_use]
    pub fn get_untracked(&self) -> T {
        self.inner.node.runtime().tracker().untracked(|| self.get())
    }

    /// Access the current value by reference without cloning.
    ///
    /// # Panics
    ///
    /// Panics if the closure reads this same computed while it is dirty, or
    /// on a cycle (see [`get`](Self::get)).
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let _ = self.get();
        if let Some(value) = self.inner.cached.borrow().as_ref() {
            return f(value);
        }
        // Disposed before it ever ran.
        f(&self.disposed_value())
    }

    /// Whether the cached value is stale.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.get()
    }

    /// Force invalidation, exactly as if a source had changed.
    pub fn invalidate(&self) {
        if self.inner.mark_dirty()
            && let Err(failure) = self.inner.node.notify()
        {
            failure.resume();
        }
    }

    /// Current version number. Increments by 1 on each recomputation.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }

    /// The cells read by the last derivation.
    #[must_use]
    pub fn dependencies(&self) -> Dependencies {
        self.inner.sources.borrow().clone()
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.node.listener_count()
    }

    fn disposed_value(&self) -> T {
        match self.inner.cached_clone() {
            Some(value) => value,
            None => self
                .inner
                .node
                .runtime()
                .tracker()
                .untracked(|| (self.inner.derive)()),
        }
    }
}

impl<T: Clone + 'static> Listenable for Computed<T> {
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
            tracing::warn!(cell = %self.id(), "listen on disposed computed is inert");
        }
        Subscription::attach(&self.inner.node, listener)
    }

    fn is_disposed(&self) -> bool {
        self.inner.node.is_disposed()
    }

    fn dispose(&self) {
        self.inner.node.dispose();
        self.inner.release_sources();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

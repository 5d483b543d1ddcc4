#![forbid(unsafe_code)]

//! Effects: closures that re-run whenever a cell they read changes.
//!
//! An [`Effect`] is the consumer end of the graph, the shape a UI rebuild
//! takes: run once under tracking, subscribe to exactly what was read, re-run
//! on notification, subscribe again to the new read set.
//!
//! Effects are ordinary listeners, so inside a batch they re-run once, after
//! the outermost batch ends. An effect is never re-entered: a notification
//! that arrives while it is running (it wrote a cell it reads) is ignored.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::notifier::Listener;
use crate::runtime::{Runtime, RuntimeInner};
use crate::tracker::{self, Dependencies};

struct EffectInner {
    runtime: Rc<RuntimeInner>,
    run: Box<dyn Fn()>,
    sources: RefCell<Dependencies>,
    trigger: Listener,
    runs: Cell<u64>,
    running: Cell<bool>,
    disposed: Cell<bool>,
}

impl EffectInner {
    fn execute(&self) {
        if self.disposed.get() || self.running.replace(true) {
            return;
        }
        let _reset = RunningReset(&self.running);
        let ((), next) = self.runtime.tracker().track(|| (self.run)());
        let prev = self.sources.replace(next);
        tracker::rewire(&prev, &self.sources.borrow(), &self.trigger);
        self.runs.set(self.runs.get() + 1);
        tracing::trace!(
            runs = self.runs.get(),
            sources = self.sources.borrow().len(),
            "effect ran"
        );
    }

    fn release(&self) {
        self.disposed.set(true);
        let sources = self.sources.take();
        tracker::detach(&sources, &self.trigger);
    }
}

impl Drop for EffectInner {
    fn drop(&mut self) {
        tracker::detach(self.sources.get_mut(), &self.trigger);
    }
}

struct RunningReset<'a>(&'a Cell<bool>);

impl Drop for RunningReset<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// A tracked side effect. Dropping the handle disposes it.
#[must_use = "dropping an Effect immediately disposes it"]
pub struct Effect {
    inner: Rc<EffectInner>,
}

impl Effect {
    /// Create an effect in the current runtime and run it once.
    pub fn new(run: impl Fn() + 'static) -> Self {
        Self::new_in(&Runtime::current(), run)
    }

    /// Create an effect bound to `runtime` and run it once.
    pub fn new_in(runtime: &Runtime, run: impl Fn() + 'static) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<EffectInner>| {
            let weak = weak.clone();
            EffectInner {
                runtime: Rc::clone(runtime.inner()),
                run: Box::new(run),
                sources: RefCell::new(Dependencies::new()),
                trigger: Listener::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.execute();
                    }
                }),
                runs: Cell::new(0),
                running: Cell::new(false),
                disposed: Cell::new(false),
            }
        });
        inner.execute();
        Self { inner }
    }

    /// How many times the closure has run.
    #[must_use]
    pub fn run_count(&self) -> u64 {
        self.inner.runs.get()
    }

    /// The cells read by the last run.
    #[must_use]
    pub fn dependencies(&self) -> Dependencies {
        self.inner.sources.borrow().clone()
    }

    /// Stop reacting and release every subscription. Idempotent.
    pub fn dispose(&self) {
        self.inner.release();
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("runs", &self.inner.runs.get())
            .field("sources", &*self.inner.sources.borrow())
            .field("disposed", &self.inner.disposed.get())
            .finish()
    }
}

#![forbid(unsafe_code)]

//! Dependency tracking: which cells were read during an evaluation.
//!
//! The tracker is a LIFO stack of frames owned by a [`Runtime`]. [`track`]
//! pushes a frame, runs a closure, and pops the frame, returning the set of
//! cells read in between. Cells register themselves on read through
//! [`Notifier::track_read`].
//!
//! # Invariants
//!
//! 1. A read registers only in the innermost frame. An outer evaluation that
//!    reads a [`Computed`](crate::Computed) depends on the computed cell, not
//!    on the cells the computed reads internally.
//! 2. Reads with no active frame, or under [`untracked`], register nowhere.
//! 3. Frames are popped by a guard, so a panicking evaluation never leaks its
//!    frame into the next one.
//! 4. A frame records each cell once, in first-read order.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ahash::AHashSet;

use crate::notifier::{CellId, Listener, Notifier};
use crate::runtime::Runtime;

// ─── Dependencies ────────────────────────────────────────────────────────────

/// Insertion-ordered, deduplicated set of cells read during one evaluation.
#[derive(Clone, Default)]
pub struct Dependencies {
    nodes: Vec<Rc<Notifier>>,
    ids: AHashSet<CellId>,
}

impl Dependencies {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, node: &Rc<Notifier>) -> bool {
        if !self.ids.insert(node.id()) {
            return false;
        }
        self.nodes.push(Rc::clone(node));
        true
    }

    #[must_use]
    pub fn contains(&self, id: CellId) -> bool {
        self.ids.contains(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Cell ids in first-read order.
    pub fn ids(&self) -> impl Iterator<Item = CellId> + '_ {
        self.nodes.iter().map(|n| n.id())
    }

    pub(crate) fn nodes(&self) -> &[Rc<Notifier>] {
        &self.nodes
    }
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ids()).finish()
    }
}

impl PartialEq for Dependencies {
    fn eq(&self, other: &Self) -> bool {
        self.ids == other.ids
    }
}

impl Eq for Dependencies {}

/// Move `listener` from the cells of `prev` to the cells of `next`, touching
/// only the cells present in one set but not the other.
pub(crate) fn rewire(prev: &Dependencies, next: &Dependencies, listener: &Listener) {
    for node in prev.nodes() {
        if !next.contains(node.id()) {
            node.remove(listener);
        }
    }
    for node in next.nodes() {
        if !prev.contains(node.id()) {
            node.add(listener);
        }
    }
}

/// Remove `listener` from every cell in `deps`.
pub(crate) fn detach(deps: &Dependencies, listener: &Listener) {
    for node in deps.nodes() {
        node.remove(listener);
    }
}

// ─── Tracker ─────────────────────────────────────────────────────────────────

/// Frame stack. `None` entries suspend tracking for an `untracked` section.
#[derive(Default)]
pub(crate) struct Tracker {
    frames: RefCell<Vec<Option<Dependencies>>>,
}

impl Tracker {
    pub(crate) fn track<R>(&self, f: impl FnOnce() -> R) -> (R, Dependencies) {
        let guard = FrameGuard::push(self, Some(Dependencies::new()));
        let result = f();
        let deps = guard.finish().unwrap_or_default();
        (result, deps)
    }

    pub(crate) fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let guard = FrameGuard::push(self, None);
        let result = f();
        guard.finish();
        result
    }

    pub(crate) fn record(&self, node: &Rc<Notifier>) {
        if let Some(Some(frame)) = self.frames.borrow_mut().last_mut() {
            frame.insert(node);
        }
    }

    pub(crate) fn is_tracking(&self) -> bool {
        matches!(self.frames.borrow().last(), Some(Some(_)))
    }

    pub(crate) fn current(&self) -> Option<Dependencies> {
        self.frames.borrow().last().cloned().flatten()
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    fn pop(&self) -> Option<Dependencies> {
        self.frames.borrow_mut().pop().flatten()
    }
}

struct FrameGuard<'a> {
    tracker: &'a Tracker,
    popped: bool,
}

impl<'a> FrameGuard<'a> {
    fn push(tracker: &'a Tracker, frame: Option<Dependencies>) -> Self {
        tracker.frames.borrow_mut().push(frame);
        Self {
            tracker,
            popped: false,
        }
    }

    fn finish(mut self) -> Option<Dependencies> {
        self.popped = true;
        self.tracker.pop()
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if !self.popped {
            self.tracker.pop();
        }
    }
}

// ─── Free functions over the current runtime ─────────────────────────────────

/// Run `f` in a new tracking frame of the current runtime.
///
/// Only cells created in the current runtime are seen; see
/// [`Runtime::track`].
pub fn track<R>(f: impl FnOnce() -> R) -> (R, Dependencies) {
    Runtime::current().track(f)
}

/// Run `f` with tracking suspended in the current runtime.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    Runtime::current().untracked(f)
}

/// Snapshot of the active frame of the current runtime.
#[must_use]
pub fn current() -> Option<Dependencies> {
    Runtime::current().current_reads()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};

    fn node(rt: &Runtime) -> Rc<Notifier> {
        Notifier::new(rt.clone().into_inner())
    }

    #[test]
    fn records_reads_once_in_order() {
        let rt = Runtime::new();
        let tracker = rt.inner().tracker();
        let (a, b) = (node(&rt), node(&rt));

        let ((), deps) = tracker.track(|| {
            b.track_read();
            a.track_read();
            b.track_read();
        });
        assert_eq!(deps.len(), 2);
        assert_eq!(deps.ids().collect::<Vec<_>>(), vec![b.id(), a.id()]);
    }

    #[test]
    fn reads_outside_a_frame_are_dropped() {
        let rt = Runtime::new();
        let a = node(&rt);
        a.track_read();
        assert!(!rt.inner().tracker().is_tracking());
        assert_eq!(rt.inner().tracker().depth(), 0);
    }

    #[test]
    fn nested_frames_are_isolated() {
        let rt = Runtime::new();
        let tracker = rt.inner().tracker();
        let (outer, inner) = (node(&rt), node(&rt));

        let (inner_deps, outer_deps) = tracker.track(|| {
            outer.track_read();
            let ((), deps) = tracker.track(|| inner.track_read());
            deps
        });
        assert!(inner_deps.contains(inner.id()));
        assert!(!inner_deps.contains(outer.id()));
        assert!(outer_deps.contains(outer.id()));
        assert!(!outer_deps.contains(inner.id()));
    }

    #[test]
    fn untracked_suspends_the_active_frame() {
        let rt = Runtime::new();
        let tracker = rt.inner().tracker();
        let (seen, hidden) = (node(&rt), node(&rt));

        let ((), deps) = tracker.track(|| {
            seen.track_read();
            tracker.untracked(|| {
                assert!(!tracker.is_tracking());
                hidden.track_read();
            });
            assert!(tracker.is_tracking());
        });
        assert_eq!(deps.len(), 1);
        assert!(deps.contains(seen.id()));
    }

    #[test]
    fn panic_pops_the_frame() {
        let rt = Runtime::new();
        let tracker = rt.inner().tracker();
        let result: std::thread::Result<((), Dependencies)> =
            panic::catch_unwind(AssertUnwindSafe(|| {
                tracker.track(|| panic!("evaluation failed"))
            }));
        assert!(result.is_err());
        assert_eq!(tracker.depth(), 0);
        assert!(tracker.current().is_none());
    }

    #[test]
    fn current_snapshots_the_innermost_frame() {
        let rt = Runtime::new();
        let tracker = rt.inner().tracker();
        let a = node(&rt);
        assert!(tracker.current().is_none());
        tracker.track(|| {
            a.track_read();
            let snapshot = tracker.current().expect("frame active");
            assert!(snapshot.contains(a.id()));
        });
    }

    #[test]
    fn rewire_moves_listener_between_sets() {
        let rt = Runtime::new();
        let (a, b, c) = (node(&rt), node(&rt), node(&rt));
        let listener = Listener::new(|| {});

        let mut prev = Dependencies::new();
        prev.insert(&a);
        prev.insert(&b);
        rewire(&Dependencies::new(), &prev, &listener);

        let mut next = Dependencies::new();
        next.insert(&b);
        next.insert(&c);
        rewire(&prev, &next, &listener);

        assert_eq!(a.listener_count(), 0);
        assert_eq!(b.listener_count(), 1);
        assert_eq!(c.listener_count(), 1);

        detach(&next, &listener);
        assert_eq!(b.listener_count(), 0);
        assert_eq!(c.listener_count(), 0);
    }
}

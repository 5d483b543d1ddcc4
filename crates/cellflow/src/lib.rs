#![forbid(unsafe_code)]

//! Fine-grained reactive state for single-threaded applications.
//!
//! This crate provides change-tracking primitives for keeping derived values
//! and side effects consistent with mutable state:
//!
//! - [`Observable`]: a shared, version-tracked value that notifies its
//!   listeners when it changes.
//! - [`Computed`]: a lazily evaluated, memoized value derived from whatever
//!   cells its closure reads. Dependencies are discovered at run time.
//! - [`Effect`]: a closure that re-runs whenever a cell it read changes.
//! - [`Transaction`] / [`BatchScope`]: defer notifications until the
//!   outermost batch ends, delivering each changed cell once.
//! - [`Subscription`]: RAII guard that removes its listener on drop.
//!
//! # Example
//!
//! ```
//! use cellflow::{Computed, Observable, Transaction};
//!
//! let price = Observable::new(100);
//! let quantity = Observable::new(2);
//!
//! let (p, q) = (price.clone(), quantity.clone());
//! let total = Computed::new(move || p.get() * q.get());
//! assert_eq!(total.get(), 200);
//!
//! Transaction::run(|| {
//!     price.set(150);
//!     quantity.set(3);
//! });
//! assert_eq!(total.get(), 450);
//! ```
//!
//! # Architecture
//!
//! Every cell wraps an `Rc<Notifier>`, the graph node that owns the listener
//! list. A [`Runtime`] owns the tracking stack and the batch queue; cells bind
//! to the runtime that is current when they are created. Tracking never holds
//! strong references from a cell to its readers, so dropping the last handle
//! of a derived cell detaches it from its sources.
//!
//! # Invariants
//!
//! 1. Setting a value equal to the current one is a no-op: no version bump,
//!    no notifications.
//! 2. Listeners are notified in registration order, once per round.
//! 3. Inside a batch each changed cell notifies once, after the outermost
//!    batch ends.
//! 4. `Computed::get()` never returns a stale value, inside or outside a
//!    batch.
//! 5. A derived cell never stays subscribed to a source it stopped reading.
//!
//! # Failure Modes
//!
//! Panics from listeners are caught per listener so the rest of the round
//! still runs, then re-raised by the write that started the round (or
//! returned as [`ReactiveError::ListenerPanicked`] by `try_set` and
//! [`Transaction::try_run`]). Reading a computed from inside its own
//! evaluation panics with [`ReactiveError::CyclicDependency`]; use
//! [`Computed::try_get`] to observe it as an error instead. Listeners that
//! keep writing each other's cells outside a batch are stopped by
//! [`ReactiveConfig::max_notify_depth`] with
//! [`ReactiveError::NotifyDepthExceeded`], which reaches the outermost writer
//! as a listener panic.

pub mod batch;
pub mod computed;
pub mod config;
pub mod effect;
pub mod error;
pub mod notifier;
pub mod observable;
pub mod runtime;
pub mod tracker;

pub use batch::{BatchScope, Transaction, batch};
pub use computed::Computed;
pub use config::ReactiveConfig;
pub use effect::Effect;
pub use error::{ReactiveError, Result};
pub use notifier::{CellId, Listenable, Listener, Subscription};
pub use observable::Observable;
pub use runtime::Runtime;
pub use tracker::{Dependencies, current, track, untracked};

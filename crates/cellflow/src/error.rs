#![forbid(unsafe_code)]

//! Error taxonomy for the reactive core.

use thiserror::Error;

use crate::notifier::CellId;

pub type Result<T> = std::result::Result<T, ReactiveError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    #[error("use after dispose: {operation} on disposed {cell}")]
    UseAfterDispose {
        cell: CellId,
        operation: &'static str,
    },

    #[error("cyclic dependency: {cell} was read during its own evaluation")]
    CyclicDependency { cell: CellId },

    #[error("{failures} listener(s) of {cell} panicked: {message}")]
    ListenerPanicked {
        cell: CellId,
        failures: usize,
        message: String,
    },

    #[error("notification depth {depth} exceeded the limit of {limit}")]
    NotifyDepthExceeded { depth: usize, limit: usize },
}

impl ReactiveError {
    #[must_use]
    pub fn use_after_dispose(cell: CellId, operation: &'static str) -> Self {
        Self::UseAfterDispose { cell, operation }
    }

    /// Whether the error reports a programming bug in the reactive graph
    /// (cycles and runaway re-entrancy) rather than a misuse of one cell.
    #[must_use]
    pub fn is_graph_bug(&self) -> bool {
        matches!(
            self,
            Self::CyclicDependency { .. } | Self::NotifyDepthExceeded { .. }
        )
    }

    /// The cell the error is about, when there is one.
    #[must_use]
    pub fn cell(&self) -> Option<CellId> {
        match self {
            Self::UseAfterDispose { cell, .. }
            | Self::CyclicDependency { cell }
            | Self::ListenerPanicked { cell, .. } => Some(*cell),
            Self::NotifyDepthExceeded { .. } => None,
        }
    }
}

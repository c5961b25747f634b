#![forbid(unsafe_code)]

//! Error taxonomy for the reactive core.
//!
//! Most misuse in this library is a logic error (use-after-dispose, emit on
//! a disposed emitter) and fails loudly via panic at the call site. The
//! variants here cover the cases a caller can reasonably handle as values.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, ReactiveError>;

/// Errors surfaced by the reactive core.
#[derive(Debug, Error)]
pub enum ReactiveError {
    /// `set()` was called on a computed with no write callback installed.
    #[error("computed value is not writable (no write callback installed)")]
    NotWritable,

    /// `try_emit()` was called on an emitter that has been disposed.
    ///
    /// The panicking `emit()` path carries the same message; emitting after
    /// disposal always indicates a logic error upstream.
    #[error("emit on a disposed emitter")]
    EmitAfterDispose,

    /// One or more cleanup actions panicked during disposal.
    ///
    /// Disposal is never silently incomplete: every sibling action still
    /// ran, each failure was logged, and this record aggregates the count.
    #[error("{failed} of {total} cleanup actions panicked during dispose")]
    Disposal {
        /// Number of cleanup actions that panicked.
        failed: usize,
        /// Total number of cleanup actions that ran.
        total: usize,
    },
}

//! Watcher error types.
//!
//! Every error a [`Watcher`](crate::Watcher) returns is terminal for that
//! instance: nothing is retried at this layer. Reconnecting the underlying
//! watch transport is the event source's job; the consumer decides whether
//! to start a fresh watcher after a failure.

/// Boxed error for opaque transport causes.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors reported by a [`Watcher`](crate::Watcher).
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The event source could not be started; no watcher was created.
    #[error("failed to start endpoint event source")]
    Start(#[source] BoxError),

    /// `next()` was called after the watcher reached its terminal state.
    /// Watcher errors are not recoverable; do not retry `next()`.
    #[error("watcher is stopped; watcher errors are not recoverable")]
    AlreadyStopped,

    /// The watcher was closed while waiting for an event.
    #[error("watcher closed")]
    Cancelled,

    /// The underlying event stream reported an unrecoverable error.
    #[error("error reading endpoint event stream")]
    EventStream(#[source] BoxError),

    /// A delivered endpoint subset contained no ports, so no address can
    /// be resolved from the event.
    #[error("endpoint subset contains no ports")]
    NoPort,
}

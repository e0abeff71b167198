// channel and pipeline error types.

use std::{
    error::Error as StdError,
    fmt,
    sync::Arc,
};
use thiserror::Error;


// ==== base error types ====


/// Error for using a channel which has been closed
///
/// This is the normal end-of-stream condition, not a bug signal: after
/// `close`, `get` keeps succeeding until every buffered outcome and queued
/// sender has been drained, and only then starts failing with this.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("channel closed")]
pub struct ClosedError;

/// Error thrown to queued senders whose pending outcome was discarded by an
/// explicit `clear`
///
/// Distinct from [`ClosedError`] so a sender can tell "the channel is gone"
/// from "my outcome was dropped but the channel is still open".
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("channel cleared")]
pub struct ClearedError;

/// Error for calling a producer-side operation on an iterator-backed channel,
/// which has no producer side
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("{0} is not supported on an iterator-backed channel")]
pub struct UnsupportedError(pub &'static str);

/// Error for an invalid worker count passed to a pipeline operation
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("concurrency must be positive")]
pub struct ConcurrencyError;


// ==== faults ====


/// An arbitrary error traveling through a channel as data
///
/// Faults occupy buffer and sender slots exactly like values. They are
/// untyped and shared: one fault may be delivered to many receivers at once
/// (`interrupt`) or observed by every worker of a pipeline stage, so the
/// payload is reference-counted and cloning is cheap.
#[derive(Clone)]
pub struct Fault(Arc<anyhow::Error>);

impl Fault {
    /// Wrap a concrete error
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Fault(Arc::new(anyhow::Error::new(err)))
    }

    /// Construct a fault from a plain message
    pub fn msg<M>(msg: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Fault(Arc::new(anyhow::Error::msg(msg)))
    }

    /// Downcast to a concrete error type, if that is what this fault wraps
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl StdError for Fault {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        let inner: &anyhow::Error = &self.0;
        Some(inner.as_ref())
    }
}

impl From<anyhow::Error> for Fault {
    fn from(err: anyhow::Error) -> Self {
        Fault(Arc::new(err))
    }
}


// ==== compound error types ====


/// Error for sending into a channel
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendError {
    /// The channel no longer accepts new outcomes
    #[error(transparent)]
    Closed(#[from] ClosedError),
    /// The pending outcome was discarded by an explicit `clear`
    #[error(transparent)]
    Cleared(#[from] ClearedError),
}

/// Error for receiving from a channel
#[derive(Error, Debug, Clone)]
pub enum RecvError {
    /// The channel is done: closed, with nothing left to drain
    #[error(transparent)]
    Closed(#[from] ClosedError),
    /// An error outcome sent by a producer, or the fault of an `interrupt`
    #[error(transparent)]
    Fault(#[from] Fault),
}

impl RecvError {
    /// True for the normal end-of-stream condition
    pub fn is_closed(&self) -> bool {
        matches!(self, RecvError::Closed(_))
    }
}

/// Error for an aggregate pipeline operation (`for_each`, `drain`, `to_array`)
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// The requested worker count was invalid; no work was started
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
    /// The first fatal fault observed by any worker
    #[error(transparent)]
    Fault(#[from] Fault),
}

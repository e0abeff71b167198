// iterator-backed read-only channel.

use super::{
    core::Outcome,
    error::{ClosedError, Fault, RecvError, UnsupportedError},
};
use std::sync::Arc;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::{watch, Mutex};


/// A read-only channel over a lazy sequence
///
/// `get` advances the underlying sequence by exactly one element; nothing is
/// pulled until someone asks. Concurrent `get`s queue up and are served in
/// FIFO order. The adapter closes itself when the sequence is exhausted, when
/// it yields a fault (the fault is emitted first), or once the optional pull
/// limit is reached.
///
/// There is no producer side and no buffer: `push`, `throw` and `clear`
/// always fail with [`UnsupportedError`].
pub struct IterChannel<T> {
    shared: Arc<IterShared<T>>,
}

impl<T> Clone for IterChannel<T> {
    fn clone(&self) -> Self {
        IterChannel { shared: Arc::clone(&self.shared) }
    }
}

// adapter shared state.
struct IterShared<T> {
    // serializes pulls. tokio's mutex queues waiters fairly, which is what
    // gives concurrent receivers their FIFO ordering.
    source: Mutex<SourceState<T>>,
    // fulfilled exactly once, when the adapter closes.
    close_tx: watch::Sender<bool>,
    // carries the most recent interrupt fault to receivers mid-pull.
    interrupt_tx: watch::Sender<Option<Fault>>,
}

// adapter lockable state.
struct SourceState<T> {
    // the underlying sequence; None once the adapter has stopped pulling.
    stream: Option<BoxStream<'static, Outcome<T>>>,
    // remaining pulls before self-close, if limited.
    remaining: Option<usize>,
}

impl<T: Send + 'static> IterChannel<T> {
    /// Adapt a stream of outcomes
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Outcome<T>> + Send + 'static,
    {
        let (close_tx, _) = watch::channel(false);
        let (interrupt_tx, _) = watch::channel(None);
        IterChannel {
            shared: Arc::new(IterShared {
                source: Mutex::new(SourceState {
                    stream: Some(stream.boxed()),
                    remaining: None,
                }),
                close_tx,
                interrupt_tx,
            }),
        }
    }

    /// Adapt a synchronous sequence of values
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(stream::iter(iter.into_iter().map(Ok)))
    }

    /// Adapt a synchronous sequence of outcomes, so faulty elements can be
    /// staged alongside values
    pub fn from_outcomes<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Outcome<T>>,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(stream::iter(iter))
    }

    /// Cap the number of elements pulled before the adapter closes itself
    ///
    /// Must be called before the handle is cloned or read.
    pub fn limit(mut self, limit: usize) -> Self {
        let shared = Arc::get_mut(&mut self.shared)
            .expect("limit must be set before the channel is shared");
        shared.source.get_mut().remaining = Some(limit);
        self
    }
}

impl<T> IterChannel<T> {
    /// Pull the next element of the underlying sequence
    ///
    /// Fails with [`ClosedError`] once the adapter is closed, and with
    /// [`RecvError::Fault`] when the sequence yields a fault or an
    /// `interrupt` preempts the pull.
    pub async fn get(&self) -> Result<T, RecvError> {
        let mut close_rx = self.shared.close_tx.subscribe();
        let mut interrupt_rx = self.shared.interrupt_tx.subscribe();
        if *close_rx.borrow() {
            return Err(ClosedError.into());
        }

        // wait in line for the pull lock, unless closed or interrupted first
        let mut source = tokio::select! {
            source = self.shared.source.lock() => source,
            _ = close_rx.wait_for(|&closed| closed) => return Err(ClosedError.into()),
            fault = interrupted(&mut interrupt_rx) => return Err(RecvError::Fault(fault)),
        };

        if source.remaining == Some(0) || source.stream.is_none() {
            source.stream = None;
            drop(source);
            self.close_signal();
            return Err(ClosedError.into());
        }

        let next = {
            let stream = source.stream.as_mut().unwrap();
            tokio::select! {
                next = stream.next() => next,
                _ = close_rx.wait_for(|&closed| closed) => return Err(ClosedError.into()),
                fault = interrupted(&mut interrupt_rx) => return Err(RecvError::Fault(fault)),
            }
        };

        if next.is_some() {
            if let Some(remaining) = source.remaining.as_mut() {
                *remaining -= 1;
            }
        }
        match next {
            Some(Ok(value)) => {
                if source.remaining == Some(0) {
                    source.stream = None;
                    drop(source);
                    self.close_signal();
                }
                Ok(value)
            }
            Some(Err(fault)) => {
                // a faulty element ends the sequence: emit it, then close
                source.stream = None;
                drop(source);
                self.close_signal();
                Err(RecvError::Fault(fault))
            }
            None => {
                source.stream = None;
                drop(source);
                self.close_signal();
                Err(ClosedError.into())
            }
        }
    }

    /// Close the adapter
    ///
    /// Fails with [`ClosedError`] if already closed. Every queued or
    /// in-flight `get` fails promptly, even if the underlying sequence is
    /// still mid-element.
    pub fn close(&self) -> Result<(), ClosedError> {
        if *self.shared.close_tx.borrow() {
            return Err(ClosedError);
        }
        trace!("iterator channel closed");
        self.shared.close_tx.send_replace(true);
        Ok(())
    }

    /// Throw the given fault to every `get` currently waiting, queued or
    /// mid-pull
    ///
    /// The underlying sequence and the open/closed state are untouched.
    pub fn interrupt(&self, fault: impl Into<Fault>) {
        self.shared.interrupt_tx.send_replace(Some(fault.into()));
    }

    /// True once the adapter no longer pulls new elements
    pub fn is_closed(&self) -> bool {
        *self.shared.close_tx.borrow()
    }

    /// Same as `is_closed`: the adapter holds no buffer or queued senders,
    /// so closed and done coincide
    pub fn is_done(&self) -> bool {
        self.is_closed()
    }

    /// Resolve once the adapter is closed
    pub async fn on_close(&self) {
        let mut rx = self.shared.close_tx.subscribe();
        let _ = rx.wait_for(|&closed| closed).await;
    }

    /// Always fails: an iterator-backed channel has no producer side
    pub fn push(&self, _value: T) -> Result<(), UnsupportedError> {
        Err(UnsupportedError("push"))
    }

    /// Always fails: an iterator-backed channel has no producer side
    pub fn throw(&self, _fault: impl Into<Fault>) -> Result<(), UnsupportedError> {
        Err(UnsupportedError("throw"))
    }

    /// Always fails: an iterator-backed channel has no buffer to clear
    pub fn clear(&self) -> Result<(), UnsupportedError> {
        Err(UnsupportedError("clear"))
    }

    // fulfill the close signal, if this pull was the one that ended the
    // sequence.
    fn close_signal(&self) {
        if !*self.shared.close_tx.borrow() {
            trace!("iterator channel exhausted");
        }
        self.shared.close_tx.send_replace(true);
    }
}

// resolve once an interrupt fault is broadcast. never resolves spuriously:
// subscribers see only interrupts raised after they started waiting.
async fn interrupted(rx: &mut watch::Receiver<Option<Fault>>) -> Fault {
    loop {
        if rx.changed().await.is_err() {
            // the shared state is gone; let the other select arms decide
            std::future::pending::<()>().await;
        }
        if let Some(fault) = rx.borrow_and_update().clone() {
            return fault;
        }
    }
}

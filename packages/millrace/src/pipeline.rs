//! Bounded-concurrency processing stages over channels.
//!
//! A stage is a pool of workers pulling from a shared source and pushing into
//! a fresh output channel. Backpressure composes: each stage's output has its
//! own capacity, so a slow downstream stage throttles every stage above it
//! through the ordinary `push` parking of [`Channel`].
//!
//! [`transform`][Pipeline::transform] is the primitive. A user-supplied
//! worker pass is invoked repeatedly, concurrently, until the source is done;
//! each pass may consume any number of elements and emit any number of
//! elements. [`map`][Pipeline::map], [`filter`][Pipeline::filter] and the
//! draining operations are built on top of it.

use crate::channel::{
    core::Channel,
    error::{ConcurrencyError, Fault, PipelineError, RecvError, SendError},
    iter::IterChannel,
};
use std::sync::{Arc, OnceLock};
use std::future::Future;
use futures::future::{self, ready};


/// Something elements can be received from
///
/// The consuming half of [`Channel`], abstracted so pipeline stages can pull
/// from a real channel or from an [`IterChannel`] alike. Handles are cheaply
/// cloneable and every clone observes the same underlying state.
pub trait Source<T>: Clone + Send + Sync + 'static {
    /// Receive the next element, parking until one is available
    fn get(&self) -> impl Future<Output = Result<T, RecvError>> + Send;

    /// True once closed with nothing left to drain
    fn is_done(&self) -> bool;

    /// Throw the given fault to receivers currently waiting on this source
    fn interrupt(&self, fault: Fault);
}

impl<T: Send + 'static> Source<T> for Channel<T> {
    fn get(&self) -> impl Future<Output = Result<T, RecvError>> + Send {
        Channel::get(self)
    }

    fn is_done(&self) -> bool {
        Channel::is_done(self)
    }

    fn interrupt(&self, fault: Fault) {
        Channel::interrupt(self, fault);
    }
}

impl<T: Send + 'static> Source<T> for IterChannel<T> {
    fn get(&self) -> impl Future<Output = Result<T, RecvError>> + Send {
        IterChannel::get(self)
    }

    fn is_done(&self) -> bool {
        IterChannel::is_done(self)
    }

    fn interrupt(&self, fault: Fault) {
        IterChannel::interrupt(self, fault);
    }
}

/// Processing stages over any [`Source`]
///
/// Blanket-implemented, so these chain off both [`Channel`] and
/// [`IterChannel`] directly.
#[allow(async_fn_in_trait)]
pub trait Pipeline<T: Send + 'static>: Source<T> {
    /// Run a pool of `concurrency` workers over this source, emitting into a
    /// fresh channel of the given capacity
    ///
    /// Each worker repeatedly invokes `func` with a handle to this source
    /// and the output channel, until the source is done. A pass that fails
    /// with [`RecvError::Closed`] simply ends (another worker won the last
    /// element); a pass that fails with [`RecvError::Fault`] has its fault
    /// forwarded into the output as an error element. Once every worker has
    /// returned, the output is closed.
    ///
    /// A pass that neither awaits the source nor fails will be invoked again
    /// immediately, so ill-behaved passes can spin. Every pass built by the
    /// derived operations below starts with a `get`.
    fn transform<U, F, Fut>(
        &self,
        func: F,
        concurrency: usize,
        capacity: usize,
    ) -> Result<Channel<U>, ConcurrencyError>
    where
        U: Send + 'static,
        F: Fn(Self, Channel<U>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RecvError>> + Send + 'static,
    {
        if concurrency == 0 {
            return Err(ConcurrencyError);
        }
        let output = Channel::new(capacity);
        let func = Arc::new(func);
        let mut workers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let input = self.clone();
            let output = output.clone();
            let func = Arc::clone(&func);
            workers.push(async move {
                while !input.is_done() {
                    match func(input.clone(), output.clone()).await {
                        Ok(()) => (),
                        // another worker consumed the tail of the source
                        Err(RecvError::Closed(_)) => (),
                        Err(RecvError::Fault(fault)) => {
                            let _ = output.throw(fault).await;
                        }
                    }
                }
            });
        }
        tokio::spawn({
            let output = output.clone();
            async move {
                future::join_all(workers).await;
                trace!("pipeline stage complete");
                let _ = output.close(false);
            }
        });
        Ok(output)
    }

    /// Map each element, one handler per kind
    ///
    /// `on_value` maps a value to a new value, `on_error` maps a fault to a
    /// recovery value. Either handler may itself fail, turning the element
    /// into an error element of the output.
    fn map<U, FV, VFut, FE, EFut>(
        &self,
        on_value: FV,
        on_error: FE,
        concurrency: usize,
        capacity: usize,
    ) -> Result<Channel<U>, ConcurrencyError>
    where
        U: Send + 'static,
        FV: Fn(T) -> VFut + Send + Sync + 'static,
        VFut: Future<Output = Result<U, Fault>> + Send + 'static,
        FE: Fn(Fault) -> EFut + Send + Sync + 'static,
        EFut: Future<Output = Result<U, Fault>> + Send + 'static,
    {
        let on_value = Arc::new(on_value);
        let on_error = Arc::new(on_error);
        self.transform(
            move |input: Self, output: Channel<U>| {
                let on_value = Arc::clone(&on_value);
                let on_error = Arc::clone(&on_error);
                async move {
                    let mapped = match input.get().await {
                        Ok(value) => on_value(value).await,
                        Err(RecvError::Fault(fault)) => on_error(fault).await,
                        Err(closed) => return Err(closed),
                    };
                    match mapped {
                        Ok(value) => {
                            output.push(value).await.map_err(push_failed)?;
                            Ok(())
                        }
                        Err(fault) => Err(RecvError::Fault(fault)),
                    }
                }
            },
            concurrency,
            capacity,
        )
    }

    /// Map values, passing error elements through untouched
    fn map_values<U, FV, VFut>(
        &self,
        on_value: FV,
        concurrency: usize,
        capacity: usize,
    ) -> Result<Channel<U>, ConcurrencyError>
    where
        U: Send + 'static,
        FV: Fn(T) -> VFut + Send + Sync + 'static,
        VFut: Future<Output = Result<U, Fault>> + Send + 'static,
    {
        self.map(on_value, |fault| ready(Err(fault)), concurrency, capacity)
    }

    /// Map error elements into recovery values, passing values through
    /// untouched
    fn map_faults<FE, EFut>(
        &self,
        on_error: FE,
        concurrency: usize,
        capacity: usize,
    ) -> Result<Channel<T>, ConcurrencyError>
    where
        FE: Fn(Fault) -> EFut + Send + Sync + 'static,
        EFut: Future<Output = Result<T, Fault>> + Send + 'static,
    {
        self.map(|value| ready(Ok(value)), on_error, concurrency, capacity)
    }

    /// Keep the elements the predicates accept, one predicate per kind
    ///
    /// Accepted elements are forwarded as-is. A predicate that fails turns
    /// the element into an error element of the output.
    fn filter<FV, VFut, FE, EFut>(
        &self,
        on_value: FV,
        on_error: FE,
        concurrency: usize,
        capacity: usize,
    ) -> Result<Channel<T>, ConcurrencyError>
    where
        FV: Fn(&T) -> VFut + Send + Sync + 'static,
        VFut: Future<Output = Result<bool, Fault>> + Send + 'static,
        FE: Fn(&Fault) -> EFut + Send + Sync + 'static,
        EFut: Future<Output = Result<bool, Fault>> + Send + 'static,
    {
        let on_value = Arc::new(on_value);
        let on_error = Arc::new(on_error);
        self.transform(
            move |input: Self, output: Channel<T>| {
                let on_value = Arc::clone(&on_value);
                let on_error = Arc::clone(&on_error);
                async move {
                    match input.get().await {
                        Ok(value) => {
                            if on_value(&value).await.map_err(RecvError::Fault)? {
                                output.push(value).await.map_err(push_failed)?;
                            }
                        }
                        Err(RecvError::Fault(fault)) => {
                            if on_error(&fault).await.map_err(RecvError::Fault)? {
                                output.throw(fault).await.map_err(push_failed)?;
                            }
                        }
                        Err(closed) => return Err(closed),
                    }
                    Ok(())
                }
            },
            concurrency,
            capacity,
        )
    }

    /// Keep the values the predicate accepts, passing error elements through
    /// untouched
    fn filter_values<FV, VFut>(
        &self,
        on_value: FV,
        concurrency: usize,
        capacity: usize,
    ) -> Result<Channel<T>, ConcurrencyError>
    where
        FV: Fn(&T) -> VFut + Send + Sync + 'static,
        VFut: Future<Output = Result<bool, Fault>> + Send + 'static,
    {
        self.filter(
            on_value,
            |_fault| ready(Ok(true)),
            concurrency,
            capacity,
        )
    }

    /// Drain this source through a pool of `concurrency` workers, resolving
    /// once it is done or a handler fails
    ///
    /// A handler failure is fatal: the fault is recorded, waiting sibling
    /// workers are woken through `interrupt`, and no worker starts another
    /// element. Elements already being handled by siblings finish first, and
    /// elements not yet pulled stay in the source, so a caller can resume
    /// a partially drained channel after an error.
    async fn for_each<FV, VFut, FE, EFut>(
        &self,
        on_value: FV,
        on_error: FE,
        concurrency: usize,
    ) -> Result<(), PipelineError>
    where
        FV: Fn(T) -> VFut + Sync,
        VFut: Future<Output = Result<(), Fault>> + Send,
        FE: Fn(Fault) -> EFut + Sync,
        EFut: Future<Output = Result<(), Fault>> + Send,
    {
        if concurrency == 0 {
            return Err(ConcurrencyError.into());
        }
        let fatal = OnceLock::new();
        let workers = (0..concurrency)
            .map(|_| drain_worker(self.clone(), &on_value, &on_error, &fatal));
        future::join_all(workers).await;
        match fatal.into_inner() {
            Some(fault) => Err(PipelineError::Fault(fault)),
            None => Ok(()),
        }
    }

    /// Drain this source, treating any error element as fatal
    async fn drain(&self, concurrency: usize) -> Result<(), PipelineError> {
        self.for_each(
            |_value| ready(Ok(())),
            |fault| ready(Err(fault)),
            concurrency,
        )
        .await
    }

    /// Collect every remaining value into a vec, in channel order
    ///
    /// Fails on the first error element, leaving anything after it in the
    /// source.
    async fn to_array(&self) -> Result<Vec<T>, PipelineError> {
        let values = std::sync::Mutex::new(Vec::new());
        self.for_each(
            |value| {
                values.lock().unwrap().push(value);
                ready(Ok(()))
            },
            |fault| ready(Err(fault)),
            1,
        )
        .await?;
        Ok(values.into_inner().unwrap())
    }
}

impl<T: Send + 'static, S: Source<T>> Pipeline<T> for S {}

// a failed forward ends the worker pass. a closed output reads like a closed
// input; a cleared output surfaces as a fault.
fn push_failed(err: SendError) -> RecvError {
    match err {
        SendError::Closed(err) => RecvError::Closed(err),
        SendError::Cleared(err) => RecvError::Fault(Fault::new(err)),
    }
}

// one worker of a for_each pool. stops when the source is done or any worker
// of the pool has recorded a fatal fault.
async fn drain_worker<T, S, FV, VFut, FE, EFut>(
    source: S,
    on_value: &FV,
    on_error: &FE,
    fatal: &OnceLock<Fault>,
) where
    T: Send + 'static,
    S: Source<T>,
    FV: Fn(T) -> VFut,
    VFut: Future<Output = Result<(), Fault>>,
    FE: Fn(Fault) -> EFut,
    EFut: Future<Output = Result<(), Fault>>,
{
    while !source.is_done() {
        if fatal.get().is_some() {
            return;
        }
        let handled = match source.get().await {
            Ok(value) => on_value(value).await,
            Err(RecvError::Fault(fault)) => {
                // may be the interrupt of a sibling's fatal fault
                if fatal.get().is_some() {
                    return;
                }
                on_error(fault).await
            }
            Err(RecvError::Closed(_)) => continue,
        };
        if let Err(fault) = handled {
            if fatal.set(fault.clone()).is_ok() {
                debug!(%fault, "handler failed, stopping drain");
                source.interrupt(fault);
            }
            return;
        }
    }
}

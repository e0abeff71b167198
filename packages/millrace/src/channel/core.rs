// channel state and operations.
//
// a `Channel` is a cheap cloneable handle over shared state. every internal
// queue lives behind one mutex, so each operation is a single atomic step over
// the buffer/senders/receivers/closed tuple and the ordering invariants hold
// under true parallelism. the mutex is never held across an await: blocked
// senders and receivers park a oneshot hand-off slot inside the lock and
// await it outside.

use super::error::{ClearedError, ClosedError, Fault, RecvError, SendError};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};
use futures::stream::Stream;
use tokio::sync::{oneshot, watch};


/// An outcome traveling through a channel: a value or a fault
///
/// Buffering, backpressure and FIFO ordering treat both cases identically.
pub type Outcome<T> = Result<T, Fault>;

/// A bounded FIFO queue for exchanging outcomes between concurrent tasks
///
/// The buffer capacity is fixed at construction. A capacity of zero means no
/// buffering at all: every send waits for a matching `get`. When the buffer
/// is full and no receiver is waiting, senders queue up and block, in order,
/// until a receiver drains an outcome (backpressure).
///
/// A channel is closed exactly once. Closing stops new sends but does not
/// discard anything: outcomes already buffered or held by queued senders stay
/// available to `get` until the channel is drained, at which point it is
/// *done* and `get` fails with [`ClosedError`]. `clear` is the separate,
/// resumable operation that discards buffered outcomes without closing, and
/// `interrupt` force-wakes currently blocked receivers without touching any
/// other state.
///
/// Handles are cheap to clone; any number of tasks may send and receive
/// concurrently. Outcomes are delivered to receivers in exactly the order
/// they were accepted from senders.
///
/// Dropping a pending `push`/`throw` future withdraws its outcome; dropping a
/// pending `get` future gives up its place in the receiver queue. Neither has
/// any other effect on channel state.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel { shared: Arc::clone(&self.shared) }
    }
}

// channel shared state.
struct Shared<T> {
    // buffer capacity, fixed at construction.
    capacity: usize,
    // mutex around lockable state.
    lockable: Mutex<Lockable<T>>,
    // fulfilled exactly once, when `closed` flips to true.
    close_tx: watch::Sender<bool>,
}

// channel lockable state.
//
// invariants, preserved by every operation:
//
// - receivers non-empty implies buffer and senders are empty.
// - senders non-empty implies buffer is full and receivers are empty.
// - buffer.len() <= capacity.
// - closed never reverts to false, and nothing enters buffer or senders
//   after it is set.
struct Lockable<T> {
    buffer: VecDeque<Outcome<T>>,
    senders: VecDeque<WaitingSend<T>>,
    receivers: VecDeque<WaitingRecv<T>>,
    closed: bool,
}

// a producer blocked because the buffer is full and no receiver is waiting.
struct WaitingSend<T> {
    outcome: Outcome<T>,
    accepted: oneshot::Sender<Result<(), SendError>>,
}

// a consumer blocked because no outcome is available. loaded with Ok at
// hand-off, or Err by close/interrupt.
type WaitingRecv<T> = oneshot::Sender<Result<Outcome<T>, RecvError>>;

impl<T> Channel<T> {
    /// Create an open, empty channel with the given buffer capacity
    pub fn new(capacity: usize) -> Self {
        let (close_tx, _) = watch::channel(false);
        Channel {
            shared: Arc::new(Shared {
                capacity,
                lockable: Mutex::new(Lockable {
                    buffer: VecDeque::new(),
                    senders: VecDeque::new(),
                    receivers: VecDeque::new(),
                    closed: false,
                }),
                close_tx,
            }),
        }
    }

    /// Create a closed channel pre-loaded with the given values, with
    /// capacity equal to their count
    pub fn of<I>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        Self::of_outcomes(values.into_iter().map(Ok))
    }

    /// Create a closed channel pre-loaded with the given outcomes, so error
    /// elements can be staged alongside values
    pub fn of_outcomes<I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = Outcome<T>>,
    {
        let buffer: VecDeque<Outcome<T>> = outcomes.into_iter().collect();
        let chan = Channel::new(buffer.len());
        {
            let mut lock = chan.shared.lockable.lock().unwrap();
            lock.buffer = buffer;
            lock.closed = true;
        }
        chan.shared.close_tx.send_replace(true);
        chan
    }

    /// Send a value, waiting until a receiver or a free buffer slot accepts it
    pub async fn push(&self, value: T) -> Result<(), SendError> {
        self.send(Ok(value)).await
    }

    /// Send a fault
    ///
    /// Faults are subject to the same buffering and backpressure rules as
    /// values.
    pub async fn throw(&self, fault: impl Into<Fault>) -> Result<(), SendError> {
        self.send(Err(fault.into())).await
    }

    /// Send an outcome, waiting until it is accepted
    ///
    /// A waiting receiver takes the outcome directly; otherwise it is
    /// buffered if there is room; otherwise the send parks until a `get`
    /// drains it or `close(true)`/`clear` rejects it.
    pub async fn send(&self, outcome: Outcome<T>) -> Result<(), SendError> {
        let parked = {
            let mut lock = self.shared.lockable.lock().unwrap();
            if lock.closed {
                return Err(ClosedError.into());
            }
            let mut outcome = outcome;
            // a waiting receiver is always served before anything is buffered
            while let Some(slot) = lock.receivers.pop_front() {
                match slot.send(Ok(outcome)) {
                    Ok(()) => return Ok(()),
                    // that receiver gave up waiting; offer it to the next one
                    Err(Ok(returned)) => outcome = returned,
                    Err(Err(_)) => unreachable!("hand-off slots are loaded with outcomes only"),
                }
            }
            if lock.buffer.len() < self.shared.capacity {
                lock.buffer.push_back(outcome);
                return Ok(());
            }
            let (accepted, parked) = oneshot::channel();
            lock.senders.push_back(WaitingSend { outcome, accepted });
            parked
        };
        match parked.await {
            Ok(result) => result,
            // every rejection path loads an explicit error before dropping
            // the slot; a bare drop means the shared state itself went away
            Err(_) => Err(ClosedError.into()),
        }
    }

    /// Wait for the next outcome, in FIFO order
    ///
    /// Keeps draining buffered outcomes and queued senders after `close`;
    /// fails with [`ClosedError`] only once the channel is done. An error
    /// outcome or an `interrupt` surfaces as [`RecvError::Fault`].
    pub async fn get(&self) -> Result<T, RecvError> {
        let parked = {
            let mut lock = self.shared.lockable.lock().unwrap();
            if let Some(outcome) = lock.buffer.pop_front() {
                // shift backpressure forward by one slot: the oldest queued
                // sender moves into the space this pop just freed
                if lock.buffer.len() < self.shared.capacity {
                    if let Some(next) = accept_sender(&mut lock.senders) {
                        lock.buffer.push_back(next);
                    }
                }
                return deliver(outcome);
            }
            if let Some(outcome) = accept_sender(&mut lock.senders) {
                return deliver(outcome);
            }
            if lock.closed {
                return Err(ClosedError.into());
            }
            let (slot, parked) = oneshot::channel();
            lock.receivers.push_back(slot);
            parked
        };
        match parked.await {
            Ok(Ok(outcome)) => deliver(outcome),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ClosedError.into()),
        }
    }

    /// Close the channel
    ///
    /// Fails with [`ClosedError`] if already closed. Stops new sends, rejects
    /// every waiting receiver, and fulfills the close signal. Buffered
    /// outcomes and queued senders survive and remain available to `get`
    /// unless `clear` is passed, in which case queued senders are rejected
    /// with [`ClosedError`] and the buffer is discarded.
    pub fn close(&self, clear: bool) -> Result<(), ClosedError> {
        {
            let mut lock = self.shared.lockable.lock().unwrap();
            if lock.closed {
                return Err(ClosedError);
            }
            lock.closed = true;
            if clear {
                for waiting in lock.senders.drain(..) {
                    let _ = waiting.accepted.send(Err(ClosedError.into()));
                }
                lock.buffer.clear();
            }
            // receivers cannot wait past a close
            for slot in lock.receivers.drain(..) {
                let _ = slot.send(Err(ClosedError.into()));
            }
        }
        trace!(clear, "channel closed");
        self.shared.close_tx.send_replace(true);
        Ok(())
    }

    /// Discard all buffered outcomes, returning them
    ///
    /// Queued senders are rejected with [`ClearedError`]. Does not close the
    /// channel: subsequent sends and receives proceed normally.
    pub fn clear(&self) -> Vec<Outcome<T>> {
        let cleared = {
            let mut lock = self.shared.lockable.lock().unwrap();
            for waiting in lock.senders.drain(..) {
                let _ = waiting.accepted.send(Err(ClearedError.into()));
            }
            lock.buffer.drain(..).collect()
        };
        trace!("channel cleared");
        cleared
    }

    /// Throw the given fault to every receiver currently blocked in `get`
    ///
    /// Buffered outcomes, queued senders and the open/closed state are
    /// untouched; later receivers are unaffected.
    pub fn interrupt(&self, fault: impl Into<Fault>) {
        let fault = fault.into();
        let mut lock = self.shared.lockable.lock().unwrap();
        for slot in lock.receivers.drain(..) {
            let _ = slot.send(Err(RecvError::Fault(fault.clone())));
        }
    }

    /// The buffer capacity fixed at construction
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// The number of outcomes currently buffered
    pub fn buffer_len(&self) -> usize {
        self.shared.lockable.lock().unwrap().buffer.len()
    }

    /// True once the channel no longer accepts new outcomes
    pub fn is_closed(&self) -> bool {
        self.shared.lockable.lock().unwrap().closed
    }

    /// True once the channel is closed and fully drained: no buffered
    /// outcomes and no queued senders remain
    ///
    /// This is the terminal state; from here every `get` fails with
    /// [`ClosedError`].
    pub fn is_done(&self) -> bool {
        let lock = self.shared.lockable.lock().unwrap();
        lock.closed && lock.buffer.is_empty() && lock.senders.is_empty()
    }

    /// Resolve once the channel is closed
    ///
    /// Resolves immediately if it already is.
    pub async fn on_close(&self) {
        let mut rx = self.shared.close_tx.subscribe();
        let _ = rx.wait_for(|&closed| closed).await;
    }

    /// Lazy, single-pass iteration over the channel
    ///
    /// Yields outcomes until the channel is done; a plain close ends the
    /// stream silently, while a fault is yielded as its final item.
    pub fn stream(&self) -> impl Stream<Item = Outcome<T>> {
        let chan = self.clone();
        futures::stream::unfold((chan, false), |(chan, stopped)| async move {
            if stopped || chan.is_done() {
                return None;
            }
            match chan.get().await {
                Ok(value) => Some((Ok(value), (chan, false))),
                Err(RecvError::Closed(_)) => None,
                Err(RecvError::Fault(fault)) => Some((Err(fault), (chan, true))),
            }
        })
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Channel::new(0)
    }
}

impl<T> FromIterator<T> for Channel<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Channel::of(iter)
    }
}

// pop queued senders until one is still waiting to be accepted, and take its
// outcome. a send whose future was dropped withdrew its outcome with it.
fn accept_sender<T>(senders: &mut VecDeque<WaitingSend<T>>) -> Option<Outcome<T>> {
    while let Some(WaitingSend { outcome, accepted }) = senders.pop_front() {
        if accepted.send(Ok(())).is_ok() {
            return Some(outcome);
        }
    }
    None
}

fn deliver<T>(outcome: Outcome<T>) -> Result<T, RecvError> {
    outcome.map_err(RecvError::Fault)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::error::{ClearedError, ClosedError};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn holds_up_to_capacity() {
        let chan = Channel::new(3);

        chan.push(1).await.unwrap();
        chan.push(2).await.unwrap();
        chan.push(3).await.unwrap();
        assert_eq!(chan.buffer_len(), 3);

        let blocked = tokio::spawn({
            let chan = chan.clone();
            async move { chan.push(4).await }
        });
        sleep(Duration::from_millis(10)).await;
        assert!(!blocked.is_finished());

        // one get frees one slot, which unblocks exactly one sender
        assert_eq!(chan.get().await.unwrap(), 1);
        blocked.await.unwrap().unwrap();
        assert_eq!(chan.buffer_len(), 3);

        assert_eq!(chan.get().await.unwrap(), 2);
        assert_eq!(chan.get().await.unwrap(), 3);
        assert_eq!(chan.get().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn does_not_buffer_when_receiver_waits() {
        let chan = Channel::new(3);

        let pending = tokio::spawn({
            let chan = chan.clone();
            async move { chan.get().await }
        });
        sleep(Duration::from_millis(10)).await;

        chan.push(2).await.unwrap();
        assert_eq!(chan.buffer_len(), 0);
        assert_eq!(pending.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn holds_outcomes_after_close() {
        let chan = Channel::new(3);

        let mut sends = Vec::new();
        for i in 0..5 {
            sends.push(tokio::spawn({
                let chan = chan.clone();
                async move { chan.push(i).await }
            }));
            sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(chan.buffer_len(), 3);

        chan.close(false).unwrap();
        assert!(chan.is_closed());
        assert!(!chan.is_done());
        assert_eq!(chan.buffer_len(), 3);

        for i in 0..5 {
            assert_eq!(chan.get().await.unwrap(), i);
        }
        for send in sends {
            send.await.unwrap().unwrap();
        }
        assert!(chan.is_done());
        assert!(matches!(chan.get().await, Err(RecvError::Closed(_))));
    }

    #[tokio::test]
    async fn close_clear_discards_everything() {
        let chan = Channel::new(3);

        let mut sends = Vec::new();
        for i in 0..5 {
            sends.push(tokio::spawn({
                let chan = chan.clone();
                async move { chan.push(i).await }
            }));
            sleep(Duration::from_millis(1)).await;
        }

        chan.close(true).unwrap();
        assert!(chan.is_closed());
        assert!(chan.is_done());
        assert_eq!(chan.buffer_len(), 0);

        for (i, send) in sends.into_iter().enumerate() {
            let result = send.await.unwrap();
            if i < 3 {
                result.unwrap();
            } else {
                assert!(matches!(result, Err(SendError::Closed(_))));
            }
        }

        assert!(matches!(chan.push(9).await, Err(SendError::Closed(_))));
        assert!(matches!(chan.get().await, Err(RecvError::Closed(_))));
        assert_eq!(chan.close(false), Err(ClosedError));
    }

    #[tokio::test]
    async fn clear_leaves_channel_open() {
        let chan = Channel::new(3);

        let mut sends = Vec::new();
        for i in 0..5 {
            sends.push(tokio::spawn({
                let chan = chan.clone();
                async move { chan.push(i).await }
            }));
            sleep(Duration::from_millis(1)).await;
        }

        let cleared = chan.clear();
        assert_eq!(cleared.len(), 3);
        assert_eq!(chan.buffer_len(), 0);
        assert!(!chan.is_closed());

        for (i, send) in sends.into_iter().enumerate() {
            let result = send.await.unwrap();
            if i < 3 {
                result.unwrap();
            } else {
                assert!(matches!(result, Err(SendError::Cleared(ClearedError))));
            }
        }

        // still usable afterwards
        let pending = tokio::spawn({
            let chan = chan.clone();
            async move { chan.get().await }
        });
        sleep(Duration::from_millis(10)).await;
        chan.push(9).await.unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn buffers_faults_like_values() {
        let chan = Channel::<i32>::new(3);

        let mut sends = Vec::new();
        for i in 0..5 {
            sends.push(tokio::spawn({
                let chan = chan.clone();
                async move { chan.throw(Fault::msg(format!("{i}"))).await }
            }));
            sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(chan.buffer_len(), 3);

        for i in 0..5 {
            match chan.get().await {
                Err(RecvError::Fault(fault)) => assert_eq!(fault.to_string(), format!("{i}")),
                other => panic!("expected a fault, got {other:?}"),
            }
        }
        for send in sends {
            send.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn interrupt_wakes_waiting_receivers() {
        let chan = Channel::new(0);

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                tokio::spawn({
                    let chan = chan.clone();
                    async move { chan.get().await }
                })
            })
            .collect();
        sleep(Duration::from_millis(10)).await;

        chan.interrupt(Fault::msg("wake up"));
        for waiter in waiters {
            match waiter.await.unwrap() {
                Err(RecvError::Fault(fault)) => assert_eq!(fault.to_string(), "wake up"),
                other => panic!("expected the interrupt fault, got {other:?}"),
            }
        }

        // interrupt does not close or clear anything
        assert!(!chan.is_closed());
        let pending = tokio::spawn({
            let chan = chan.clone();
            async move { chan.get().await }
        });
        sleep(Duration::from_millis(10)).await;
        chan.push(1).await.unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn close_rejects_waiting_receivers() {
        let chan = Channel::<i32>::new(0);

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                tokio::spawn({
                    let chan = chan.clone();
                    async move { chan.get().await }
                })
            })
            .collect();
        sleep(Duration::from_millis(10)).await;

        chan.close(false).unwrap();
        for waiter in waiters {
            assert!(matches!(waiter.await.unwrap(), Err(RecvError::Closed(_))));
        }
    }

    #[tokio::test]
    async fn of_preloads_and_closes() {
        let chan = Channel::of([1, 2, 3]);
        assert_eq!(chan.capacity(), 3);
        assert!(chan.is_closed());
        assert!(!chan.is_done());

        for i in 1..=3 {
            assert_eq!(chan.get().await.unwrap(), i);
        }
        assert!(chan.is_done());
        // terminal state is sticky
        assert!(matches!(chan.get().await, Err(RecvError::Closed(_))));
        assert!(matches!(chan.get().await, Err(RecvError::Closed(_))));
    }

    #[tokio::test]
    async fn on_close_observes_past_and_future_closes() {
        let chan = Channel::<i32>::new(0);

        let waiting = tokio::spawn({
            let chan = chan.clone();
            async move { chan.on_close().await }
        });
        sleep(Duration::from_millis(10)).await;
        assert!(!waiting.is_finished());

        chan.close(false).unwrap();
        waiting.await.unwrap();

        // already-closed resolves immediately
        chan.on_close().await;
    }

    #[tokio::test]
    async fn stream_stops_at_first_fault() {
        let chan = Channel::<i32>::new(0);

        for i in 0..4 {
            tokio::spawn({
                let chan = chan.clone();
                async move { chan.push(i).await }
            });
            sleep(Duration::from_millis(1)).await;
        }
        tokio::spawn({
            let chan = chan.clone();
            async move { chan.throw(Fault::msg("4")).await }
        });
        sleep(Duration::from_millis(1)).await;
        tokio::spawn({
            let chan = chan.clone();
            async move { chan.push(5).await }
        });
        sleep(Duration::from_millis(1)).await;

        let collected: Vec<Outcome<i32>> = chan.stream().collect().await;
        assert_eq!(collected.len(), 5);
        for (i, outcome) in collected.iter().take(4).enumerate() {
            assert_eq!(*outcome.as_ref().unwrap(), i as i32);
        }
        assert!(collected[4].is_err());

        // the element after the fault is still there
        assert_eq!(chan.get().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn fifo_order_under_random_interleaving() {
        use rand::Rng;
        use rand_pcg::Pcg64;
        use rand::SeedableRng;

        let chan = Channel::new(4);
        let producer = tokio::spawn({
            let chan = chan.clone();
            async move {
                let mut rng = Pcg64::seed_from_u64(0x5eed);
                for i in 0..500u32 {
                    chan.push(i).await.unwrap();
                    if rng.gen_bool(0.2) {
                        sleep(Duration::from_micros(rng.gen_range(1..200))).await;
                    }
                }
                chan.close(false).unwrap();
            }
        });

        let mut rng = Pcg64::seed_from_u64(0xfeed);
        for i in 0..500u32 {
            assert_eq!(chan.get().await.unwrap(), i);
            if rng.gen_bool(0.2) {
                sleep(Duration::from_micros(rng.gen_range(1..200))).await;
            }
        }
        producer.await.unwrap();
        assert!(chan.is_done());
    }
}

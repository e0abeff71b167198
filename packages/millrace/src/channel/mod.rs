// implementation of the millrace channel.
//
// channel handles wrap around Arc<shared state>:
//
//      Channel<T> ----> Shared<T>
//                          |
//                          |------ a Mutex<Lockable<T>> holding the buffer of outcomes, the
//                          |       queue of parked senders, and the queue of parked receivers.
//                          |       every operation takes the lock, mutates, and releases it
//                          |       before awaiting anything. parked operations are represented
//                          |       as oneshot slots that the peer fulfills under the lock, so
//                          |       ordering and fairness fall out of the queues being FIFO.
//                          |
//                          \------ a watch::Sender<bool> that is flipped exactly once, when
//                                  the channel closes. on_close subscribes to it.
//
// the iterator-backed adapter in the iter module is a separate type with the same receiving
// surface. it has no buffer or producer side; a tokio Mutex around the underlying stream
// serializes pulls and queues concurrent receivers fairly.
//
// the organization of these modules is as such:
//
//      error: the base and compound error types, and the Fault payload.
//
//      core: Channel itself, both halves.
//
//      iter: IterChannel, the read-only adapter over a stream or iterator.

pub(crate) mod error;
pub(crate) mod core;
pub(crate) mod iter;

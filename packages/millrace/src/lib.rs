//! Async channels that carry errors as data, and bounded-concurrency
//! pipelines built on them.
//!
//! A [`Channel`] is a bounded multi-producer multi-consumer queue of
//! _outcomes_: each element is either a value or a [`Fault`][error::Fault].
//! Producers park when the buffer is full, receivers park when it is empty,
//! and both queues are strictly FIFO. A channel can be closed (no new
//! elements, the backlog stays drainable), cleared (the backlog is discarded
//! and handed back), or interrupted (every parked receiver is thrown a
//! fault without disturbing the channel's state).
//!
//! The [`Pipeline`] extension trait turns any source of outcomes into a
//! processing stage: a fixed-size pool of workers pulls elements, runs an
//! async handler on each, and pushes results into a fresh bounded channel,
//! so backpressure propagates through arbitrarily long chains of stages.
//!
//! ```
//! use millrace::{Channel, Pipeline};
//! use futures::future::ready;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let chan = Channel::of(1..=5);
//! let squares = chan
//!     .map_values(|n| ready(Ok(n * n)), 2, 0)
//!     .unwrap();
//! let mut out = squares.to_array().await.unwrap();
//! out.sort();
//! assert_eq!(out, vec![1, 4, 9, 16, 25]);
//! # }
//! ```
//!
//! [`IterChannel`] adapts an iterator or stream into the read-only half of
//! the same interface, pulling elements lazily one `get` at a time.

#[macro_use]
extern crate tracing;

mod channel;
mod pipeline;

pub use crate::channel::core::{Channel, Outcome};
pub use crate::channel::iter::IterChannel;
pub use crate::pipeline::{Pipeline, Source};

/// Error types
pub mod error {
    pub use crate::channel::error::*;
}

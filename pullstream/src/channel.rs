//! # Channels
//!
//! A bounded, closable, multi-producer single-consumer queue whose consumer
//! side is a [`Stream`].
//!
//! ## Design
//!
//! All state lives in one [`Ref`]:
//!
//! - `values`: the buffer, at most `capacity` elements
//! - `producers`: senders parked because the buffer was full, each with its
//!   value and a wake-up signal
//! - `waiting`: the consumer's wake-up signal while it waits on an empty
//!   channel
//!
//! The consumer takes the whole buffer *and* every parked producer's value in
//! one atomic step, emits them as one chunk, and wakes those producers. A
//! capacity of `0` therefore gives a synchronous hand-off: every send parks
//! until the consumer admits it.
//!
//! Closing rejects further sends but lets the consumer drain what is left,
//! including parked producers.

use std::fmt;

use tracing::trace;

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::pull::{Element, Pull};
use crate::stream::Stream;
use crate::sync::{Deferred, Ref};
use crate::token::Token;

struct Parked<O> {
    id: Token,
    value: O,
    signal: Deferred<()>,
}

struct State<O> {
    values: Vec<O>,
    waiting: Option<Deferred<()>>,
    producers: Vec<Parked<O>>,
    closed: bool,
}

enum Offer {
    Accepted(Option<Deferred<()>>),
    Parked(Option<Deferred<()>>),
    Closed,
}

enum Batch<O> {
    Ready(Chunk<O>, Vec<Deferred<()>>),
    Wait,
    Closed,
}

/// A closable queue with backpressure.
///
/// Cloning a channel shares it. Any number of handles may send; only one
/// [`Channel::stream`] should be consuming at a time.
pub struct Channel<O> {
    id: Token,
    capacity: usize,
    state: Ref<State<O>>,
    closed: Deferred<()>,
}

impl<O> Clone for Channel<O> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            capacity: self.capacity,
            state: self.state.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<O: Element> Channel<O> {
    /// A channel buffering up to `capacity` elements.
    ///
    /// A capacity of `0` makes every send wait for the consumer.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            id: Token::new(),
            capacity,
            state: Ref::new(State {
                values: Vec::new(),
                waiting: None,
                producers: Vec::new(),
                closed: false,
            }),
            closed: Deferred::new(),
        }
    }

    /// A channel whose sends never wait.
    pub fn unbounded() -> Self {
        Self::bounded(usize::MAX)
    }

    /// A channel where every send waits for the consumer.
    pub fn synchronous() -> Self {
        Self::bounded(0)
    }

    /// The buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sends `value`, waiting while the buffer is full.
    ///
    /// Fails with [`Error::ChannelClosed`] if the channel is closed. Dropping
    /// the returned future while it waits withdraws the value.
    pub async fn send(&self, value: O) -> Result<()> {
        let id = Token::new();
        let signal = Deferred::new();
        let capacity = self.capacity;
        let offer = self.state.modify(|s| {
            if s.closed {
                Offer::Closed
            } else if s.values.len() < capacity {
                s.values.push(value);
                Offer::Accepted(s.waiting.take())
            } else {
                s.producers.push(Parked {
                    id,
                    value,
                    signal: signal.clone(),
                });
                Offer::Parked(s.waiting.take())
            }
        });

        match offer {
            Offer::Closed => Err(Error::ChannelClosed),
            Offer::Accepted(waiting) => {
                notify(waiting);
                Ok(())
            }
            Offer::Parked(waiting) => {
                notify(waiting);
                let mut guard = Withdraw {
                    state: self.state.clone(),
                    id,
                    armed: true,
                };
                signal.get().await;
                guard.armed = false;
                Ok(())
            }
        }
    }

    /// Sends `value` if the buffer has room.
    ///
    /// Returns `Ok(false)` when the buffer is full.
    pub fn try_send(&self, value: O) -> Result<bool> {
        let capacity = self.capacity;
        let offer = self.state.modify(|s| {
            if s.closed {
                Err(Error::ChannelClosed)
            } else if s.values.len() < capacity {
                s.values.push(value);
                Ok(Some(s.waiting.take()))
            } else {
                Ok(None)
            }
        })?;
        match offer {
            Some(waiting) => {
                notify(waiting);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Closes the channel.
    ///
    /// Returns `true` if this call closed it. Pending elements can still be
    /// received.
    pub fn close(&self) -> bool {
        let closed_now = self.state.modify(|s| {
            if s.closed {
                None
            } else {
                s.closed = true;
                Some(s.waiting.take())
            }
        });
        match closed_now {
            Some(waiting) => {
                notify(waiting);
                self.closed.complete(());
                trace!(channel = %self.id, "channel closed");
                true
            }
            None => false,
        }
    }

    /// Returns `true` once the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.modify(|s| s.closed)
    }

    /// Resolves once the channel has been closed.
    pub async fn closed(&self) {
        self.closed.get().await
    }

    /// Number of elements waiting to be received, parked producers included.
    pub fn len(&self) -> usize {
        self.state.modify(|s| s.values.len() + s.producers.len())
    }

    /// Returns `true` if nothing is waiting to be received.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The consumer side: every element sent, in chunks, until the channel is
    /// closed and drained.
    pub fn stream(&self) -> Stream<O> {
        Stream::from_pull(self.clone().consume())
    }

    fn consume(self) -> Pull<O, ()> {
        let source = self.clone();
        Pull::eval(async move { source.next_batch().await }).flat_map(move |batch| match batch {
            None => Pull::done(),
            Some(chunk) => Pull::output(chunk).then(Pull::defer(move || self.consume())),
        })
    }

    /// Takes everything available, waiting while the channel is empty.
    ///
    /// `None` means closed and drained.
    async fn next_batch(&self) -> Result<Option<Chunk<O>>> {
        loop {
            let waiter = Deferred::new();
            let batch = self.state.modify(|s| {
                if !s.values.is_empty() || !s.producers.is_empty() {
                    let mut values = std::mem::take(&mut s.values);
                    let parked = std::mem::take(&mut s.producers);
                    let mut signals = Vec::with_capacity(parked.len());
                    for producer in parked {
                        values.push(producer.value);
                        signals.push(producer.signal);
                    }
                    Batch::Ready(Chunk::from_vec(values), signals)
                } else if s.closed {
                    Batch::Closed
                } else {
                    s.waiting = Some(waiter.clone());
                    Batch::Wait
                }
            });
            match batch {
                Batch::Ready(chunk, signals) => {
                    for signal in signals {
                        signal.complete(());
                    }
                    return Ok(Some(chunk));
                }
                Batch::Closed => return Ok(None),
                Batch::Wait => waiter.get().await,
            }
        }
    }
}

impl<O> fmt::Debug for Channel<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (buffered, parked, closed) = self
            .state
            .modify(|s| (s.values.len(), s.producers.len(), s.closed));
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("buffered", &buffered)
            .field("parked", &parked)
            .field("closed", &closed)
            .finish()
    }
}

fn notify(waiting: Option<Deferred<()>>) {
    if let Some(waiting) = waiting {
        waiting.complete(());
    }
}

/// Removes a parked producer whose send future was dropped.
struct Withdraw<O> {
    state: Ref<State<O>>,
    id: Token,
    armed: bool,
}

impl<O> Drop for Withdraw<O> {
    fn drop(&mut self) {
        if self.armed {
            let id = self.id;
            self.state.update(|s| s.producers.retain(|p| p.id != id));
        }
    }
}

//! A bounded, closeable FIFO that decouples many writers from a draining
//! reader. Writes never block; reads wait for work with a timeout so that
//! batch consumers can commit on elapsed time as well as on volume.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

/// The outcome of a non-blocking write. Rejections hand the item back so
/// that the caller retains ownership.
#[derive(Debug, Eq, PartialEq)]
pub enum WriteOutcome<T> {
    /// The item was appended.
    Written,
    /// The queue is at capacity.
    Full(T),
    /// The queue has been closed and accepts no further items.
    Closed(T),
}

/// The queueing capability the producer is written against. The default
/// implementation is [BoundedQueue]; alternatives can prioritise, spill or
/// shed differently as long as they honour these semantics.
#[async_trait]
pub trait MessageQueue<T: Send>: Send + Sync {
    /// Append an item without blocking.
    fn try_write(&self, item: T) -> WriteOutcome<T>;

    /// Wait until at least one item is available or the timeout elapses,
    /// then drain up to `max_count` items without further waiting. Returns
    /// the remaining items when the queue has closed, and an empty batch
    /// once it is closed and drained.
    async fn take_batch(&self, max_count: usize, within: Duration) -> Vec<T>;

    /// Refuse all future writes. Items already queued remain readable.
    /// Closing more than once has no further effect.
    fn close(&self);

    /// Whether the queue is closed and nothing remains to read.
    fn is_closed_and_empty(&self) -> bool;
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// An in-memory bounded FIFO with a close signal.
pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    readable: Notify,
}

impl<T> BoundedQueue<T> {
    /// A queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            readable: Notify::new(),
        }
    }

    /// Remove and return the oldest item, if one is immediately available.
    pub fn try_take(&self) -> Option<T> {
        let Ok(mut state) = self.state.lock() else {
            return None;
        };
        state.items.pop_front()
    }

    /// Whether nothing is currently queued.
    pub fn is_empty(&self) -> bool {
        let Ok(state) = self.state.lock() else {
            return true;
        };
        state.items.is_empty()
    }

    /// The number of items currently queued.
    pub fn len(&self) -> usize {
        let Ok(state) = self.state.lock() else {
            return 0;
        };
        state.items.len()
    }
}

#[async_trait]
impl<T: Send> MessageQueue<T> for BoundedQueue<T> {
    fn try_write(&self, item: T) -> WriteOutcome<T> {
        let Ok(mut state) = self.state.lock() else {
            return WriteOutcome::Closed(item);
        };
        if state.closed {
            return WriteOutcome::Closed(item);
        }
        if state.items.len() >= self.capacity {
            return WriteOutcome::Full(item);
        }
        state.items.push_back(item);
        drop(state);
        self.readable.notify_one();
        WriteOutcome::Written
    }

    async fn take_batch(&self, max_count: usize, within: Duration) -> Vec<T> {
        let deadline = Instant::now() + within;
        loop {
            // Created ahead of the emptiness check so that a write landing
            // in between leaves a wakeup permit behind.
            let notified = self.readable.notified();
            {
                let Ok(mut state) = self.state.lock() else {
                    return Vec::new();
                };
                if !state.items.is_empty() {
                    let n = max_count.min(state.items.len());
                    return state.items.drain(..n).collect();
                }
                if state.closed {
                    return Vec::new();
                }
            }
            if time::timeout_at(deadline, notified).await.is_err() {
                // Timed out: one final drain of whatever arrived meanwhile.
                let Ok(mut state) = self.state.lock() else {
                    return Vec::new();
                };
                let n = max_count.min(state.items.len());
                return state.items.drain(..n).collect();
            }
        }
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        // Wake registered readers, and bank a permit for a reader that
        // races its registration with this close.
        self.readable.notify_waiters();
        self.readable.notify_one();
    }

    fn is_closed_and_empty(&self) -> bool {
        let Ok(state) = self.state.lock() else {
            return true;
        };
        state.closed && state.items.is_empty()
    }
}

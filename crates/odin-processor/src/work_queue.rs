//! FIFO queue feeding a plugin worker thread.
//!
//! A thin owner of a `crossbeam::channel` pair. Closing drops the sender, so
//! the consumer drains what is queued and then sees the channel disconnect.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;

/// Returned by [`WorkQueue::add`] after the queue was closed; carries the
/// rejected item back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closed<T>(pub T);

impl<T> fmt::Display for Closed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("work queue is closed")
    }
}

impl<T: fmt::Debug> std::error::Error for Closed<T> {}

/// FIFO work queue. Unbounded unless built with [`WorkQueue::bounded`].
pub struct WorkQueue<T> {
    tx: Mutex<Option<Sender<T>>>,
    rx: Receiver<T>,
    capacity: Option<usize>,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    /// Unbounded queue.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self::from_pair(tx, rx, None)
    }

    /// Queue holding at most `capacity` items; `add` blocks while full.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = channel::bounded(capacity);
        Self::from_pair(tx, rx, Some(capacity))
    }

    fn from_pair(tx: Sender<T>, rx: Receiver<T>, capacity: Option<usize>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            capacity,
        }
    }

    /// Append `item`. Blocks while a bounded queue is full.
    pub fn add(&self, item: T) -> Result<(), Closed<T>> {
        // Clone out so a blocked bounded send does not hold the lock.
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx.send(item).map_err(|e| Closed(e.into_inner())),
            None => Err(Closed(item)),
        }
    }

    /// Take the oldest item, blocking until one arrives. Returns `None` once
    /// the queue is closed and drained.
    pub fn remove(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Stop accepting items. Queued items can still be removed.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Items waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True when nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// True after [`close`](Self::close).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .field("capacity", &self.capacity)
            .finish()
    }
}

//! Thread-safe FIFO queue with blocking and non-blocking dequeue.
//!
//! `MessageQueue` is the primitive underneath the context's operation queue
//! and the dispatcher's message queue. One mutex guards the entries; a condvar
//! wakes blocked consumers.
//!
//! # Closing
//!
//! A queue can be closed once. After that, [`MessageQueue::try_enqueue`]
//! hands the item back to the caller, and blocked [`MessageQueue::dequeue`]
//! calls return `None` once the queue is empty. The owner uses this to make
//! "check shutdown, then enqueue" atomic with respect to its own shutdown.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Generic thread-safe FIFO.
///
/// # Example
///
/// ```ignore
/// let queue = MessageQueue::new();
/// queue.enqueue("scan disks");
///
/// assert_eq!(queue.try_dequeue(), Some("scan disks"));
/// assert_eq!(queue.try_dequeue(), None);
/// ```
pub struct MessageQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

impl<T> MessageQueue<T> {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    // Entries are plain data; a panic while the lock was held cannot leave
    // them half-written, so a poisoned lock is recovered.
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an item and wake one waiter.
    ///
    /// Appends even if the queue has been closed; use
    /// [`try_enqueue`](Self::try_enqueue) when that must be rejected.
    pub fn enqueue(&self, item: T) {
        self.lock().items.push_back(item);
        self.available.notify_one();
    }

    /// Append an item unless the queue is closed.
    ///
    /// Returns the item back in `Err` if the queue was closed.
    pub fn try_enqueue(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Remove the oldest item, blocking until one is available.
    ///
    /// Returns `None` only when the queue is closed and empty.
    pub fn dequeue(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Remove the oldest item without blocking.
    pub fn try_dequeue(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Take every queued item in FIFO order, leaving the queue empty.
    ///
    /// The lock is held only for the swap.
    pub fn drain(&self) -> VecDeque<T> {
        std::mem::take(&mut self.lock().items)
    }

    /// Drop every queued item without waking anyone.
    pub fn clear(&self) {
        let drained = self.drain();
        // Item destructors run outside the lock.
        drop(drained);
    }

    /// Block until the queue is non-empty, closed, or `timeout` elapses.
    ///
    /// Returns true if items are available.
    pub fn wait_non_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if !state.items.is_empty() {
                return true;
            }
            if state.closed {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    /// Close the queue and wake every waiter.
    ///
    /// Returns whatever was still queued so the caller can fail it. Returns
    /// an empty deque if the queue was already closed and empty.
    pub fn close(&self) -> VecDeque<T> {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.items)
        };
        self.available.notify_all();
        drained
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of queued items (snapshot).
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Returns true if nothing is queued (snapshot).
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for MessageQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MessageQueue")
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .finish()
    }
}

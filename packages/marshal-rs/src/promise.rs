//! Single-resolution result channel: [`Promise`] and [`Awaitable`].
//!
//! A promise is the producing half; it is resolved exactly once with a value
//! or an error. The awaitable is the consuming half; it can block
//! ([`Awaitable::wait`]), poll with a timeout ([`Awaitable::wait_for`]),
//! register one continuation ([`Awaitable::then`]), or be `.await`ed since it
//! implements [`std::future::Future`].
//!
//! # States
//!
//! ```text
//! Pending ──resolve──► Ready ───┐
//!    │                          ├──take──► Completed
//!    ├──reject/drop──► Failed ──┘
//!    └──cancel──► Cancelled
//! ```
//!
//! Cancellation is cooperative. It resolves the awaitable with
//! [`MarshalError::Cancelled`] and raises a flag the producer can poll through
//! [`Promise::is_cancelled`]; running work is never interrupted.
//!
//! Dropping an unresolved promise fails the awaitable with
//! [`MarshalError::Abandoned`], so no waiter can hang on lost work.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::MarshalError;

/// Lifecycle of an [`Awaitable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitableState {
    /// Not resolved yet.
    Pending,
    /// Resolved with a value that has not been taken.
    Ready,
    /// The result has been handed to the consumer.
    Completed,
    /// Cancelled before the producer resolved it.
    Cancelled,
    /// Resolved with an error that has not been taken.
    Failed,
}

type Continuation<T> = Box<dyn FnOnce(Result<T, MarshalError>) + Send>;

struct Slot<T> {
    state: AwaitableState,
    result: Option<Result<T, MarshalError>>,
    continuation: Option<Continuation<T>>,
    waker: Option<Waker>,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    resolved: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store the outcome if still pending. Returns false if already settled.
    ///
    /// The continuation and waker run after the lock is released.
    fn settle(&self, state: AwaitableState, result: Result<T, MarshalError>) -> bool {
        let (continuation, waker, result) = {
            let mut slot = self.lock();
            if slot.state != AwaitableState::Pending {
                return false;
            }
            match slot.continuation.take() {
                Some(continuation) => {
                    slot.state = match state {
                        AwaitableState::Cancelled => AwaitableState::Cancelled,
                        _ => AwaitableState::Completed,
                    };
                    (Some(continuation), slot.waker.take(), Some(result))
                }
                None => {
                    slot.state = state;
                    slot.result = Some(result);
                    (None, slot.waker.take(), None)
                }
            }
        };
        self.resolved.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        if let (Some(continuation), Some(result)) = (continuation, result) {
            continuation(result);
        }
        true
    }
}

/// Create a connected promise/awaitable pair.
pub fn channel<T>() -> (Promise<T>, Awaitable<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot {
            state: AwaitableState::Pending,
            result: None,
            continuation: None,
            waker: None,
        }),
        resolved: Condvar::new(),
    });
    (
        Promise {
            shared: Some(shared.clone()),
        },
        Awaitable { shared },
    )
}

/// Producing half of a result channel.
pub struct Promise<T> {
    // `None` once resolved; Drop uses it to detect abandonment.
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Promise<T> {
    /// Resolve with a value.
    ///
    /// Ignored if the awaitable was already cancelled.
    pub fn resolve(self, value: T) {
        self.complete(Ok(value));
    }

    /// Resolve with an error.
    pub fn reject(self, error: MarshalError) {
        self.complete(Err(error));
    }

    /// Resolve with either outcome.
    pub fn complete(mut self, result: Result<T, MarshalError>) {
        if let Some(shared) = self.shared.take() {
            let state = if result.is_ok() {
                AwaitableState::Ready
            } else {
                AwaitableState::Failed
            };
            shared.settle(state, result);
        }
    }

    /// Returns true if the consumer cancelled.
    ///
    /// Long-running producers may check this between steps and stop early.
    pub fn is_cancelled(&self) -> bool {
        self.shared
            .as_ref()
            .map(|shared| shared.lock().state == AwaitableState::Cancelled)
            .unwrap_or(false)
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.settle(AwaitableState::Failed, Err(MarshalError::Abandoned));
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("resolved", &self.shared.is_none())
            .finish()
    }
}

/// Consuming half of a result channel.
///
/// # Example
///
/// ```ignore
/// let (promise, awaitable) = marshal::promise::channel();
/// std::thread::spawn(move || promise.resolve(enumerate_disks()));
///
/// let disks = awaitable.wait()?;
/// ```
pub struct Awaitable<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Awaitable<T> {
    /// An awaitable that is already resolved with `value`.
    pub fn ready(value: T) -> Self {
        let (promise, awaitable) = channel();
        promise.resolve(value);
        awaitable
    }

    /// An awaitable that is already failed with `error`.
    pub fn failed(error: MarshalError) -> Self {
        let (promise, awaitable) = channel();
        promise.reject(error);
        awaitable
    }

    /// Current state (snapshot).
    pub fn state(&self) -> AwaitableState {
        self.shared.lock().state
    }

    /// Returns true once the awaitable is no longer pending.
    pub fn is_ready(&self) -> bool {
        self.state() != AwaitableState::Pending
    }

    /// Returns true if [`cancel`](Self::cancel) won the race with the producer.
    pub fn is_cancelled(&self) -> bool {
        self.state() == AwaitableState::Cancelled
    }

    /// Request cancellation.
    ///
    /// Has no effect if the awaitable is already resolved. Otherwise the
    /// awaitable resolves with [`MarshalError::Cancelled`] and any later
    /// resolution by the producer is discarded.
    pub fn cancel(&self) {
        self.shared
            .settle(AwaitableState::Cancelled, Err(MarshalError::Cancelled));
    }

    /// Block until resolved and take the result.
    pub fn wait(self) -> Result<T, MarshalError> {
        let mut slot = self.shared.lock();
        while slot.state == AwaitableState::Pending {
            slot = self
                .shared
                .resolved
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        Self::take(&mut slot)
    }

    /// Block up to `timeout` for resolution. Returns true if resolved.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /// Block until `deadline` for resolution. Returns true if resolved.
    ///
    /// A deadline in the past only reports the current state.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut slot = self.shared.lock();
        loop {
            if slot.state != AwaitableState::Pending {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            slot = self
                .shared
                .resolved
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    /// Take the result if resolved, without blocking.
    pub fn try_take(&mut self) -> Option<Result<T, MarshalError>> {
        let mut slot = self.shared.lock();
        if slot.result.is_none() {
            return None;
        }
        Some(Self::take(&mut slot))
    }

    /// Register the continuation, invoked exactly once with the result.
    ///
    /// Runs immediately on the calling thread if already resolved, otherwise
    /// on whichever thread resolves the promise.
    pub fn then<F>(self, continuation: F)
    where
        F: FnOnce(Result<T, MarshalError>) + Send + 'static,
    {
        let ready = {
            let mut slot = self.shared.lock();
            if slot.result.is_some() {
                Some(Self::take(&mut slot))
            } else if slot.state == AwaitableState::Cancelled {
                // Cancellation outlives a consumed result.
                Some(Err(MarshalError::Cancelled))
            } else if slot.state == AwaitableState::Completed {
                // Result already consumed elsewhere; nothing to deliver.
                return;
            } else {
                slot.continuation = Some(Box::new(continuation));
                return;
            }
        };
        if let Some(result) = ready {
            continuation(result);
        }
    }

    fn take(slot: &mut Slot<T>) -> Result<T, MarshalError> {
        let result = slot.result.take().unwrap_or(Err(MarshalError::Abandoned));
        if slot.state != AwaitableState::Cancelled {
            slot.state = AwaitableState::Completed;
        }
        result
    }
}

impl<T> Future for Awaitable<T> {
    type Output = Result<T, MarshalError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.lock();
        match slot.state {
            AwaitableState::Pending => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            _ => Poll::Ready(Self::take(&mut slot)),
        }
    }
}

impl<T> fmt::Debug for Awaitable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Awaitable")
            .field("state", &self.state())
            .finish()
    }
}

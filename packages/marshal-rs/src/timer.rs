//! Shared timer thread over a min-heap of deadlines.
//!
//! One `TimerQueue` owns one named thread. Deadlines live in a binary heap;
//! the thread sleeps on a condvar until the earliest one is due, then runs the
//! job outside the lock. Cancelled entries are removed from the job table and
//! skipped lazily when their heap entry surfaces.
//!
//! Both the scheduler and delayed dispatcher calls arm timers here instead of
//! spawning a thread per call.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::MarshalConfig;
use crate::error::{panic_message, MarshalError};
use crate::Job;

/// Handle for an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey(u64);

struct TimerState {
    deadlines: BinaryHeap<Reverse<(Instant, TimerKey)>>,
    jobs: HashMap<TimerKey, Job>,
    next_key: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    changed: Condvar,
}

impl TimerShared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A single timer thread running jobs at their deadlines.
///
/// # Example
///
/// ```ignore
/// let timers = TimerQueue::new("marshal-timer")?;
/// let key = timers.schedule_after(Duration::from_secs(2), Box::new(|| refresh_volumes()))?;
///
/// // Changed our mind.
/// timers.cancel(key);
/// ```
pub struct TimerQueue {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl TimerQueue {
    /// Start a timer thread with the given name.
    pub fn new(thread_name: impl Into<String>) -> Result<Self, MarshalError> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                deadlines: BinaryHeap::new(),
                jobs: HashMap::new(),
                next_key: 1,
                shutdown: false,
            }),
            changed: Condvar::new(),
        });

        let thread_name = thread_name.into();
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_timer_loop(worker))
            .map_err(|_| MarshalError::IllegalState {
                reason: "failed to spawn timer thread",
            })?;

        debug!(thread = %thread_name, "timer thread started");

        Ok(Self {
            shared,
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Start a timer thread named from configuration.
    pub fn from_config(config: &MarshalConfig) -> Result<Self, MarshalError> {
        Self::new(config.timer_thread_name.clone())
    }

    /// Run `job` once at `deadline`.
    ///
    /// A deadline in the past fires as soon as the timer thread wakes.
    pub fn schedule_at(&self, deadline: Instant, job: Job) -> Result<TimerKey, MarshalError> {
        let key = {
            let mut state = self.shared.lock();
            if state.shutdown {
                return Err(MarshalError::IllegalState {
                    reason: "timer queue is shut down",
                });
            }
            let key = TimerKey(state.next_key);
            state.next_key += 1;
            state.deadlines.push(Reverse((deadline, key)));
            state.jobs.insert(key, job);
            key
        };
        self.shared.changed.notify_one();
        trace!(timer = key.0, "timer armed");
        Ok(key)
    }

    /// Run `job` once after `delay`.
    pub fn schedule_after(&self, delay: Duration, job: Job) -> Result<TimerKey, MarshalError> {
        self.schedule_at(Instant::now() + delay, job)
    }

    /// Disarm a timer. Returns true if it had not fired yet.
    pub fn cancel(&self, key: TimerKey) -> bool {
        let removed = self.shared.lock().jobs.remove(&key);
        removed.is_some()
    }

    /// Number of armed timers (snapshot).
    pub fn len(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    /// Returns true if no timer is armed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if called from this queue's timer thread.
    pub fn is_timer_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Stop the timer thread and drop every armed job without running it.
    ///
    /// Idempotent. Joins the thread unless called from the thread itself.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.shared.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.deadlines.clear();
            std::mem::take(&mut state.jobs)
        };
        self.shared.changed.notify_all();
        debug!(dropped = dropped.len(), "timer queue shutting down");
        drop(dropped);

        if self.is_timer_thread() {
            return;
        }
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("timer thread exited by panic");
            }
        }
    }

    /// Returns true once [`shutdown`](Self::shutdown) has run.
    pub fn is_shutdown(&self) -> bool {
        self.shared.lock().shutdown
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("TimerQueue")
            .field("armed", &state.jobs.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

fn run_timer_loop(shared: Arc<TimerShared>) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            break;
        }

        let next = state.deadlines.peek().map(|Reverse((deadline, key))| (*deadline, *key));
        let Some((deadline, key)) = next else {
            state = shared
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            continue;
        };

        let now = Instant::now();
        if deadline > now {
            state = shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
            continue;
        }

        state.deadlines.pop();
        // Missing job means the timer was cancelled.
        let Some(job) = state.jobs.remove(&key) else {
            continue;
        };

        drop(state);
        trace!(timer = key.0, "timer fired");
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            warn!(
                timer = key.0,
                panic = %panic_message(payload.as_ref()),
                "timer job panicked"
            );
        }
        state = shared.lock();
    }
    trace!("timer thread exiting");
}

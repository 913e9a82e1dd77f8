//! Executor contract: where submitted work runs.
//!
//! [`Executor`] is object safe so the context can hold an
//! `Arc<dyn Executor>`. Awaitable submission is generic over the result type
//! and lives in [`ExecutorExt`], which every executor gets for free.
//!
//! Two implementations ship with the crate: [`InlineExecutor`] (runs work on
//! the submitting thread; useful in tests and single-threaded tools) and
//! [`RuntimeExecutor`](crate::runtime::RuntimeExecutor) over tokio's pools.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{panic_message, MarshalError};
use crate::promise::{self, Awaitable};
use crate::Job;

/// How an executor should run a piece of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionPolicy {
    /// Run on the submitting thread before returning.
    Inline,
    /// Queue behind work already submitted; never run before returning.
    Deferred,
    /// Run on the executor's async workers.
    Async,
    /// Run on the executor's blocking pool, concurrently with other work.
    #[default]
    Parallel,
}

/// Work submission contract.
///
/// Submissions after [`shutdown`](Executor::shutdown) return
/// [`MarshalError::IllegalState`]. Panics from fire-and-forget work are caught
/// and logged by the implementation.
pub trait Executor: Send + Sync {
    /// Run `work` at the executor's discretion.
    fn execute(&self, work: Job) -> Result<(), MarshalError>;

    /// Submit `work` after `delay` has elapsed.
    fn execute_delayed(&self, work: Job, delay: Duration) -> Result<(), MarshalError>;

    /// Run `work` according to `policy`.
    fn execute_with_policy(&self, work: Job, policy: ExecutionPolicy)
        -> Result<(), MarshalError>;

    /// Returns true if no submitted work is queued or running.
    fn is_idle(&self) -> bool {
        self.pending_work_count() == 0
    }

    /// Submitted work not yet finished (snapshot).
    fn pending_work_count(&self) -> usize;

    /// Block until all submitted work has finished.
    ///
    /// Returns [`MarshalError::IllegalState`] from a worker thread of the same
    /// executor instead of deadlocking.
    fn wait_for_completion(&self) -> Result<(), MarshalError>;

    /// Stop accepting work, drain what was submitted, release workers.
    ///
    /// Idempotent.
    fn shutdown(&self);

    /// Returns true once [`shutdown`](Executor::shutdown) has been called.
    fn is_shutdown(&self) -> bool;
}

/// Awaitable submission for any [`Executor`].
pub trait ExecutorExt: Executor {
    /// Run `work` and resolve the returned awaitable with its value.
    ///
    /// A panic inside `work` resolves the awaitable with
    /// [`MarshalError::WorkPanicked`]. If the executor rejects the submission
    /// the awaitable is failed with the rejection.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let size = executor.execute_async(|| measure_partition("C:")).wait()?;
    /// ```
    fn execute_async<T, F>(&self, work: F) -> Awaitable<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (promise, awaitable) = promise::channel();
        let job: Job = Box::new(move || {
            promise.complete(catch_unwind(AssertUnwindSafe(work)).map_err(MarshalError::from_panic));
        });
        // On rejection the job (and its promise) is dropped, which would
        // report Abandoned; report the real cause instead.
        match self.execute(job) {
            Ok(()) => awaitable,
            Err(e) => Awaitable::failed(e),
        }
    }
}

impl<E: Executor + ?Sized> ExecutorExt for E {}

/// Executor that runs everything on the submitting thread.
///
/// `execute_delayed` sleeps the caller for the delay. Mostly useful for
/// deterministic tests and command-line tools without a runtime.
#[derive(Default)]
pub struct InlineExecutor {
    running: AtomicUsize,
    shutdown: AtomicBool,
}

impl InlineExecutor {
    /// Create a new inline executor.
    pub fn new() -> Self {
        Self::default()
    }

    fn run(&self, work: Job) -> Result<(), MarshalError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(MarshalError::IllegalState {
                reason: "executor is shut down",
            });
        }
        self.running.fetch_add(1, Ordering::AcqRel);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
            warn!(panic = %panic_message(payload.as_ref()), "inline work panicked");
        }
        self.running.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }
}

impl Executor for InlineExecutor {
    fn execute(&self, work: Job) -> Result<(), MarshalError> {
        self.run(work)
    }

    fn execute_delayed(&self, work: Job, delay: Duration) -> Result<(), MarshalError> {
        if self.is_shutdown() {
            return Err(MarshalError::IllegalState {
                reason: "executor is shut down",
            });
        }
        thread::sleep(delay);
        self.run(work)
    }

    fn execute_with_policy(
        &self,
        work: Job,
        _policy: ExecutionPolicy,
    ) -> Result<(), MarshalError> {
        self.run(work)
    }

    fn pending_work_count(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    fn wait_for_completion(&self) -> Result<(), MarshalError> {
        // Work only ever runs on the caller's own stack.
        if self.pending_work_count() > 0 {
            return Err(MarshalError::IllegalState {
                reason: "wait_for_completion called from inside executor work",
            });
        }
        Ok(())
    }

    fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            debug!("inline executor shut down");
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl fmt::Debug for InlineExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineExecutor")
            .field("running", &self.pending_work_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

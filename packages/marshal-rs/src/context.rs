//! Thread-affine execution context.
//!
//! An [`AsyncContext`] belongs to the thread that created it (its *home
//! thread*). Any thread may hand it work:
//!
//! - [`post`](AsyncContext::post) queues work and returns immediately.
//! - [`send`](AsyncContext::send) queues work and blocks until the home thread
//!   has run it, returning its value. Called on the home thread it runs inline.
//!
//! Queued work only runs when the home thread pumps the queue with
//! [`process_pending_operations`](AsyncContext::process_pending_operations)
//! or [`run_until_shutdown`](AsyncContext::run_until_shutdown), so state owned
//! by the home thread is only ever touched from it.
//!
//! # Shutdown
//!
//! [`shutdown`](AsyncContext::shutdown) closes the queue, so every operation
//! is either run by a pump or failed by shutdown, never both and never
//! neither. Blocked senders wake with [`MarshalError::IllegalState`].
//!
//! # Example
//!
//! ```ignore
//! let context = Arc::new(AsyncContext::from_config(&config)?);
//!
//! let worker = {
//!     let context = context.clone();
//!     std::thread::spawn(move || {
//!         let volumes = enumerate_volumes();
//!         context.post(move || volume_list.replace(volumes));
//!         context.send(|| progress_bar.value())
//!     })
//! };
//!
//! // Home thread message loop.
//! context.run_until_shutdown(config.pump_interval)?;
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::config::MarshalConfig;
use crate::error::{panic_message, MarshalError};
use crate::executor::Executor;
use crate::promise::{self, Awaitable, Promise};
use crate::queue::MessageQueue;
use crate::runtime::RuntimeExecutor;
use crate::scheduler::{Scheduler, TimerScheduler};

const SHUT_DOWN: MarshalError = MarshalError::IllegalState {
    reason: "context is shut down",
};

/// Where a context's work is expected to run. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SynchronizationContext {
    None,
    #[default]
    ThreadPool,
    UiThread,
    CurrentThread,
    Custom,
}

// =============================================================================
// Operations
// =============================================================================

/// A queued unit of work, consumed exactly once by `run` or `abort`.
trait Operation: Send {
    /// Returns false if the work was skipped.
    fn run(self: Box<Self>) -> bool;
    fn abort(self: Box<Self>, error: MarshalError);
}

struct Posted<F>(F);

impl<F: FnOnce() + Send> Operation for Posted<F> {
    fn run(self: Box<Self>) -> bool {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(self.0)) {
            warn!(panic = %panic_message(payload.as_ref()), "posted operation panicked");
        }
        true
    }

    fn abort(self: Box<Self>, error: MarshalError) {
        trace!(error = %error, "posted operation discarded");
    }
}

struct Blocking<F, R> {
    work: F,
    promise: Promise<R>,
}

impl<F, R> Operation for Blocking<F, R>
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    fn run(self: Box<Self>) -> bool {
        let Blocking { work, promise } = *self;
        if promise.is_cancelled() {
            trace!("sender gave up; skipping operation");
            return false;
        }
        promise.complete(catch_unwind(AssertUnwindSafe(work)).map_err(MarshalError::from_panic));
        true
    }

    fn abort(self: Box<Self>, error: MarshalError) {
        self.promise.reject(error);
    }
}

// =============================================================================
// AsyncContext
// =============================================================================

/// Execution context bound to the thread that created it.
pub struct AsyncContext {
    home: ThreadId,
    queue: MessageQueue<Box<dyn Operation>>,
    /// The batch the current pump pass is working through.
    in_flight: Mutex<VecDeque<Box<dyn Operation>>>,
    shutdown: AtomicBool,
    executor: Arc<dyn Executor>,
    scheduler: Arc<dyn Scheduler>,
    sync_context: Mutex<SynchronizationContext>,
}

impl AsyncContext {
    /// Create a context whose home is the calling thread.
    pub fn new(executor: Arc<dyn Executor>, scheduler: Arc<dyn Scheduler>) -> Self {
        let home = thread::current().id();
        debug!(context_thread = ?home, "context created");
        Self {
            home,
            queue: MessageQueue::new(),
            in_flight: Mutex::new(VecDeque::new()),
            shutdown: AtomicBool::new(false),
            executor,
            scheduler,
            sync_context: Mutex::new(SynchronizationContext::default()),
        }
    }

    /// Create a context with a tokio-backed executor and a scheduler that
    /// hands due work to it.
    pub fn from_config(config: &MarshalConfig) -> anyhow::Result<Self> {
        let executor: Arc<dyn Executor> = Arc::new(RuntimeExecutor::from_config(config)?);
        let scheduler = TimerScheduler::from_config(config, Some(executor.clone()))?;
        Ok(Self::new(executor, Arc::new(scheduler)))
    }

    pub fn executor(&self) -> Arc<dyn Executor> {
        self.executor.clone()
    }

    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.scheduler.clone()
    }

    pub fn synchronization_context(&self) -> SynchronizationContext {
        *self
            .sync_context
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_synchronization_context(&self, context: SynchronizationContext) {
        *self
            .sync_context
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = context;
    }

    /// Returns true on the thread that created this context.
    pub fn is_on_context_thread(&self) -> bool {
        thread::current().id() == self.home
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Number of queued operations (snapshot).
    pub fn pending_operations(&self) -> usize {
        self.queue.len()
    }

    fn in_flight(&self) -> MutexGuard<'_, VecDeque<Box<dyn Operation>>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Queue `work` for the home thread. Silently dropped after shutdown.
    pub fn post<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() || self.queue.try_enqueue(Box::new(Posted(work))).is_err() {
            trace!("post after shutdown dropped");
        }
    }

    /// Alias for [`post`](Self::post).
    pub fn invoke_async<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(work);
    }

    /// Alias for [`post`](Self::post).
    pub fn begin_invoke<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(work);
    }

    /// Run `work` on the home thread and return its value.
    ///
    /// On the home thread `work` runs inline, even after shutdown. Elsewhere
    /// the call blocks until a pump runs it; fails with
    /// [`MarshalError::IllegalState`] if the context is or becomes shut down
    /// first. A panic in `work` comes back as [`MarshalError::WorkPanicked`].
    pub fn send<R, F>(&self, work: F) -> Result<R, MarshalError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_on_context_thread() {
            return catch_unwind(AssertUnwindSafe(work)).map_err(MarshalError::from_panic);
        }
        self.enqueue_blocking(work)?.wait()
    }

    /// Like [`send`](Self::send), but gives up after `timeout`.
    ///
    /// On timeout the operation is withdrawn: if a pump reaches it later it
    /// is skipped.
    pub fn send_timeout<R, F>(&self, work: F, timeout: Duration) -> Result<R, MarshalError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_on_context_thread() {
            return catch_unwind(AssertUnwindSafe(work)).map_err(MarshalError::from_panic);
        }
        let awaitable = self.enqueue_blocking(work)?;
        if awaitable.wait_for(timeout) {
            return awaitable.wait();
        }
        awaitable.cancel();
        match awaitable.wait() {
            Err(MarshalError::Cancelled) => Err(MarshalError::Timeout { duration: timeout }),
            // Completed between the timed wait and the cancel.
            other => other,
        }
    }

    /// Alias for [`send`](Self::send).
    pub fn invoke<R, F>(&self, work: F) -> Result<R, MarshalError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.send(work)
    }

    /// Run `work` inline on the home thread, otherwise [`send`](Self::send) it.
    pub fn run_on_context<F>(&self, work: F) -> Result<(), MarshalError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(work)
    }

    /// Run `work` on the home thread and wait for its value.
    pub fn run_on_context_and_wait<R, F>(&self, work: F) -> Result<R, MarshalError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.send(work)
    }

    fn enqueue_blocking<R, F>(&self, work: F) -> Result<Awaitable<R>, MarshalError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(SHUT_DOWN);
        }
        let (promise, awaitable) = promise::channel();
        match self.queue.try_enqueue(Box::new(Blocking { work, promise })) {
            Ok(()) => Ok(awaitable),
            Err(_) => Err(SHUT_DOWN),
        }
    }

    // =========================================================================
    // Pumping
    // =========================================================================

    /// Run everything queued so far, in submission order. Home thread only.
    ///
    /// Work queued while the pass runs waits for the next pass. If shutdown
    /// happens mid-pass the remaining operations are failed instead of run.
    /// Returns the number of operations run.
    pub fn process_pending_operations(&self) -> Result<usize, MarshalError> {
        if !self.is_on_context_thread() {
            return Err(MarshalError::IllegalState {
                reason: "process_pending_operations called off the context thread",
            });
        }

        // The batch stays reachable from `shutdown` while it runs, so a
        // shutdown from inside the pass can fail what is left of it.
        let batch = self.queue.drain();
        self.in_flight().extend(batch);

        let mut executed = 0;
        let mut failed = 0;
        loop {
            let Some(operation) = self.in_flight().pop_front() else {
                break;
            };
            if self.is_shutdown() {
                operation.abort(SHUT_DOWN);
                failed += 1;
            } else if operation.run() {
                executed += 1;
            }
        }
        if failed > 0 {
            debug!(failed, "shutdown during pump; failed remaining operations");
        }

        if executed > 0 {
            trace!(executed, "pump pass complete");
        }
        Ok(executed)
    }

    /// Pump until shutdown, sleeping up to `poll` between empty passes.
    ///
    /// Returns the total number of operations run.
    pub fn run_until_shutdown(&self, poll: Duration) -> Result<usize, MarshalError> {
        let mut total = 0;
        while !self.is_shutdown() {
            self.queue.wait_non_empty(poll);
            total += self.process_pending_operations()?;
        }
        debug!(total, "pump loop exited");
        Ok(total)
    }

    /// Stop accepting work and fail everything still queued.
    ///
    /// Also shuts down the executor and scheduler. Idempotent.
    pub fn shutdown(&self) {
        if self
            .shutdown
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let mut pending = std::mem::take(&mut *self.in_flight());
        pending.extend(self.queue.close());
        let failed = pending.len();
        for operation in pending {
            operation.abort(SHUT_DOWN);
        }
        info!(context_thread = ?self.home, failed, "context shut down");

        self.executor.shutdown();
        self.scheduler.shutdown();
    }
}

impl Drop for AsyncContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncContext")
            .field("home", &self.home)
            .field("pending", &self.pending_operations())
            .field("shutdown", &self.is_shutdown())
            .field("sync_context", &self.synchronization_context())
            .finish()
    }
}

//! Tokio-backed [`Executor`].
//!
//! `RuntimeExecutor` maps execution policies onto a tokio runtime:
//!
//! | Policy     | Runs on                                        |
//! |------------|------------------------------------------------|
//! | `Parallel` | `spawn_blocking` pool (also plain `execute`)   |
//! | `Async`    | runtime worker threads via `spawn`             |
//! | `Deferred` | blocking pool, after a zero-length timer hop   |
//! | `Inline`   | the submitting thread                          |
//!
//! Outstanding work is counted with RAII guards, so panicking work still
//! releases [`Executor::wait_for_completion`].

use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info, warn};

use crate::config::MarshalConfig;
use crate::error::{panic_message, MarshalError};
use crate::executor::{ExecutionPolicy, Executor};
use crate::Job;

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the executor whose work is running on this thread, 0 if none.
    static CURRENT_EXECUTOR: Cell<u64> = const { Cell::new(0) };
}

// =============================================================================
// Pending Work Tracking
// =============================================================================

struct Tracker {
    id: u64,
    pending: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
    shutdown: AtomicBool,
}

impl Tracker {
    fn on_worker(&self) -> bool {
        CURRENT_EXECUTOR.with(|current| current.get() == self.id)
    }

    fn wait_idle(&self) {
        let mut guard = self
            .idle_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while self.pending.load(Ordering::Acquire) > 0 {
            guard = self
                .idle
                .wait(guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// Counts one unit of submitted work; decrements on drop.
struct PendingGuard {
    tracker: Arc<Tracker>,
}

impl PendingGuard {
    fn new(tracker: Arc<Tracker>) -> Self {
        tracker.pending.fetch_add(1, Ordering::AcqRel);
        Self { tracker }
    }

    /// Run the job on this thread, marked as one of our workers.
    fn run(self, work: Job) {
        let previous = CURRENT_EXECUTOR.with(|current| current.replace(self.tracker.id));
        if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
            warn!(
                executor = self.tracker.id,
                panic = %panic_message(payload.as_ref()),
                "executor work panicked"
            );
        }
        CURRENT_EXECUTOR.with(|current| current.set(previous));
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.tracker.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Take the lock so a waiter between its check and its wait
            // cannot miss the notification.
            let _guard = self
                .tracker
                .idle_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            self.tracker.idle.notify_all();
        }
    }
}

// =============================================================================
// RuntimeExecutor
// =============================================================================

/// Executor over a tokio runtime.
///
/// Either owns its runtime ([`from_config`](Self::from_config)) or borrows an
/// existing one through a handle ([`from_handle`](Self::from_handle)). Only an
/// owned runtime is torn down by [`Executor::shutdown`].
///
/// # Example
///
/// ```ignore
/// let config = MarshalConfig::from_env()?;
/// let executor = Arc::new(RuntimeExecutor::from_config(&config)?);
///
/// let checksum = executor.execute_async(|| hash_image(&path)).wait()?;
/// executor.shutdown();
/// ```
pub struct RuntimeExecutor {
    tracker: Arc<Tracker>,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
}

impl RuntimeExecutor {
    /// Build an executor owning a multi-threaded runtime sized from `config`.
    pub fn from_config(config: &MarshalConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .max_blocking_threads(config.max_blocking_threads)
            .thread_name(config.thread_name.clone())
            .enable_time()
            .build()
            .context("Failed to build executor runtime")?;

        info!(
            worker_threads = config.worker_threads,
            max_blocking_threads = config.max_blocking_threads,
            "executor runtime started"
        );

        let handle = runtime.handle().clone();
        Ok(Self::build(handle, Some(runtime)))
    }

    /// Build an executor that submits to an existing runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self::build(handle, None)
    }

    fn build(handle: Handle, runtime: Option<Runtime>) -> Self {
        Self {
            tracker: Arc::new(Tracker {
                id: NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed),
                pending: AtomicUsize::new(0),
                idle_lock: Mutex::new(()),
                idle: Condvar::new(),
                shutdown: AtomicBool::new(false),
            }),
            handle,
            runtime: Mutex::new(runtime),
        }
    }

    /// Returns true if the current thread is running work for this executor.
    pub fn is_worker_thread(&self) -> bool {
        self.tracker.on_worker()
    }

    fn admit(&self) -> Result<PendingGuard, MarshalError> {
        if self.tracker.shutdown.load(Ordering::Acquire) {
            return Err(MarshalError::IllegalState {
                reason: "executor is shut down",
            });
        }
        Ok(PendingGuard::new(self.tracker.clone()))
    }

    fn spawn_parallel(&self, guard: PendingGuard, work: Job) {
        self.handle.spawn_blocking(move || guard.run(work));
    }
}

impl Executor for RuntimeExecutor {
    fn execute(&self, work: Job) -> Result<(), MarshalError> {
        let guard = self.admit()?;
        self.spawn_parallel(guard, work);
        Ok(())
    }

    fn execute_delayed(&self, work: Job, delay: Duration) -> Result<(), MarshalError> {
        let guard = self.admit()?;
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            // The guard travels with the work so the delay counts as pending.
            tokio::task::spawn_blocking(move || guard.run(work));
        });
        Ok(())
    }

    fn execute_with_policy(
        &self,
        work: Job,
        policy: ExecutionPolicy,
    ) -> Result<(), MarshalError> {
        match policy {
            ExecutionPolicy::Inline => {
                let guard = self.admit()?;
                guard.run(work);
                Ok(())
            }
            ExecutionPolicy::Deferred => self.execute_delayed(work, Duration::ZERO),
            ExecutionPolicy::Async => {
                let guard = self.admit()?;
                self.handle.spawn(async move { guard.run(work) });
                Ok(())
            }
            ExecutionPolicy::Parallel => self.execute(work),
        }
    }

    fn pending_work_count(&self) -> usize {
        self.tracker.pending.load(Ordering::Acquire)
    }

    fn wait_for_completion(&self) -> Result<(), MarshalError> {
        if self.tracker.on_worker() {
            return Err(MarshalError::IllegalState {
                reason: "wait_for_completion called from an executor worker",
            });
        }
        self.tracker.wait_idle();
        Ok(())
    }

    fn shutdown(&self) {
        if self.tracker.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            executor = self.tracker.id,
            pending = self.pending_work_count(),
            "executor shutting down"
        );

        if self.tracker.on_worker() {
            warn!(
                executor = self.tracker.id,
                "shutdown from an executor worker; not draining"
            );
        } else {
            self.tracker.wait_idle();
        }

        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }

    fn is_shutdown(&self) -> bool {
        self.tracker.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for RuntimeExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RuntimeExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeExecutor")
            .field("id", &self.tracker.id)
            .field("pending", &self.pending_work_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

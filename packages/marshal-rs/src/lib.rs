//! # Marshal
//!
//! Cross-thread task marshaling for applications with a thread that owns
//! state (typically a UI thread) and workers that need to reach it.
//!
//! ## Core Concepts
//!
//! - [`AsyncContext`] = a queue owned by one *home thread*. Any thread can
//!   `post` (fire-and-forget) or `send` (block for the result); only the home
//!   thread runs the work, when it pumps.
//! - [`MessageDispatcher`] = the lighter UI-loop variant: priority-tagged
//!   actions, delayed injection, explicit `process_events` pump.
//! - [`InProcessBus`] = synchronous, type-indexed publish/subscribe.
//! - [`Executor`] / [`Scheduler`] = where background and timed work runs.
//!
//! ## Architecture
//!
//! ```text
//! worker threads                          home thread
//! ──────────────                          ───────────
//! context.post(f) ────► MessageQueue ───► process_pending_operations()
//! context.send(f) ──┬─► MessageQueue ───►   runs f, resolves Promise
//!                   └── Awaitable::wait ◄──────────┘
//!
//! dispatcher.invoke_delayed(f, d) ─► TimerQueue ─► MessageQueue ─► process_events()
//!
//! scheduler.schedule(f, opts) ─► TimerQueue ─► Executor (tokio pools)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Home thread is fixed** - captured at construction, never reassigned
//! 2. **Exactly once** - every queued operation is either run by a pump or
//!    failed by shutdown
//! 3. **No lock while running work** - queued work may enqueue more work
//! 4. **Faults stay local** - panics are caught where work runs; only the one
//!    caller waiting on a result sees them
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use marshal::{AsyncContext, MarshalConfig};
//!
//! let config = MarshalConfig::from_env()?;
//! let context = Arc::new(AsyncContext::from_config(&config)?);
//!
//! let worker = {
//!     let context = context.clone();
//!     std::thread::spawn(move || {
//!         let disks = probe_disks();
//!         context.send(move || disk_list.replace(disks))?;
//!         context.shutdown();
//!         Ok::<_, marshal::MarshalError>(())
//!     })
//! };
//!
//! context.run_until_shutdown(config.pump_interval)?;
//! ```

pub mod bus;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod promise;
pub mod property;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod timer;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

/// A boxed one-shot callable handed between threads.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

// Re-export error types
pub use crate::error::MarshalError;

// Re-export configuration
pub use config::MarshalConfig;

// Re-export context types
pub use context::{AsyncContext, SynchronizationContext};

// Re-export executor types
pub use executor::{ExecutionPolicy, Executor, ExecutorExt, InlineExecutor};
pub use runtime::RuntimeExecutor;

// Re-export scheduler types
pub use scheduler::{
    RepeatableJob, ScheduleId, ScheduleMode, ScheduleOptions, Scheduler, TimerScheduler,
};
pub use timer::TimerQueue;

// Re-export dispatcher types
pub use dispatch::{DispatchPriority, Dispatcher, Message, MessageDispatcher};

// Re-export bus types
pub use bus::{EventBus, EventBusExt, InProcessBus, SubscriptionToken};

// Re-export promise types
pub use promise::{Awaitable, AwaitableState, Promise};

// Re-export queue, registry and property types
pub use property::{Property, PropertyChangedNotifier};
pub use queue::MessageQueue;
pub use registry::{ServiceLifetime, ServiceRegistry};

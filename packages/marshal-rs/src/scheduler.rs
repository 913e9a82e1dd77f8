//! Timed and repeating work.
//!
//! [`Scheduler`] is the contract the context consumes; [`TimerScheduler`] is
//! the implementation over a [`TimerQueue`]. Each registration gets a
//! [`ScheduleId`] that stays valid until it is cancelled, runs out of
//! executions, or the scheduler shuts down.
//!
//! # Firing
//!
//! When a registration comes due the timer thread re-arms it (periodic) or
//! removes it (last execution) *before* running the work, so cancellation
//! only ever affects future firings. Work runs on the executor when one was
//! provided, otherwise on the timer thread. Periodic deadlines advance from
//! the previous deadline, not from when the work finished; a registration
//! that fell behind fires once immediately instead of bursting.
//!
//! # Pausing
//!
//! While paused, due registrations are held back rather than dropped. On
//! [`Scheduler::resume`] each held registration fires once and then continues
//! on its normal cadence.
//!
//! # Example
//!
//! ```ignore
//! let scheduler = TimerScheduler::from_config(&config, Some(executor.clone()))?;
//!
//! let id = scheduler.schedule(
//!     Arc::new(|| refresh_disk_list()),
//!     ScheduleOptions::periodic(Duration::from_secs(5)).with_max_executions(10),
//! )?;
//!
//! scheduler.cancel(id);
//! ```

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use crate::config::MarshalConfig;
use crate::error::{panic_message, MarshalError};
use crate::executor::Executor;
use crate::timer::{TimerKey, TimerQueue};

/// Work that can run more than once.
pub type RepeatableJob = Arc<dyn Fn() + Send + Sync>;

/// Handle for a scheduler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduleId(u64);

impl ScheduleId {
    /// Raw numeric value, for logging.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "schedule-{}", self.0)
    }
}

/// Kind of registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Run once as soon as the initial delay has elapsed.
    Once,
    /// Run repeatedly every `interval`.
    Periodic,
    /// Run once after the initial delay.
    Delayed,
}

/// Registration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleOptions {
    pub mode: ScheduleMode,
    pub initial_delay: Duration,
    pub interval: Duration,
    /// `None` repeats until cancelled. Only meaningful for periodic mode.
    pub max_executions: Option<u32>,
    /// Run on the timer thread even when an executor is available.
    pub execute_on_scheduler_thread: bool,
}

impl ScheduleOptions {
    /// Run once, immediately.
    pub fn once() -> Self {
        Self {
            mode: ScheduleMode::Once,
            initial_delay: Duration::ZERO,
            interval: Duration::ZERO,
            max_executions: None,
            execute_on_scheduler_thread: false,
        }
    }

    /// Run once after `delay`.
    pub fn delayed(delay: Duration) -> Self {
        Self {
            mode: ScheduleMode::Delayed,
            initial_delay: delay,
            ..Self::once()
        }
    }

    /// Run every `interval`, first after one interval.
    pub fn periodic(interval: Duration) -> Self {
        Self {
            mode: ScheduleMode::Periodic,
            initial_delay: interval,
            interval,
            ..Self::once()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_executions(mut self, max: u32) -> Self {
        self.max_executions = Some(max);
        self
    }

    pub fn on_scheduler_thread(mut self) -> Self {
        self.execute_on_scheduler_thread = true;
        self
    }

    /// Reject options that could never fire or would spin.
    pub fn validate(&self) -> Result<(), MarshalError> {
        if self.mode == ScheduleMode::Periodic && self.interval.is_zero() {
            return Err(MarshalError::InvalidSchedule {
                reason: "periodic schedules need a non-zero interval",
            });
        }
        if self.max_executions == Some(0) {
            return Err(MarshalError::InvalidSchedule {
                reason: "max_executions must be at least 1",
            });
        }
        Ok(())
    }

    fn execution_limit(&self) -> Option<u32> {
        match self.mode {
            ScheduleMode::Once | ScheduleMode::Delayed => Some(1),
            ScheduleMode::Periodic => self.max_executions,
        }
    }
}

/// Scheduling contract.
pub trait Scheduler: Send + Sync {
    /// Register `work` with `options`.
    fn schedule(
        &self,
        work: RepeatableJob,
        options: ScheduleOptions,
    ) -> Result<ScheduleId, MarshalError>;

    /// Run `work` once at a wall-clock instant. Past instants fire immediately.
    fn schedule_at(
        &self,
        work: RepeatableJob,
        when: DateTime<Utc>,
    ) -> Result<ScheduleId, MarshalError> {
        let delay = (when - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule(work, ScheduleOptions::delayed(delay))
    }

    /// Run `work` once after `delay`.
    fn schedule_after(
        &self,
        work: RepeatableJob,
        delay: Duration,
    ) -> Result<ScheduleId, MarshalError> {
        self.schedule(work, ScheduleOptions::delayed(delay))
    }

    /// Run `work` every `interval`, first after `initial_delay`.
    fn schedule_periodic(
        &self,
        work: RepeatableJob,
        interval: Duration,
        initial_delay: Duration,
    ) -> Result<ScheduleId, MarshalError> {
        self.schedule(
            work,
            ScheduleOptions::periodic(interval).with_initial_delay(initial_delay),
        )
    }

    /// Remove a pending registration. Returns false if it was not found.
    ///
    /// An execution already running is not interrupted.
    fn cancel(&self, id: ScheduleId) -> bool;

    /// Remove every registration.
    fn cancel_all(&self);

    fn is_scheduled(&self, id: ScheduleId) -> bool;

    /// Number of live registrations.
    fn scheduled_count(&self) -> usize;

    /// When the registration is next due, if it is armed.
    fn next_execution_time(&self, id: ScheduleId) -> Option<DateTime<Utc>>;

    fn pause(&self);

    fn resume(&self);

    fn is_paused(&self) -> bool;

    /// Cancel every registration and stop the timer machinery. Idempotent.
    fn shutdown(&self);

    fn is_shutdown(&self) -> bool;
}

// =============================================================================
// TimerScheduler
// =============================================================================

struct RegistrationState {
    timer: Option<TimerKey>,
    deadline: Instant,
    executions: u32,
    /// Came due while paused.
    deferred: bool,
}

struct Registration {
    work: RepeatableJob,
    options: ScheduleOptions,
    state: Mutex<RegistrationState>,
}

impl Registration {
    fn lock(&self) -> MutexGuard<'_, RegistrationState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct Shared {
    timers: TimerQueue,
    executor: Option<Arc<dyn Executor>>,
    registrations: DashMap<ScheduleId, Arc<Registration>>,
    next_id: AtomicU64,
    paused: AtomicBool,
    shutdown: AtomicBool,
}

impl Shared {
    /// Arm the timer for `id` at `deadline`. Caller holds the registration lock.
    fn arm(
        self: &Arc<Self>,
        id: ScheduleId,
        state: &mut RegistrationState,
        deadline: Instant,
    ) -> Result<(), MarshalError> {
        let weak: Weak<Shared> = Arc::downgrade(self);
        let key = self.timers.schedule_at(
            deadline,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.fire(id);
                }
            }),
        )?;
        state.timer = Some(key);
        state.deadline = deadline;
        Ok(())
    }

    fn fire(self: &Arc<Self>, id: ScheduleId) {
        let Some(registration) = self.registrations.get(&id).map(|r| r.value().clone()) else {
            return;
        };

        {
            let mut state = registration.lock();
            // Cancelled between the lookup and the lock.
            if !self.registrations.contains_key(&id) {
                return;
            }
            state.timer = None;

            if self.paused.load(Ordering::SeqCst) {
                state.deferred = true;
                trace!(schedule_id = %id, "due while paused; deferring");
                return;
            }

            state.executions += 1;
            let exhausted = registration
                .options
                .execution_limit()
                .is_some_and(|max| state.executions >= max);

            if exhausted {
                self.registrations.remove(&id);
                trace!(schedule_id = %id, "final execution; deregistered");
            } else {
                let now = Instant::now();
                let next = (state.deadline + registration.options.interval).max(now);
                if let Err(e) = self.arm(id, &mut state, next) {
                    drop(state);
                    self.registrations.remove(&id);
                    debug!(schedule_id = %id, error = %e, "could not re-arm; deregistered");
                }
            }
        }

        self.run(id, &registration);
    }

    fn run(&self, id: ScheduleId, registration: &Registration) {
        let work = registration.work.clone();
        let job = move || {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| work())) {
                warn!(
                    schedule_id = %id,
                    panic = %panic_message(payload.as_ref()),
                    "scheduled work panicked"
                );
            }
        };

        match &self.executor {
            Some(executor) if !registration.options.execute_on_scheduler_thread => {
                if let Err(e) = executor.execute(Box::new(job)) {
                    warn!(schedule_id = %id, error = %e, "executor rejected scheduled work");
                }
            }
            _ => job(),
        }
    }
}

/// [`Scheduler`] driven by a dedicated [`TimerQueue`].
pub struct TimerScheduler {
    shared: Arc<Shared>,
}

impl TimerScheduler {
    /// Scheduler that runs work on the timer thread.
    pub fn new(timers: TimerQueue) -> Self {
        Self::build(timers, None)
    }

    /// Scheduler that hands due work to `executor`.
    pub fn with_executor(timers: TimerQueue, executor: Arc<dyn Executor>) -> Self {
        Self::build(timers, Some(executor))
    }

    /// Start a timer thread named from `config`.
    pub fn from_config(
        config: &MarshalConfig,
        executor: Option<Arc<dyn Executor>>,
    ) -> Result<Self, MarshalError> {
        Ok(Self::build(TimerQueue::from_config(config)?, executor))
    }

    fn build(timers: TimerQueue, executor: Option<Arc<dyn Executor>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                timers,
                executor,
                registrations: DashMap::new(),
                next_id: AtomicU64::new(1),
                paused: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
        }
    }
}

impl Scheduler for TimerScheduler {
    fn schedule(
        &self,
        work: RepeatableJob,
        options: ScheduleOptions,
    ) -> Result<ScheduleId, MarshalError> {
        if self.is_shutdown() {
            return Err(MarshalError::IllegalState {
                reason: "scheduler is shut down",
            });
        }
        options.validate()?;

        let id = ScheduleId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + options.initial_delay;
        let mode = options.mode;
        let registration = Arc::new(Registration {
            work,
            options,
            state: Mutex::new(RegistrationState {
                timer: None,
                deadline,
                executions: 0,
                deferred: false,
            }),
        });

        self.shared.registrations.insert(id, registration.clone());

        // Holding the registration lock keeps an immediate firing from
        // observing it before the timer key is stored.
        let armed = {
            let mut state = registration.lock();
            self.shared.arm(id, &mut state, deadline)
        };
        if let Err(e) = armed {
            self.shared.registrations.remove(&id);
            return Err(e);
        }

        debug!(schedule_id = %id, ?mode, "registered");
        Ok(id)
    }

    fn cancel(&self, id: ScheduleId) -> bool {
        let Some(registration) = self.shared.registrations.get(&id).map(|r| r.value().clone())
        else {
            return false;
        };
        // Removal happens under the registration lock so a concurrent firing
        // either completes its decision first or sees the removal.
        let mut state = registration.lock();
        if self.shared.registrations.remove(&id).is_none() {
            return false;
        }
        if let Some(key) = state.timer.take() {
            self.shared.timers.cancel(key);
        }
        drop(state);
        debug!(schedule_id = %id, "cancelled");
        true
    }

    fn cancel_all(&self) {
        let ids: Vec<ScheduleId> = self.shared.registrations.iter().map(|r| *r.key()).collect();
        for id in ids {
            self.cancel(id);
        }
    }

    fn is_scheduled(&self, id: ScheduleId) -> bool {
        self.shared.registrations.contains_key(&id)
    }

    fn scheduled_count(&self) -> usize {
        self.shared.registrations.len()
    }

    fn next_execution_time(&self, id: ScheduleId) -> Option<DateTime<Utc>> {
        let registration = self.shared.registrations.get(&id)?.value().clone();
        let state = registration.lock();
        state.timer?;

        let now = Instant::now();
        let ahead = state.deadline.saturating_duration_since(now);
        Some(Utc::now() + chrono::Duration::from_std(ahead).unwrap_or_else(|_| chrono::Duration::zero()))
    }

    fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            debug!("scheduler paused");
        }
    }

    fn resume(&self) {
        if !self.shared.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        let registrations: Vec<(ScheduleId, Arc<Registration>)> = self
            .shared
            .registrations
            .iter()
            .map(|r| (*r.key(), r.value().clone()))
            .collect();

        let now = Instant::now();
        let mut released = 0;
        for (id, registration) in registrations {
            let mut state = registration.lock();
            if !state.deferred || !self.shared.registrations.contains_key(&id) {
                continue;
            }
            state.deferred = false;
            if self.shared.arm(id, &mut state, now).is_ok() {
                released += 1;
            }
        }
        debug!(released, "scheduler resumed");
    }

    fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancelled = self.shared.registrations.len();
        self.shared.registrations.clear();
        self.shared.timers.shutdown();
        debug!(cancelled, "scheduler shut down");
    }

    fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TimerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerScheduler")
            .field("scheduled", &self.scheduled_count())
            .field("paused", &self.is_paused())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeExecutor;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    const TIMER_NAME: &str = "test-sched-timer";

    fn scheduler() -> TimerScheduler {
        TimerScheduler::new(TimerQueue::new(TIMER_NAME).unwrap())
    }

    fn counting() -> (RepeatableJob, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let job: RepeatableJob = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (job, count)
    }

    fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        check()
    }

    #[test]
    fn test_once_fires_and_deregisters() {
        let scheduler = scheduler();
        let (job, count) = counting();

        let id = scheduler.schedule(job, ScheduleOptions::once()).unwrap();

        assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) == 1));
        assert!(wait_until(Duration::from_secs(1), || !scheduler.is_scheduled(id)));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_periodic_with_max_three_fires_exactly_three_times() {
        let scheduler = scheduler();
        let (job, count) = counting();

        let id = scheduler
            .schedule(
                job,
                ScheduleOptions::periodic(Duration::from_millis(10)).with_max_executions(3),
            )
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || !scheduler.is_scheduled(id)));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.scheduled_count(), 0);
    }

    #[test]
    fn test_delayed_waits_for_initial_delay() {
        let scheduler = scheduler();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let registered = Instant::now();

        scheduler
            .schedule_after(
                Arc::new(move || {
                    let _ = tx.lock().unwrap().send(Instant::now());
                }),
                Duration::from_millis(30),
            )
            .unwrap();

        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired.duration_since(registered) >= Duration::from_millis(30));
    }

    #[test]
    fn test_cancel_before_due() {
        let scheduler = scheduler();
        let (job, count) = counting();

        let id = scheduler
            .schedule_after(job, Duration::from_millis(40))
            .unwrap();
        assert!(scheduler.is_scheduled(id));
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));

        thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_all() {
        let scheduler = scheduler();
        let (job, count) = counting();
        for _ in 0..5 {
            scheduler
                .schedule_periodic(job.clone(), Duration::from_millis(20), Duration::from_millis(20))
                .unwrap();
        }
        assert_eq!(scheduler.scheduled_count(), 5);

        scheduler.cancel_all();
        assert_eq!(scheduler.scheduled_count(), 0);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancelled_periodic_stops_firing() {
        let scheduler = scheduler();
        for _ in 0..20 {
            let (job, count) = counting();
            let id = scheduler
                .schedule_periodic(job, Duration::from_millis(1), Duration::ZERO)
                .unwrap();
            assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) > 0));
            assert!(scheduler.cancel(id));

            // Firings run on the timer thread in order, so once a later job has
            // fired any firing that raced the cancel has finished.
            let (tx, rx) = mpsc::channel();
            let tx = Mutex::new(tx);
            scheduler
                .schedule(
                    Arc::new(move || {
                        let _ = tx.lock().unwrap().send(());
                    }),
                    ScheduleOptions::once(),
                )
                .unwrap();
            rx.recv_timeout(Duration::from_secs(5)).unwrap();

            let settled = count.load(Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            assert_eq!(count.load(Ordering::SeqCst), settled);
            assert!(!scheduler.is_scheduled(id));
            assert_eq!(scheduler.next_execution_time(id), None);
        }
        assert_eq!(scheduler.scheduled_count(), 0);
    }

    #[test]
    fn test_cancel_while_deferred_is_not_released_by_resume() {
        let scheduler = scheduler();
        let (job, count) = counting();

        scheduler.pause();
        let id = scheduler.schedule(job, ScheduleOptions::once()).unwrap();
        assert!(wait_until(Duration::from_secs(5), || scheduler
            .next_execution_time(id)
            .is_none()));

        assert!(scheduler.cancel(id));
        scheduler.resume();

        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.scheduled_count(), 0);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let scheduler = scheduler();
        let (job, _) = counting();

        let zero_interval = scheduler.schedule(job.clone(), ScheduleOptions::periodic(Duration::ZERO));
        assert!(matches!(zero_interval, Err(MarshalError::InvalidSchedule { .. })));

        let zero_max = scheduler.schedule(
            job,
            ScheduleOptions::periodic(Duration::from_millis(5)).with_max_executions(0),
        );
        assert!(matches!(zero_max, Err(MarshalError::InvalidSchedule { .. })));
        assert_eq!(scheduler.scheduled_count(), 0);
    }

    #[test]
    fn test_schedule_after_shutdown_is_illegal_state() {
        let scheduler = scheduler();
        let (job, _) = counting();
        scheduler
            .schedule_after(job.clone(), Duration::from_secs(10))
            .unwrap();

        scheduler.shutdown();
        scheduler.shutdown();

        assert!(scheduler.is_shutdown());
        assert_eq!(scheduler.scheduled_count(), 0);
        assert!(matches!(
            scheduler.schedule(job, ScheduleOptions::once()),
            Err(MarshalError::IllegalState { .. })
        ));
    }

    #[test]
    fn test_pause_holds_back_and_resume_releases_once() {
        let scheduler = scheduler();
        let (job, count) = counting();

        scheduler.pause();
        assert!(scheduler.is_paused());
        let id = scheduler
            .schedule_after(job, Duration::from_millis(10))
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_scheduled(id));
        assert_eq!(scheduler.next_execution_time(id), None);

        scheduler.resume();
        assert!(!scheduler.is_paused());
        assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) == 1));
        assert!(wait_until(Duration::from_secs(1), || !scheduler.is_scheduled(id)));
    }

    #[test]
    fn test_next_execution_time_is_in_the_future() {
        let scheduler = scheduler();
        let (job, _) = counting();
        let before = Utc::now();

        let id = scheduler
            .schedule_after(job, Duration::from_secs(60))
            .unwrap();

        let next = scheduler.next_execution_time(id).unwrap();
        assert!(next > before + chrono::Duration::seconds(55));
        assert!(next <= Utc::now() + chrono::Duration::seconds(61));
        assert_eq!(scheduler.next_execution_time(ScheduleId(999)), None);
    }

    #[test]
    fn test_schedule_at_past_instant_fires_immediately() {
        let scheduler = scheduler();
        let (job, count) = counting();

        scheduler
            .schedule_at(job, Utc::now() - chrono::Duration::seconds(5))
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_panicking_periodic_work_keeps_firing() {
        let scheduler = scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        scheduler
            .schedule(
                Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    panic!("flaky refresh");
                }),
                ScheduleOptions::periodic(Duration::from_millis(5)).with_max_executions(3),
            )
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) == 3));
    }

    #[test]
    fn test_work_goes_to_executor_unless_pinned() {
        let executor: Arc<dyn Executor> =
            Arc::new(RuntimeExecutor::from_config(&MarshalConfig::default()).unwrap());
        let scheduler =
            TimerScheduler::with_executor(TimerQueue::new(TIMER_NAME).unwrap(), executor);
        let (tx, rx) = mpsc::channel::<(bool, Option<String>)>();
        let tx = Arc::new(Mutex::new(tx));

        for pinned in [false, true] {
            let tx = tx.clone();
            let mut options = ScheduleOptions::once();
            if pinned {
                options = options.on_scheduler_thread();
            }
            scheduler
                .schedule(
                    Arc::new(move || {
                        let name = thread::current().name().map(str::to_string);
                        let _ = tx.lock().unwrap().send((pinned, name));
                    }),
                    options,
                )
                .unwrap();
        }

        for _ in 0..2 {
            let (pinned, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(name.as_deref() == Some(TIMER_NAME), pinned);
        }
    }
}

//! Message dispatcher for UI-style event loops.
//!
//! The `Dispatcher` is responsible for:
//! 1. Accepting actions from any thread, tagged with a priority
//! 2. Injecting delayed actions through the shared timer thread
//! 3. Running queued actions on its home thread when pumped
//!
//! Delivery is strictly first-in first-out. [`Message`] carries a priority and
//! orders by it, but the queue does not reorder on it.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{panic_message, MarshalError};
use crate::queue::MessageQueue;
use crate::timer::TimerQueue;
use crate::Job;

/// Priority tag on a dispatched action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DispatchPriority {
    Low,
    #[default]
    Normal,
    High,
    Immediate,
}

/// A queued action.
pub struct Message {
    pub action: Job,
    pub priority: DispatchPriority,
    pub scheduled_time: Instant,
}

impl Message {
    pub fn new(action: Job, priority: DispatchPriority) -> Self {
        Self {
            action,
            priority,
            scheduled_time: Instant::now(),
        }
    }
}

// Greater means "should run first": higher priority, then earlier time.
impl Ord for Message {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.scheduled_time.cmp(&self.scheduled_time))
    }
}

impl PartialOrd for Message {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Message {}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("priority", &self.priority)
            .field("scheduled_time", &self.scheduled_time)
            .finish_non_exhaustive()
    }
}

/// Dispatcher contract.
pub trait Dispatcher: Send + Sync {
    /// Run inline on the dispatcher thread, otherwise queue it.
    fn invoke(&self, action: Job);

    /// Queue with [`DispatchPriority::Normal`]. Dropped after shutdown.
    fn invoke_async(&self, action: Job);

    /// Queue after `delay`, unless the dispatcher shut down meanwhile.
    fn invoke_delayed(&self, action: Job, delay: Duration);

    /// Queue with a priority tag. Delivery order is still arrival order.
    fn invoke_with_priority(&self, action: Job, priority: DispatchPriority);

    fn is_on_dispatcher_thread(&self) -> bool;

    /// Run queued actions until the queue is observed empty. Home thread only.
    ///
    /// Returns how many actions ran.
    fn process_events(&self) -> Result<usize, MarshalError>;

    /// Number of queued actions (snapshot).
    fn pending_messages(&self) -> usize;

    /// Drop everything queued and reject further actions. Idempotent.
    fn shutdown(&self);

    fn is_shutdown(&self) -> bool;
}

// =============================================================================
// MessageDispatcher
// =============================================================================

struct DispatcherShared {
    home: ThreadId,
    queue: MessageQueue<Message>,
    shutdown: AtomicBool,
}

impl DispatcherShared {
    fn enqueue(&self, message: Message) {
        if self.shutdown.load(Ordering::Acquire) {
            trace!("dispatch after shutdown dropped");
            return;
        }
        if self.queue.try_enqueue(message).is_err() {
            trace!("dispatch after shutdown dropped");
        }
    }
}

enum TimerSource {
    /// Created on first delayed call; shut down with the dispatcher.
    Owned(Option<Arc<TimerQueue>>),
    /// Supplied by the caller and left running.
    Shared(Arc<TimerQueue>),
}

/// Queue-backed [`Dispatcher`] bound to the thread that created it.
///
/// # Example
///
/// ```ignore
/// let dispatcher = Arc::new(MessageDispatcher::new());
///
/// // From a worker:
/// dispatcher.invoke_async(Box::new(|| status_label.set_text("Copying files")));
///
/// // On the UI thread, once per frame:
/// dispatcher.process_events()?;
/// ```
pub struct MessageDispatcher {
    shared: Arc<DispatcherShared>,
    timers: Mutex<TimerSource>,
    timer_thread_name: String,
}

impl MessageDispatcher {
    /// Create a dispatcher whose home is the calling thread.
    pub fn new() -> Self {
        Self::build(TimerSource::Owned(None))
    }

    /// Create a dispatcher that arms delayed actions on an existing timer.
    pub fn with_timer(timers: Arc<TimerQueue>) -> Self {
        Self::build(TimerSource::Shared(timers))
    }

    fn build(timers: TimerSource) -> Self {
        let home = thread::current().id();
        debug!(dispatcher_thread = ?home, "dispatcher created");
        Self {
            shared: Arc::new(DispatcherShared {
                home,
                queue: MessageQueue::new(),
                shutdown: AtomicBool::new(false),
            }),
            timers: Mutex::new(timers),
            timer_thread_name: "marshal-dispatch-timer".to_string(),
        }
    }

    fn timer(&self) -> Result<Arc<TimerQueue>, MarshalError> {
        let mut source = self
            .timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &mut *source {
            TimerSource::Shared(timers) => Ok(timers.clone()),
            TimerSource::Owned(Some(timers)) => Ok(timers.clone()),
            TimerSource::Owned(slot @ None) => {
                let timers = Arc::new(TimerQueue::new(self.timer_thread_name.clone())?);
                *slot = Some(timers.clone());
                Ok(timers)
            }
        }
    }

    fn run(action: Job) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(action)) {
            warn!(panic = %panic_message(payload.as_ref()), "dispatched action panicked");
        }
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for MessageDispatcher {
    fn invoke(&self, action: Job) {
        if self.is_on_dispatcher_thread() {
            Self::run(action);
        } else {
            self.invoke_async(action);
        }
    }

    fn invoke_async(&self, action: Job) {
        self.shared
            .enqueue(Message::new(action, DispatchPriority::Normal));
    }

    fn invoke_delayed(&self, action: Job, delay: Duration) {
        if self.is_shutdown() {
            trace!("delayed dispatch after shutdown dropped");
            return;
        }
        let timers = match self.timer() {
            Ok(timers) => timers,
            Err(e) => {
                warn!(error = %e, "no timer for delayed dispatch; dropped");
                return;
            }
        };

        let weak: Weak<DispatcherShared> = Arc::downgrade(&self.shared);
        let armed = timers.schedule_after(
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.enqueue(Message::new(action, DispatchPriority::Normal));
                }
            }),
        );
        if let Err(e) = armed {
            warn!(error = %e, "failed to arm delayed dispatch; dropped");
        }
    }

    fn invoke_with_priority(&self, action: Job, priority: DispatchPriority) {
        self.shared.enqueue(Message::new(action, priority));
    }

    fn is_on_dispatcher_thread(&self) -> bool {
        thread::current().id() == self.shared.home
    }

    fn process_events(&self) -> Result<usize, MarshalError> {
        if !self.is_on_dispatcher_thread() {
            return Err(MarshalError::IllegalState {
                reason: "process_events called off the dispatcher thread",
            });
        }

        let mut ran = 0;
        while !self.is_shutdown() {
            let Some(message) = self.shared.queue.try_dequeue() else {
                break;
            };
            Self::run(message.action);
            ran += 1;
        }
        Ok(ran)
    }

    fn pending_messages(&self) -> usize {
        self.shared.queue.len()
    }

    fn shutdown(&self) {
        if self
            .shared
            .shutdown
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let dropped = self.shared.queue.close();
        debug!(dropped = dropped.len(), "dispatcher shut down");
        drop(dropped);

        let owned = match &mut *self
            .timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
        {
            TimerSource::Owned(slot) => slot.take(),
            TimerSource::Shared(_) => None,
        };
        if let Some(timers) = owned {
            timers.shutdown();
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for MessageDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("home", &self.shared.home)
            .field("pending", &self.pending_messages())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Job) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |label: &'static str| -> Job {
            let sink = sink.clone();
            Box::new(move || sink.lock().unwrap().push(label))
        };
        (log, make)
    }

    fn pump_until(dispatcher: &MessageDispatcher, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out pumping");
            dispatcher.process_events().unwrap();
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_delivery_is_fifo_regardless_of_priority() {
        let dispatcher = MessageDispatcher::new();
        let (log, make) = recorder();

        dispatcher.invoke_with_priority(make("low"), DispatchPriority::Low);
        dispatcher.invoke_with_priority(make("immediate"), DispatchPriority::Immediate);
        dispatcher.invoke_async(make("normal"));
        dispatcher.invoke_with_priority(make("high"), DispatchPriority::High);

        assert_eq!(dispatcher.process_events().unwrap(), 4);
        assert_eq!(*log.lock().unwrap(), vec!["low", "immediate", "normal", "high"]);
    }

    #[test]
    fn test_message_ordering_prefers_priority_then_age() {
        let older = Message::new(Box::new(|| {}), DispatchPriority::Normal);
        thread::sleep(Duration::from_millis(2));
        let newer = Message::new(Box::new(|| {}), DispatchPriority::Normal);
        let urgent = Message::new(Box::new(|| {}), DispatchPriority::Immediate);

        assert!(urgent > older);
        assert!(older > newer);

        let mut heap = BinaryHeap::new();
        heap.push(newer);
        heap.push(urgent);
        heap.push(older);
        let order: Vec<_> = std::iter::from_fn(|| heap.pop()).map(|m| m.priority).collect();
        assert_eq!(
            order,
            vec![
                DispatchPriority::Immediate,
                DispatchPriority::Normal,
                DispatchPriority::Normal
            ]
        );
    }

    #[test]
    fn test_invoke_on_home_thread_runs_inline() {
        let dispatcher = MessageDispatcher::new();
        let (log, make) = recorder();

        dispatcher.invoke(make("inline"));

        assert_eq!(*log.lock().unwrap(), vec!["inline"]);
        assert_eq!(dispatcher.pending_messages(), 0);
    }

    #[test]
    fn test_invoke_from_other_thread_is_queued() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let (log, make) = recorder();
        let action = make("queued");

        {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || dispatcher.invoke(action)).join().unwrap();
        }

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(dispatcher.process_events().unwrap(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["queued"]);
    }

    #[test]
    fn test_process_events_off_home_thread_is_illegal_state() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let result = {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || dispatcher.process_events()).join().unwrap()
        };
        assert!(matches!(result, Err(MarshalError::IllegalState { .. })));
    }

    #[test]
    fn test_panicking_action_does_not_stop_the_pump() {
        let dispatcher = MessageDispatcher::new();
        let (log, make) = recorder();

        dispatcher.invoke_async(Box::new(|| panic!("bad paint")));
        dispatcher.invoke_async(make("after"));

        assert_eq!(dispatcher.process_events().unwrap(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[test]
    fn test_actions_enqueued_during_pump_run_in_same_call() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let count = Arc::new(AtomicUsize::new(0));
        {
            let inner = dispatcher.clone();
            let count = count.clone();
            dispatcher.invoke_async(Box::new(move || {
                let count = count.clone();
                inner.invoke_async(Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }));
            }));
        }

        assert_eq!(dispatcher.process_events().unwrap(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invoke_delayed_arrives_after_delay() {
        let dispatcher = MessageDispatcher::new();
        let (log, make) = recorder();
        let started = Instant::now();

        dispatcher.invoke_delayed(make("late"), Duration::from_millis(30));
        assert_eq!(dispatcher.pending_messages(), 0);

        pump_until(&dispatcher, || !log.lock().unwrap().is_empty());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_invoke_delayed_dropped_if_shut_down_meanwhile() {
        let timers = Arc::new(TimerQueue::new("dispatch-test-timer").unwrap());
        let dispatcher = MessageDispatcher::with_timer(timers.clone());
        let (log, make) = recorder();

        dispatcher.invoke_delayed(make("never"), Duration::from_millis(20));
        dispatcher.shutdown();

        thread::sleep(Duration::from_millis(60));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(dispatcher.pending_messages(), 0);
        // A caller-supplied timer outlives the dispatcher.
        assert!(!timers.is_shutdown());
    }

    #[test]
    fn test_shutdown_clears_and_rejects() {
        let dispatcher = MessageDispatcher::new();
        let (log, make) = recorder();
        dispatcher.invoke_async(make("dropped"));

        dispatcher.shutdown();
        dispatcher.shutdown();
        dispatcher.invoke_async(make("rejected"));

        assert!(dispatcher.is_shutdown());
        assert_eq!(dispatcher.pending_messages(), 0);
        assert_eq!(dispatcher.process_events().unwrap(), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_usable_as_trait_object() {
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(MessageDispatcher::new());
        let (log, make) = recorder();
        dispatcher.invoke_async(make("dyn"));
        assert_eq!(dispatcher.process_events().unwrap(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["dyn"]);
    }
}

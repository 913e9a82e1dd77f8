//! Stress tests designed to break the marshaling core.
//!
//! These tests exercise races between producers, pumps, shutdown and
//! cancellation. Random jitter (fastrand) shuffles the interleavings.

#[cfg(test)]
mod stress_tests {
    use crate::bus::{EventBus, EventBusExt, InProcessBus};
    use crate::context::AsyncContext;
    use crate::dispatch::{DispatchPriority, Dispatcher, MessageDispatcher};
    use crate::error::MarshalError;
    use crate::executor::{Executor, ExecutorExt, InlineExecutor};
    use crate::promise::{self, AwaitableState};
    use crate::runtime::RuntimeExecutor;
    use crate::scheduler::{Scheduler, TimerScheduler};
    use crate::timer::TimerQueue;
    use crate::MarshalConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    fn context() -> Arc<AsyncContext> {
        let executor = Arc::new(InlineExecutor::new());
        let scheduler = Arc::new(TimerScheduler::new(TimerQueue::new("stress-timer").unwrap()));
        Arc::new(AsyncContext::new(executor, scheduler))
    }

    fn jitter() {
        if fastrand::u8(..4) == 0 {
            thread::sleep(Duration::from_micros(fastrand::u64(0..200)));
        } else {
            thread::yield_now();
        }
    }

    // ==========================================================================
    // TEST: Two producers, one pump pass
    // ==========================================================================
    //
    // 2 x 100 posts land before the pump; a single pass must run all 200 on the
    // home thread with each producer's order intact.

    #[test]
    fn test_two_producers_single_pump_preserves_per_thread_order() {
        let context = context();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(2));

        let producers: Vec<_> = (0..2)
            .map(|producer| {
                let context = context.clone();
                let seen = seen.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for seq in 0..100 {
                        let seen = seen.clone();
                        context.post(move || {
                            seen.lock()
                                .unwrap()
                                .push((producer, seq, thread::current().id()))
                        });
                        jitter();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(context.process_pending_operations().unwrap(), 200);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 200);
        for producer in 0..2 {
            let order: Vec<_> = seen
                .iter()
                .filter(|(p, _, _)| *p == producer)
                .map(|(_, seq, _)| *seq)
                .collect();
            assert_eq!(order, (0..100).collect::<Vec<_>>(), "producer {}", producer);
        }
        assert!(seen.iter().all(|(_, _, id)| *id == thread::current().id()));
    }

    // ==========================================================================
    // TEST: Shutdown racing with senders
    // ==========================================================================
    //
    // Every send either runs exactly once and returns Ok, or never runs and
    // returns IllegalState. No sender may hang.

    #[test]
    fn test_shutdown_racing_senders_is_exactly_once() {
        for _ in 0..20 {
            let context = context();
            let ran = Arc::new(AtomicUsize::new(0));
            let ok = Arc::new(AtomicUsize::new(0));
            let rejected = Arc::new(AtomicUsize::new(0));
            let senders_done = Arc::new(AtomicUsize::new(0));

            let senders: Vec<_> = (0..4)
                .map(|_| {
                    let context = context.clone();
                    let ran = ran.clone();
                    let ok = ok.clone();
                    let rejected = rejected.clone();
                    let senders_done = senders_done.clone();
                    thread::spawn(move || {
                        for _ in 0..25 {
                            let ran = ran.clone();
                            match context.send(move || {
                                ran.fetch_add(1, Ordering::SeqCst);
                            }) {
                                Ok(()) => ok.fetch_add(1, Ordering::SeqCst),
                                Err(MarshalError::IllegalState { .. }) => {
                                    rejected.fetch_add(1, Ordering::SeqCst)
                                }
                                Err(other) => panic!("unexpected error: {:?}", other),
                            };
                            jitter();
                        }
                        senders_done.fetch_add(1, Ordering::SeqCst);
                    })
                })
                .collect();

            let shutdown_after = fastrand::usize(0..100);
            let deadline = Instant::now() + Duration::from_secs(10);
            while senders_done.load(Ordering::SeqCst) < 4 {
                assert!(Instant::now() < deadline, "senders hung");
                if ran.load(Ordering::SeqCst) >= shutdown_after {
                    context.shutdown();
                }
                context.process_pending_operations().unwrap();
                jitter();
            }
            for sender in senders {
                sender.join().unwrap();
            }
            context.shutdown();

            assert_eq!(ran.load(Ordering::SeqCst), ok.load(Ordering::SeqCst));
            assert_eq!(
                ok.load(Ordering::SeqCst) + rejected.load(Ordering::SeqCst),
                100
            );
            assert_eq!(context.pending_operations(), 0);
        }
    }

    // ==========================================================================
    // TEST: Posts racing with shutdown never run afterwards
    // ==========================================================================

    #[test]
    fn test_no_post_runs_after_shutdown() {
        let context = context();
        let shut = Arc::new(AtomicBool::new(false));
        let late_runs = Arc::new(AtomicUsize::new(0));

        let posters: Vec<_> = (0..4)
            .map(|_| {
                let context = context.clone();
                let shut = shut.clone();
                let late_runs = late_runs.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let shut = shut.clone();
                        let late_runs = late_runs.clone();
                        context.post(move || {
                            if shut.load(Ordering::SeqCst) {
                                late_runs.fetch_add(1, Ordering::SeqCst);
                            }
                        });
                        jitter();
                    }
                })
            })
            .collect();

        for _ in 0..20 {
            context.process_pending_operations().unwrap();
            jitter();
        }
        context.shutdown();
        shut.store(true, Ordering::SeqCst);

        for poster in posters {
            poster.join().unwrap();
        }
        assert_eq!(context.process_pending_operations().unwrap(), 0);
        assert_eq!(context.pending_operations(), 0);
        assert_eq!(late_runs.load(Ordering::SeqCst), 0);
    }

    // ==========================================================================
    // TEST: Bus churn during publish
    // ==========================================================================
    //
    // Stable subscribers must see every publish exactly once while other
    // threads subscribe and unsubscribe around them.

    #[derive(Debug)]
    struct Tick;

    #[test]
    fn test_bus_stable_subscribers_survive_churn() {
        let bus = Arc::new(InProcessBus::new());
        let stable: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        for count in &stable {
            let count = count.clone();
            bus.subscribe(move |_: &Tick| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        let stop = Arc::new(AtomicBool::new(false));
        let churners: Vec<_> = (0..3)
            .map(|_| {
                let bus = bus.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        let token = bus.subscribe(|_: &Tick| {
                            if fastrand::u8(..16) == 0 {
                                panic!("churn handler failed");
                            }
                        });
                        jitter();
                        assert!(bus.unsubscribe(token));
                    }
                })
            })
            .collect();

        let publishers: Vec<_> = (0..2)
            .map(|_| {
                let bus = bus.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        assert!(bus.publish(&Tick) >= 3);
                        jitter();
                    }
                })
            })
            .collect();

        for publisher in publishers {
            publisher.join().unwrap();
        }
        stop.store(true, Ordering::SeqCst);
        for churner in churners {
            churner.join().unwrap();
        }

        for count in &stable {
            assert_eq!(count.load(Ordering::SeqCst), 500);
        }
        assert_eq!(bus.subscriber_count(), 3);
    }

    // ==========================================================================
    // TEST: Scheduler cancel vs fire
    // ==========================================================================
    //
    // A one-shot registration either fires or is cancelled, never both.

    #[test]
    fn test_scheduler_cancel_or_fire_never_both() {
        let scheduler = Arc::new(TimerScheduler::new(TimerQueue::new("stress-sched").unwrap()));
        let fired = Arc::new(AtomicUsize::new(0));

        let ids: Vec<_> = (0..200)
            .map(|_| {
                let fired = fired.clone();
                scheduler
                    .schedule_after(
                        Arc::new(move || {
                            fired.fetch_add(1, Ordering::SeqCst);
                        }),
                        Duration::from_micros(fastrand::u64(0..5_000)),
                    )
                    .unwrap()
            })
            .collect();

        let mut cancelled = 0;
        for id in ids {
            if fastrand::bool() && scheduler.cancel(id) {
                cancelled += 1;
            }
            jitter();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.scheduled_count() > 0 {
            assert!(Instant::now() < deadline, "registrations never drained");
            thread::sleep(Duration::from_millis(2));
        }
        thread::sleep(Duration::from_millis(10));
        assert_eq!(fired.load(Ordering::SeqCst) + cancelled, 200);
    }

    // ==========================================================================
    // TEST: Cancel racing resolve on an awaitable
    // ==========================================================================

    #[test]
    fn test_cancel_and_resolve_race_has_one_outcome() {
        for _ in 0..500 {
            let (promise, awaitable) = promise::channel::<u32>();
            let continuations = Arc::new(AtomicUsize::new(0));

            let resolver = thread::spawn(move || {
                jitter();
                promise.resolve(1);
            });
            jitter();
            awaitable.cancel();
            resolver.join().unwrap();

            let state = awaitable.state();
            assert!(matches!(
                state,
                AwaitableState::Ready | AwaitableState::Cancelled
            ));

            let counter = continuations.clone();
            awaitable.then(move |result| {
                match (state, result) {
                    (AwaitableState::Ready, Ok(1)) => {}
                    (AwaitableState::Cancelled, Err(MarshalError::Cancelled)) => {}
                    (state, result) => panic!("{:?} resolved as {:?}", state, result),
                }
                counter.fetch_add(1, Ordering::SeqCst);
            });
            assert_eq!(continuations.load(Ordering::SeqCst), 1);
        }
    }

    // ==========================================================================
    // TEST: Dispatcher producers with mixed priorities
    // ==========================================================================

    #[test]
    fn test_dispatcher_keeps_arrival_order_per_producer() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let priorities = [
            DispatchPriority::Low,
            DispatchPriority::Normal,
            DispatchPriority::High,
            DispatchPriority::Immediate,
        ];

        let producers: Vec<_> = (0..3)
            .map(|producer| {
                let dispatcher = dispatcher.clone();
                let seen = seen.clone();
                thread::spawn(move || {
                    for seq in 0..100 {
                        let seen = seen.clone();
                        dispatcher.invoke_with_priority(
                            Box::new(move || seen.lock().unwrap().push((producer, seq))),
                            priorities[fastrand::usize(..priorities.len())],
                        );
                        jitter();
                    }
                })
            })
            .collect();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut ran = 0;
        while ran < 300 {
            assert!(Instant::now() < deadline, "messages never arrived");
            ran += dispatcher.process_events().unwrap();
        }
        for producer in producers {
            producer.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        for producer in 0..3 {
            let order: Vec<_> = seen
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, seq)| *seq)
                .collect();
            assert_eq!(order, (0..100).collect::<Vec<_>>());
        }
    }

    // ==========================================================================
    // TEST: Executor under concurrent submission
    // ==========================================================================

    #[test]
    fn test_executor_concurrent_execute_async() {
        let config = MarshalConfig {
            worker_threads: 2,
            max_blocking_threads: 8,
            ..MarshalConfig::default()
        };
        let executor = Arc::new(RuntimeExecutor::from_config(&config).unwrap());

        let submitters: Vec<_> = (0..4)
            .map(|t| {
                let executor = executor.clone();
                thread::spawn(move || {
                    let awaitables: Vec<_> = (0..50)
                        .map(|i| {
                            executor.execute_async(move || {
                                jitter();
                                t * 1000 + i
                            })
                        })
                        .collect();
                    awaitables
                        .into_iter()
                        .enumerate()
                        .all(|(i, awaitable)| awaitable.wait().unwrap() == t * 1000 + i)
                })
            })
            .collect();

        for submitter in submitters {
            assert!(submitter.join().unwrap());
        }
        executor.wait_for_completion().unwrap();
        assert!(executor.is_idle());
    }
}

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use switchyard_core::{DispatchError, HandlingConfig, OverflowPolicy, Status};
use switchyard_events::{Dispatcher, Flow, Published};

#[derive(Debug, Clone, PartialEq)]
struct Reading {
    sensor: &'static str,
    value: u32,
}

fn reading(value: u32) -> Reading {
    Reading {
        sensor: "t1",
        value,
    }
}

fn config(name: &str) -> HandlingConfig {
    HandlingConfig::named(name).unwrap()
}

/// Shared "doors closed" flag that handlers spin on.
#[derive(Clone, Default)]
struct Gate(Arc<AtomicBool>);

impl Gate {
    fn wait(&self) {
        while !self.0.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn open(&self) {
        self.0.store(true, Ordering::Release);
    }
}

fn recorder(
    dispatcher: &Dispatcher,
    config: HandlingConfig,
    gate: Option<Gate>,
) -> Arc<Mutex<Vec<u32>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    dispatcher
        .subscribe(config, move |r: Reading| {
            if let Some(gate) = &gate {
                gate.wait();
            }
            s.lock().unwrap().push(r.value);
            Flow::Continue
        })
        .unwrap();
    seen
}

#[test]
fn unknown_event_type_is_dropped_with_no_subscribers() {
    let dispatcher = Dispatcher::new();
    let published = dispatcher.publish(reading(1)).unwrap();
    assert_eq!(published, Published::NoSubscribers);
    assert!(!published.status().is_failure());
}

#[test]
fn duplicate_name_is_rejected_and_first_handling_keeps_working() {
    let dispatcher = Dispatcher::new();
    let first = recorder(&dispatcher, config("audit"), None);

    let err = dispatcher
        .subscribe(config("audit").with_priority(99), |_: Reading| Flow::Continue)
        .unwrap_err();
    assert!(matches!(err, DispatchError::DuplicateHandling { .. }));
    assert_eq!(Status::from(&err), Status::DuplicateHandling);

    let infos = dispatcher.handlings::<Reading>();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].priority, config("audit").priority);

    assert_eq!(
        dispatcher.publish(reading(7)).unwrap(),
        Published::Queued { handlings: 1 }
    );
    assert!(dispatcher.wait_idle::<Reading>(Duration::from_secs(2)));
    assert_eq!(*first.lock().unwrap(), vec![7]);
}

#[test]
fn every_handling_receives_each_event_once() {
    let dispatcher = Dispatcher::new();
    let a = recorder(&dispatcher, config("a"), None);
    let b = recorder(&dispatcher, config("b").with_worker_count(3), None);

    for i in 0..50 {
        dispatcher.publish(reading(i)).unwrap();
    }
    assert!(dispatcher.wait_idle::<Reading>(Duration::from_secs(5)));

    let expected: Vec<u32> = (0..50).collect();
    assert_eq!(*a.lock().unwrap(), expected, "single worker keeps FIFO");
    let mut b = b.lock().unwrap().clone();
    b.sort_unstable();
    assert_eq!(b, expected);

    for info in dispatcher.handlings::<Reading>() {
        assert_eq!(info.stats.processed, 50, "{}", info.name);
        assert_eq!(info.queued, 0);
    }
}

#[test]
fn higher_priority_is_enqueued_first_and_can_hold_back_the_rest() {
    let dispatcher = Dispatcher::new();
    let gate = Gate::default();
    recorder(
        &dispatcher,
        config("urgent").with_priority(100).with_queue_capacity(1),
        Some(gate.clone()),
    );
    let relaxed = recorder(&dispatcher, config("relaxed").with_priority(1), None);

    // 1 is picked up by the gated worker, 2 then fills its single slot.
    dispatcher.publish(reading(1)).unwrap();
    thread::sleep(Duration::from_millis(100));
    dispatcher.publish(reading(2)).unwrap();

    let dispatcher = Arc::new(dispatcher);
    let d = dispatcher.clone();
    let publisher = thread::spawn(move || d.publish(reading(3)));

    thread::sleep(Duration::from_millis(150));
    assert!(!publisher.is_finished(), "publish must block on the full queue");
    assert_eq!(
        *relaxed.lock().unwrap(),
        vec![1, 2],
        "lower priority only sees 3 once the higher one accepted it"
    );

    gate.open();
    assert_eq!(
        publisher.join().unwrap().unwrap(),
        Published::Queued { handlings: 2 }
    );
    assert!(dispatcher.wait_idle::<Reading>(Duration::from_secs(2)));
    assert_eq!(*relaxed.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn ring_buffer_handling_never_blocks_and_keeps_newest() {
    let dispatcher = Dispatcher::new();
    let gate = Gate::default();
    let seen = recorder(
        &dispatcher,
        config("latest")
            .with_queue_capacity(2)
            .with_overflow(OverflowPolicy::DropOldest),
        Some(gate.clone()),
    );

    dispatcher.publish(reading(1)).unwrap();
    thread::sleep(Duration::from_millis(100));
    for i in 2..=5 {
        dispatcher.publish(reading(i)).unwrap();
    }

    let info = dispatcher.handling::<Reading>("latest").unwrap();
    assert_eq!(info.queued, 2);
    assert_eq!(info.dropped, 2);

    gate.open();
    assert!(dispatcher.wait_idle::<Reading>(Duration::from_secs(2)));
    assert_eq!(*seen.lock().unwrap(), vec![1, 4, 5]);
}

#[test]
fn handling_whose_workers_stop_no_longer_blocks_publishers() {
    let dispatcher = Arc::new(Dispatcher::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    dispatcher
        .subscribe(
            config("once").with_priority(100).with_queue_capacity(1),
            move |_: Reading| {
                c.fetch_add(1, Ordering::SeqCst);
                Flow::Stop
            },
        )
        .unwrap();
    let steady = recorder(&dispatcher, config("steady").with_priority(1), None);

    let d = dispatcher.clone();
    let publisher = thread::spawn(move || {
        for i in 1..=3 {
            d.publish(reading(i)).unwrap();
        }
    });
    for _ in 0..100 {
        if publisher.is_finished() {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert!(publisher.is_finished(), "publisher stuck on a handling with no workers");
    publisher.join().unwrap();

    assert_eq!(
        dispatcher.publish(reading(4)).unwrap(),
        Published::Queued { handlings: 1 }
    );
    assert!(dispatcher.wait_idle::<Reading>(Duration::from_secs(2)));
    assert_eq!(*steady.lock().unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let once = dispatcher.handling::<Reading>("once").unwrap();
    assert_eq!(once.stats.workers_alive, 0);
    assert_eq!(once.stats.stop_requests, 1);
    assert_eq!(once.queued, 0);
}

#[test]
fn shutdown_wakes_blocked_publisher_with_stopped() {
    let dispatcher = Dispatcher::new();
    dispatcher
        .subscribe(config("slow").with_queue_capacity(1), |_: Reading| {
            thread::sleep(Duration::from_millis(300));
            Flow::Continue
        })
        .unwrap();

    dispatcher.publish(reading(1)).unwrap();
    thread::sleep(Duration::from_millis(50));
    dispatcher.publish(reading(2)).unwrap();

    let dispatcher = Arc::new(dispatcher);
    let d = dispatcher.clone();
    let publisher = thread::spawn(move || d.publish(reading(3)));
    thread::sleep(Duration::from_millis(50));

    dispatcher.shutdown();
    assert_eq!(publisher.join().unwrap(), Err(DispatchError::Stopped));
    assert!(dispatcher.is_stopped());
    assert_eq!(dispatcher.publish(reading(4)), Err(DispatchError::Stopped));
}

#[test]
fn shutdown_is_idempotent_across_threads() {
    let dispatcher = Arc::new(Dispatcher::new());
    recorder(&dispatcher, config("a"), None);
    recorder(&dispatcher, config("b"), None);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let d = dispatcher.clone();
            thread::spawn(move || d.shutdown())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(dispatcher.is_stopped());
    assert_eq!(dispatcher.handling_count(), 0);
    let err = dispatcher
        .subscribe(config("late"), |_: Reading| Flow::Continue)
        .unwrap_err();
    assert_eq!(err, DispatchError::Stopped);
}

#[test]
fn panicking_handler_does_not_take_down_the_handling() {
    let dispatcher = Dispatcher::new();
    let ok = Arc::new(AtomicUsize::new(0));
    let o = ok.clone();
    dispatcher
        .subscribe(config("fragile"), move |r: Reading| {
            if r.value % 2 == 0 {
                panic!("even reading {}", r.value);
            }
            o.fetch_add(1, Ordering::SeqCst);
            Flow::Continue
        })
        .unwrap();

    for i in 0..10 {
        dispatcher.publish(reading(i)).unwrap();
    }
    assert!(dispatcher.wait_idle::<Reading>(Duration::from_secs(2)));

    assert_eq!(ok.load(Ordering::SeqCst), 5);
    let info = dispatcher.handling::<Reading>("fragile").unwrap();
    assert_eq!(info.stats.panics, 5);
    assert_eq!(info.stats.processed, 10);
}

#[test]
fn timed_out_handler_is_reported_and_worker_moves_on() {
    let dispatcher = Dispatcher::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    dispatcher
        .subscribe(
            config("deadline").with_timeout(Duration::from_millis(50)),
            move |r: Reading| {
                if r.value == 0 {
                    thread::sleep(Duration::from_millis(200));
                }
                s.lock().unwrap().push(r.value);
                Flow::Continue
            },
        )
        .unwrap();

    dispatcher.publish(reading(0)).unwrap();
    dispatcher.publish(reading(1)).unwrap();
    assert!(dispatcher.wait_idle::<Reading>(Duration::from_secs(2)));

    let info = dispatcher.handling::<Reading>("deadline").unwrap();
    assert_eq!(info.stats.timeouts, 1);
    assert_eq!(info.stats.completed, 1);
    // The abandoned run still finishes in the background.
    thread::sleep(Duration::from_millis(250));
    let mut seen = seen.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1]);
}

#[test]
fn concurrent_publishers_lose_nothing() {
    let dispatcher = Arc::new(Dispatcher::new());
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    dispatcher
        .subscribe(
            config("sink").with_worker_count(2).with_queue_capacity(8),
            move |r: Reading| {
                assert_eq!(r.sensor, "t1");
                c.fetch_add(1, Ordering::SeqCst);
                Flow::Continue
            },
        )
        .unwrap();

    let publishers: Vec<_> = (0..4)
        .map(|p| {
            let d = dispatcher.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    d.publish(reading(p * 1_000 + i)).unwrap();
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.join().unwrap();
    }

    assert!(dispatcher.wait_idle::<Reading>(Duration::from_secs(5)));
    assert_eq!(count.load(Ordering::SeqCst), 400);
}

#[test]
fn handling_info_serializes_with_millisecond_timeout() {
    let dispatcher = Dispatcher::new();
    let info = dispatcher
        .subscribe(
            config("json").with_timeout(Duration::from_millis(250)),
            |_: Reading| Flow::Continue,
        )
        .unwrap();

    let value = serde_json::to_value(&info).unwrap();
    assert_eq!(value["name"], "json");
    assert_eq!(value["timeout_ms"], 250);
    assert_eq!(value["overflow"], "block");
    assert_eq!(value["stats"]["processed"], 0);
}

//! Dispatch-order, isolation and lifecycle tests for the event bus.

use openracing_event_bus::{BusError, EventBus, HandlerError, SubscriptionHandle};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_test::traced_test;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn recorder() -> (Arc<Mutex<Vec<(usize, u32)>>>, impl Fn(usize) -> Box<dyn Fn(&u32) -> Result<(), HandlerError> + Send + Sync>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let log_for = Arc::clone(&log);
    let make = move |who: usize| {
        let log = Arc::clone(&log_for);
        Box::new(move |v: &u32| {
            log.lock().push((who, *v));
            Ok(())
        }) as Box<dyn Fn(&u32) -> Result<(), HandlerError> + Send + Sync>
    };
    (log, make)
}

// ── Fan-out ──────────────────────────────────────────────────────────────────

#[test]
fn test_subscribers_invoked_in_registration_order() -> TestResult {
    let bus: EventBus<&'static str, u32> = EventBus::new();
    let (log, make) = recorder();
    for who in 0..4 {
        bus.subscribe("frame", make(who))?;
    }

    let report = bus.publish(&"frame", &10);
    assert_eq!(report.delivered, 4);
    assert_eq!(report.failed, 0);
    assert_eq!(*log.lock(), vec![(0, 10), (1, 10), (2, 10), (3, 10)]);
    Ok(())
}

#[test]
fn test_topics_are_isolated() -> TestResult {
    let bus: EventBus<&'static str, u32> = EventBus::new();
    let (log, make) = recorder();
    bus.subscribe("a", make(0))?;
    bus.subscribe("b", make(1))?;

    bus.publish(&"b", &5);
    assert_eq!(*log.lock(), vec![(1, 5)]);
    Ok(())
}

// ── Failure isolation ────────────────────────────────────────────────────────

#[test]
#[traced_test]
fn test_failing_subscriber_does_not_stop_dispatch() -> TestResult {
    let bus: EventBus<&'static str, u32> = EventBus::new();
    let (log, make) = recorder();
    bus.subscribe("frame", make(0))?;
    bus.subscribe("frame", |_| Err(HandlerError::new("preset store offline")))?;
    bus.subscribe("frame", make(2))?;

    let report = bus.publish(&"frame", &1);
    assert_eq!(report.delivered, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(*log.lock(), vec![(0, 1), (2, 1)]);
    assert!(logs_contain("subscriber failed"));
    Ok(())
}

#[test]
#[traced_test]
#[expect(clippy::panic, reason = "the subscriber under test panics")]
fn test_panicking_subscriber_is_contained() -> TestResult {
    let bus: EventBus<&'static str, u32> = EventBus::new();
    let (log, make) = recorder();
    bus.subscribe("frame", |_| panic!("plugin bug"))?;
    bus.subscribe("frame", make(1))?;

    let report = bus.publish(&"frame", &9);
    assert_eq!(report.failed, 1);
    assert_eq!(*log.lock(), vec![(1, 9)]);
    assert!(logs_contain("plugin bug"));

    // The panicking subscriber stays registered and the bus stays usable.
    assert_eq!(bus.publish(&"frame", &10).delivered, 2);
    Ok(())
}

// ── Unsubscribe ──────────────────────────────────────────────────────────────

#[test]
fn test_unsubscribe_is_idempotent() -> TestResult {
    let bus: EventBus<u8, u32> = EventBus::new();
    let handle = bus.subscribe(1, |_| Ok(()))?;
    assert!(bus.unsubscribe(&handle));
    assert!(!bus.unsubscribe(&handle));
    bus.close();
    assert!(!bus.unsubscribe(&handle));
    Ok(())
}

#[test]
fn test_handler_can_unsubscribe_itself_mid_dispatch() -> TestResult {
    let bus: EventBus<u8, u32> = EventBus::new();
    let (log, make) = recorder();
    let own: Arc<Mutex<Option<SubscriptionHandle<u8>>>> = Arc::new(Mutex::new(None));

    let bus_in = bus.clone();
    let own_in = Arc::clone(&own);
    let log_in = Arc::clone(&log);
    let handle = bus.subscribe(1, move |v| {
        log_in.lock().push((0, *v));
        if let Some(h) = own_in.lock().take() {
            bus_in.unsubscribe(&h);
        }
        Ok(())
    })?;
    *own.lock() = Some(handle);
    bus.subscribe(1, make(1))?;

    bus.publish(&1, &1);
    bus.publish(&1, &2);
    assert_eq!(*log.lock(), vec![(0, 1), (1, 1), (1, 2)]);
    Ok(())
}

#[test]
fn test_subscriber_removed_mid_dispatch_is_skipped() -> TestResult {
    let bus: EventBus<u8, u32> = EventBus::new();
    let (log, make) = recorder();
    let victim: Arc<Mutex<Option<SubscriptionHandle<u8>>>> = Arc::new(Mutex::new(None));

    let bus_in = bus.clone();
    let victim_in = Arc::clone(&victim);
    bus.subscribe(1, move |_| {
        if let Some(h) = victim_in.lock().as_ref() {
            bus_in.unsubscribe(h);
        }
        Ok(())
    })?;
    *victim.lock() = Some(bus.subscribe(1, make(1))?);
    bus.subscribe(1, make(2))?;

    let report = bus.publish(&1, &7);
    assert_eq!(report.delivered, 2);
    assert_eq!(*log.lock(), vec![(2, 7)]);
    Ok(())
}

#[test]
fn test_handler_subscribing_mid_dispatch_sees_next_publish_only() -> TestResult {
    let bus: EventBus<u8, u32> = EventBus::new();
    let (log, make) = recorder();
    let bus_in = bus.clone();
    let added = Arc::new(Mutex::new(false));
    let make = Arc::new(make);
    let make_in = Arc::clone(&make);
    bus.subscribe(1, move |_| {
        let mut added = added.lock();
        if !*added {
            *added = true;
            bus_in.subscribe(1, make_in(9)).map_err(|e| HandlerError::new(e.to_string()))?;
        }
        Ok(())
    })?;

    bus.publish(&1, &1);
    bus.publish(&1, &2);
    assert_eq!(*log.lock(), vec![(9, 2)]);
    Ok(())
}

// ── Once and scoped subscriptions ────────────────────────────────────────────

#[test]
fn test_subscribe_once_fires_once() -> TestResult {
    let bus: EventBus<u8, u32> = EventBus::new();
    let hits = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&hits);
    bus.subscribe_once(1, move |v| {
        sink.lock().push(*v);
        Ok(())
    })?;

    bus.publish(&1, &1);
    bus.publish(&1, &2);
    assert_eq!(*hits.lock(), vec![1]);
    assert_eq!(bus.subscriber_count(&1), 0);
    Ok(())
}

#[test]
fn test_scoped_subscription_unsubscribes_on_drop() -> TestResult {
    let bus: EventBus<u8, u32> = EventBus::new();
    {
        let _guard = bus.subscribe_scoped(1, |_| Ok(()))?;
        assert_eq!(bus.subscriber_count(&1), 1);
    }
    assert_eq!(bus.subscriber_count(&1), 0);
    Ok(())
}

#[test]
fn test_scoped_subscription_outliving_bus() -> TestResult {
    let bus: EventBus<u8, u32> = EventBus::new();
    let guard = bus.subscribe_scoped(1, |_| Ok(()))?;
    drop(bus);
    drop(guard);
    Ok(())
}

// ── Teardown ─────────────────────────────────────────────────────────────────

#[test]
fn test_close_drops_everything() -> TestResult {
    let bus: EventBus<u8, u32> = EventBus::new();
    let (log, make) = recorder();
    bus.subscribe(1, make(0))?;
    bus.close();

    assert_eq!(bus.publish(&1, &1).delivered, 0);
    assert!(log.lock().is_empty());
    assert!(matches!(bus.subscribe(1, |_| Ok(())), Err(BusError::Closed)));
    Ok(())
}

// ── Concurrency ──────────────────────────────────────────────────────────────

#[test]
fn test_concurrent_publishers_each_delivered_once() -> TestResult {
    let bus: EventBus<u8, u32> = EventBus::new();
    let total = Arc::new(Mutex::new(0u32));
    for _ in 0..3 {
        let total = Arc::clone(&total);
        bus.subscribe(1, move |v| {
            *total.lock() += *v;
            Ok(())
        })?;
    }

    let mut handles = vec![];
    for _ in 0..8 {
        let bus = bus.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..100 {
                bus.publish(&1, &1);
            }
        }));
    }
    for handle in handles {
        assert!(handle.join().is_ok(), "publisher thread should not panic");
    }
    assert_eq!(*total.lock(), 3 * 8 * 100);
    Ok(())
}

#[test]
fn test_wait_for_returns_published_value() -> TestResult {
    let bus: EventBus<&'static str, u32> = EventBus::new();
    let publisher = bus.clone();
    let value = bus.wait_for("reply", Duration::from_secs(5), || {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            publisher.publish(&"reply", &42);
        });
    })?;
    assert_eq!(value, Some(42));
    assert_eq!(bus.subscriber_count(&"reply"), 0);
    Ok(())
}

#[test]
fn test_wait_for_times_out() -> TestResult {
    let bus: EventBus<&'static str, u32> = EventBus::new();
    assert_eq!(bus.wait_for("reply", Duration::from_millis(20), || {})?, None);
    Ok(())
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(64))]

    /// N subscribers each observe every publish exactly once, in order, even
    /// when one of them fails every time.
    #[test]
    fn prop_fan_out(n in 1usize..8, failing in any::<prop::sample::Index>(), values in prop::collection::vec(any::<u32>(), 1..16)) {
        let bus: EventBus<u8, u32> = EventBus::new();
        let bad = failing.index(n);
        let (log, make) = recorder();
        for who in 0..n {
            let ok = make(who);
            let result = if who == bad {
                bus.subscribe(0, move |v| {
                    ok(v)?;
                    Err(HandlerError::new("always fails"))
                })
            } else {
                bus.subscribe(0, ok)
            };
            prop_assert!(result.is_ok());
        }

        for v in &values {
            let report = bus.publish(&0, v);
            prop_assert_eq!(report.delivered, n);
            prop_assert_eq!(report.failed, 1);
        }

        let expected: Vec<(usize, u32)> = values
            .iter()
            .flat_map(|v| (0..n).map(move |who| (who, *v)))
            .collect();
        prop_assert_eq!(&*log.lock(), &expected);
    }
}

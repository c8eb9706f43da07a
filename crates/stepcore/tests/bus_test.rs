use stepcore::{
    handler_fn, BusConfig, BusRecord, Delivery, Event, EventBus, StepError, SubscriptionSpec,
    TraceContext,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

fn explode() -> Result<(), StepError> {
    panic!("handler bug")
}

fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn stepcore::EventHandler> {
    handler_fn(move |_event: Event, _delivery: Delivery| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

#[tokio::test]
async fn delivers_only_to_matching_subscribers() {
    init_tracing();
    let bus = EventBus::default();
    let exact = Arc::new(AtomicUsize::new(0));
    let prefix = Arc::new(AtomicUsize::new(0));
    let any = Arc::new(AtomicUsize::new(0));
    let other = Arc::new(AtomicUsize::new(0));

    bus.subscribe("order.created", counting_handler(exact.clone()));
    bus.subscribe("order.*", counting_handler(prefix.clone()));
    bus.subscribe("*", counting_handler(any.clone()));
    bus.subscribe("order.*.created", counting_handler(other.clone()));
    bus.subscribe("orderline.*", counting_handler(other.clone()));

    let outcomes = bus
        .publish(Event::new("order.created", serde_json::json!({"id": 1})), TraceContext::new())
        .await;

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.is_ok()));
    assert_eq!(exact.load(Ordering::SeqCst), 1);
    assert_eq!(prefix.load(Ordering::SeqCst), 1);
    assert_eq!(any.load(Ordering::SeqCst), 1);
    assert_eq!(other.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failing_subscribers_do_not_affect_siblings() {
    init_tracing();
    let bus = EventBus::default();
    let delivered = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        bus.subscribe("job.done", counting_handler(delivered.clone()));
    }
    bus.subscribe_as(
        "always-fails",
        "job.done",
        handler_fn(|_event, _delivery| async { Err(StepError::ExecutionFailed("boom".into())) }),
    );
    bus.subscribe_as(
        "panics",
        "job.*",
        handler_fn(|_event, _delivery| async { explode() }),
    );

    let outcomes = tokio::time::timeout(
        Duration::from_secs(5),
        bus.publish(Event::new("job.done", serde_json::Value::Null), TraceContext::new()),
    )
    .await
    .expect("publish must resolve");

    assert_eq!(outcomes.len(), 5);
    assert_eq!(delivered.load(Ordering::SeqCst), 3);

    let failed: Vec<_> = outcomes.iter().filter(|o| !o.is_ok()).collect();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().any(|o| o.step_id == "always-fails"
        && o.result == Err(StepError::ExecutionFailed("boom".into()))));
    assert!(failed
        .iter()
        .any(|o| o.step_id == "panics" && matches!(o.result, Err(StepError::Panicked(_)))));
}

#[tokio::test]
async fn subscribers_run_concurrently() {
    let bus = EventBus::default();
    let barrier = Arc::new(Barrier::new(2));

    for _ in 0..2 {
        let barrier = barrier.clone();
        bus.subscribe(
            "sync.point",
            handler_fn(move |_event, _delivery| {
                let barrier = barrier.clone();
                async move {
                    // Deadlocks unless both handlers are in flight at the same time.
                    barrier.wait().await;
                    Ok(())
                }
            }),
        );
    }

    let outcomes = tokio::time::timeout(
        Duration::from_secs(5),
        bus.publish(Event::new("sync.point", serde_json::Value::Null), TraceContext::new()),
    )
    .await
    .expect("handlers should not block each other");

    assert_eq!(outcomes.len(), 2);
}

fn labelled_specs(label: &str, count: usize) -> Vec<SubscriptionSpec> {
    (0..count)
        .map(|i| SubscriptionSpec {
            step_id: format!("{}-{}", label, i),
            pattern: "tick".to_string(),
            handler: handler_fn(|_event, _delivery| async {
                tokio::task::yield_now().await;
                Ok(())
            }),
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registry_swap_is_observed_atomically() {
    let bus = EventBus::default();
    bus.replace_registry_subscriptions(labelled_specs("old", 3));

    let swapper = {
        let bus = bus.clone();
        tokio::spawn(async move {
            for round in 0..200 {
                let label = if round % 2 == 0 { "new" } else { "old" };
                bus.replace_registry_subscriptions(labelled_specs(label, 3));
                tokio::task::yield_now().await;
            }
        })
    };

    let mut publishers = Vec::new();
    for _ in 0..4 {
        let bus = bus.clone();
        publishers.push(tokio::spawn(async move {
            for _ in 0..100 {
                let outcomes = bus
                    .publish(Event::new("tick", serde_json::Value::Null), TraceContext::new())
                    .await;
                assert_eq!(outcomes.len(), 3);
                let old = outcomes.iter().filter(|o| o.step_id.starts_with("old")).count();
                assert!(old == 0 || old == 3, "mixed subscriber sets: {:?}", outcomes);
            }
        }));
    }

    swapper.await.unwrap();
    for publisher in publishers {
        publisher.await.unwrap();
    }
}

#[tokio::test]
async fn manual_subscriptions_survive_registry_replacement() {
    let bus = EventBus::default();
    let manual = Arc::new(AtomicUsize::new(0));
    let id = bus.subscribe("ping", counting_handler(manual.clone()));

    bus.replace_registry_subscriptions(labelled_specs("reg", 2));
    bus.replace_registry_subscriptions(labelled_specs("reg2", 1));

    let outcomes = bus
        .publish(Event::new("ping", serde_json::Value::Null), TraceContext::new())
        .await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(manual.load(Ordering::SeqCst), 1);

    bus.unsubscribe(id).unwrap();
    assert!(bus.unsubscribe(id).is_err());
    let outcomes = bus
        .publish(Event::new("ping", serde_json::Value::Null), TraceContext::new())
        .await;
    assert!(outcomes.is_empty());
}

#[tokio::test]
async fn emitted_events_inherit_trace_id() {
    let bus = EventBus::default();
    let seen = Arc::new(Mutex::new(Vec::new()));

    bus.subscribe_as(
        "orders/create",
        "order.requested",
        handler_fn(|_event, delivery: Delivery| async move {
            let flows: BTreeSet<String> = ["orders".to_string()].into_iter().collect();
            delivery
                .emitter("orders/create", &flows)
                .emit("order.created", serde_json::json!({"id": 9}));
            Ok(())
        }),
    );

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    {
        let seen = seen.clone();
        bus.subscribe(
            "order.created",
            handler_fn(move |event: Event, delivery: Delivery| {
                let seen = seen.clone();
                let tx = tx.clone();
                async move {
                    seen.lock().unwrap().push((event.trace_id.clone(), delivery.trace.clone()));
                    let _ = tx.send(());
                    Ok(())
                }
            }),
        );
    }

    let trace = TraceContext::with_trace_id("trace-42");
    bus.publish(Event::new("order.requested", serde_json::Value::Null), trace)
        .await;
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("downstream event should be delivered");

    let seen = seen.lock().unwrap();
    let (trace_id, context) = &seen[0];
    assert_eq!(trace_id, "trace-42");
    assert_eq!(context.trace_id, "trace-42");
    assert_eq!(context.origin_step.as_deref(), Some("orders/create"));
    assert_eq!(context.depth, 1);
    assert!(context.flows.contains("orders"));
}

#[tokio::test]
async fn depth_guard_stops_self_triggering_chain() {
    let bus = EventBus::new(BusConfig {
        tap_capacity: 64,
        max_emit_depth: 3,
    });
    let mut tap = bus.tap();
    let calls = Arc::new(AtomicUsize::new(0));

    {
        let calls = calls.clone();
        bus.subscribe_as(
            "looper",
            "loop",
            handler_fn(move |event: Event, delivery: Delivery| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    delivery.emitter("looper", &BTreeSet::new()).emit("loop", event.data);
                    Ok(())
                }
            }),
        );
    }

    bus.publish(Event::new("loop", serde_json::Value::Null), TraceContext::new())
        .await;

    let dropped = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match tap.recv().await {
                Ok(BusRecord::Dropped { step_id, .. }) => return step_id,
                Ok(_) => continue,
                Err(e) => panic!("tap closed: {}", e),
            }
        }
    })
    .await
    .expect("chain should be cut");

    assert_eq!(dropped.as_deref(), Some("looper"));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn publish_without_subscribers_is_a_noop() {
    let bus = EventBus::default();
    let mut tap = bus.tap();

    let outcomes = bus
        .publish(Event::new("nobody.listens", serde_json::Value::Null), TraceContext::new())
        .await;

    assert!(outcomes.is_empty());
    match tap.recv().await.unwrap() {
        BusRecord::Published { subscribers, event, .. } => {
            assert_eq!(subscribers, 0);
            assert!(!event.trace_id.is_empty());
        }
        other => panic!("unexpected record {:?}", other),
    }
}

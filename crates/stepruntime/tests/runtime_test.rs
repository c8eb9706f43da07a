mod support;

use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stepcore::{handler_fn, Delivery, Event};
use std::path::PathBuf;
use stepruntime::{
    RawStepDescriptor, RegistryError, RuntimeConfig, RuntimeError, ScheduleError, StaticStepSource, StepRuntime,
    StepSource,
};
use support::{calls_for, init_tracing, recording_registry};

fn write_step(root: &Path, id: &str, manifest: serde_json::Value) {
    let path = root.join(format!("{}.step.json", id));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, manifest.to_string()).unwrap();
}

fn fs_runtime(root: &Path) -> (StepRuntime, support::CallLog) {
    init_tracing();
    let (handlers, log) = recording_registry();
    let config = RuntimeConfig::default().with_roots([root.to_path_buf()]);
    (StepRuntime::new(config, handlers), log)
}

#[tokio::test]
async fn load_skips_broken_units_and_keeps_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_step(root, "orders/create", json!({"path": "/orders", "method": "POST", "handler": "builtin:record"}));
    write_step(root, "orders/recreate", json!({"path": "/orders", "method": "POST", "handler": "builtin:record"}));
    write_step(root, "audit", json!({"subscribes": ["order.*"], "handler": "builtin:record", "flows": ["orders"]}));
    write_step(root, "ghost", json!({"subscribes": ["order.*"], "handler": "builtin:missing"}));
    std::fs::write(root.join("broken.step.json"), "{ nope").unwrap();

    let (runtime, _log) = fs_runtime(root);
    let report = runtime.load().await.unwrap();

    assert_eq!(report.loaded, 2);
    assert_eq!(report.skipped.len(), 3);
    assert!(report
        .skipped
        .iter()
        .any(|e| matches!(e, RegistryError::RouteConflict { step_id, existing, .. }
            if step_id == "orders/recreate" && existing == "orders/create")));
    assert!(report.skipped.iter().any(|e| matches!(e, RegistryError::Malformed { step_id, .. } if step_id == "broken")));
    assert!(report
        .skipped
        .iter()
        .any(|e| matches!(e, RegistryError::UnknownHandler { step_id, .. } if step_id == "ghost")));

    let snapshot = runtime.snapshot();
    assert!(snapshot.registry().get("orders/create").is_some());
    assert_eq!(snapshot.registry().flow("orders").unwrap().steps, vec!["audit".to_string()]);
}

#[tokio::test]
async fn emitted_events_inherit_the_trace() {
    let source = StaticStepSource::new()
        .with_unit("first", "/s", r#"{"subscribes": ["start"], "handler": "builtin:record", "config": {"emit": "middle"}, "flows": ["chain"]}"#)
        .with_unit("second", "/s", r#"{"subscribes": ["middle"], "handler": "builtin:record", "config": {"emit": "end"}}"#)
        .with_unit("third", "/s", r#"{"subscribes": ["end"], "handler": "builtin:record"}"#);
    init_tracing();
    let (handlers, log) = recording_registry();
    let runtime = StepRuntime::with_source(RuntimeConfig::default(), handlers, Arc::new(source));
    runtime.load().await.unwrap();

    let outcomes = runtime
        .publish(Event::new("start", json!({"n": 1})).with_trace("chain-trace"))
        .await;
    assert_eq!(outcomes.len(), 1);

    for _ in 0..100 {
        if !calls_for(&log, "third").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let calls = log.lock().unwrap().clone();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.trace_id == "chain-trace"));
    assert!(calls.iter().all(|c| c.data == json!({"n": 1})));
    assert_eq!(calls_for(&log, "third")[0].origin_step.as_deref(), Some("second"));
}

#[tokio::test]
async fn self_triggering_chain_is_cut_at_the_depth_limit() {
    let source = StaticStepSource::new().with_unit(
        "looper",
        "/s",
        r#"{"subscribes": ["loop"], "emits": ["loop"], "handler": "builtin:record", "config": {"emit": "loop"}}"#,
    );
    init_tracing();
    let (handlers, log) = recording_registry();
    let config = RuntimeConfig {
        max_emit_depth: 4,
        ..RuntimeConfig::default()
    };
    let runtime = StepRuntime::with_source(config, handlers, Arc::new(source));
    let report = runtime.load().await.unwrap();
    assert_eq!(report.cycles, vec![vec!["looper".to_string()]]);

    runtime.publish(Event::new("loop", json!(null))).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // the published event plus four emitted hops
    assert_eq!(calls_for(&log, "looper").len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reload_swaps_subscribers_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    for id in ["a1", "a2"] {
        write_step(&root, id, json!({"subscribes": ["x"], "handler": "builtin:record"}));
    }

    let (runtime, _log) = fs_runtime(&root);
    let runtime = Arc::new(runtime);
    runtime.load().await.unwrap();

    let manual = Arc::new(AtomicUsize::new(0));
    {
        let manual = manual.clone();
        runtime.bus().subscribe(
            "x",
            handler_fn(move |_: Event, _: Delivery| {
                let manual = manual.clone();
                async move {
                    manual.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
    }

    let publisher = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..200 {
                let outcomes = runtime.publish(Event::new("x", json!({}))).await;
                let steps: BTreeSet<String> = outcomes
                    .into_iter()
                    .map(|o| o.step_id)
                    .filter(|s| s != "manual")
                    .collect();
                seen.push(steps);
                tokio::task::yield_now().await;
            }
            seen
        })
    };

    for id in ["a1", "a2"] {
        std::fs::remove_file(root.join(format!("{}.step.json", id))).unwrap();
    }
    for id in ["b1", "b2"] {
        write_step(&root, id, json!({"subscribes": ["x"], "handler": "builtin:record"}));
    }
    let report = runtime.reload().await.unwrap();
    assert_eq!(report.loaded, 2);

    let before: BTreeSet<String> = ["a1", "a2"].iter().map(|s| s.to_string()).collect();
    let after: BTreeSet<String> = ["b1", "b2"].iter().map(|s| s.to_string()).collect();
    for steps in publisher.await.unwrap() {
        assert!(steps == before || steps == after, "mixed subscriber set {:?}", steps);
    }

    let outcomes = runtime.publish(Event::new("x", json!({}))).await;
    let steps: BTreeSet<String> = outcomes.iter().map(|o| o.step_id.clone()).collect();
    assert!(steps.contains("b1") && steps.contains("b2") && steps.contains("manual"));
    assert_eq!(manual.load(Ordering::SeqCst), 201);
}

/// Each discovery yields a fresh generation with one step, `gen-<n>`.
/// The first discovery is slow.
struct GenerationSource {
    calls: AtomicUsize,
}

impl StepSource for GenerationSource {
    fn discover(&self, roots: &[PathBuf]) -> Vec<Result<RawStepDescriptor, RegistryError>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 1 {
            std::thread::sleep(Duration::from_millis(300));
        }
        StaticStepSource::new()
            .with_unit(format!("gen-{}", n), "/s", r#"{"subscribes": ["x"], "handler": "builtin:record"}"#)
            .discover(roots)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reloads_apply_one_generation_at_a_time() {
    init_tracing();
    let (handlers, _log) = recording_registry();
    let source = Arc::new(GenerationSource {
        calls: AtomicUsize::new(0),
    });
    let runtime = Arc::new(StepRuntime::with_source(RuntimeConfig::default(), handlers, source));

    let slow = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.reload().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fast = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.reload().await })
    };
    slow.await.unwrap().unwrap();
    fast.await.unwrap().unwrap();

    // the later discovery is the one left standing, on the bus and in the snapshot
    let snapshot: Vec<String> = runtime.snapshot().registry().steps().iter().map(|s| s.id.clone()).collect();
    assert_eq!(snapshot, vec!["gen-2".to_string()]);
    let subscribed: Vec<String> = runtime
        .bus()
        .subscriptions()
        .iter()
        .map(|s| s.step_id.clone())
        .collect();
    assert_eq!(subscribed, snapshot);

    let outcomes = runtime.publish(Event::new("x", json!({}))).await;
    let steps: Vec<&str> = outcomes.iter().map(|o| o.step_id.as_str()).collect();
    assert_eq!(steps, vec!["gen-2"]);
}

#[tokio::test(start_paused = true)]
async fn scheduler_ticks_until_stopped_and_names_bad_schedules() {
    let source = StaticStepSource::new()
        .with_unit("heartbeat", "/s", r#"{"interval": "1s", "eventType": "heartbeat.tick", "flows": ["ops"]}"#)
        .with_unit("nonsense", "/s", r#"{"interval": "abc", "eventType": "never"}"#)
        .with_unit("monitor", "/s", r#"{"subscribes": ["heartbeat.tick"], "handler": "builtin:record"}"#);
    init_tracing();
    let (handlers, log) = recording_registry();
    let runtime = StepRuntime::with_source(RuntimeConfig::default(), handlers, Arc::new(source));
    runtime.load().await.unwrap();

    let err = runtime.start_scheduler().await.unwrap_err();
    match err {
        RuntimeError::Schedule(e @ ScheduleError::StartFailed(_)) => {
            assert_eq!(e.schedule_ids(), vec!["nonsense"]);
        }
        other => panic!("unexpected error {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let ticks = calls_for(&log, "monitor");
    assert!((2..=3).contains(&ticks.len()), "got {} ticks", ticks.len());
    assert_eq!(ticks[0].data["scheduleId"], "heartbeat");
    assert!(ticks[0].data["scheduledAt"].is_string());
    assert_ne!(ticks[0].trace_id, ticks[1].trace_id);

    runtime.stop_scheduler().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stopped_at = calls_for(&log, "monitor").len();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(calls_for(&log, "monitor").len(), stopped_at);
}

#[tokio::test]
async fn shutdown_is_final() {
    let (handlers, _log) = recording_registry();
    let runtime = StepRuntime::with_source(RuntimeConfig::default(), handlers, Arc::new(StaticStepSource::new()));
    runtime.load().await.unwrap();

    runtime.shutdown().await;

    assert!(matches!(runtime.reload().await, Err(RuntimeError::ShutDown)));
    assert!(runtime.snapshot().registry().is_empty());
}

// crates/flowruntime/tests/runner_test.rs

mod common;

use common::{emit_to_record, init_tracing, node, registry, wait_for, wait_for_log, Probe};
use flowcore::{Collaborators, ExecutionEvent, ExecutionStatus, FlowDefinition, FlowError, LifecyclePhase};
use flowruntime::{FlowRunner, FlowStore, MemoryFlowStore, RuntimeConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn start(
    definition: FlowDefinition,
    probe: &Probe,
    store: Arc<MemoryFlowStore>,
    config: &RuntimeConfig,
) -> Result<FlowRunner, FlowError> {
    let registry = registry(probe);
    let collaborators = config.collaborators();
    FlowRunner::start(Arc::new(definition), &registry, &collaborators, store, config).await
}

#[tokio::test]
async fn test_message_emitted_during_start_reaches_target() {
    init_tracing();
    let probe = Probe::default();
    let store = Arc::new(MemoryFlowStore::new());
    let config = RuntimeConfig::default();

    let mut runner = start(emit_to_record("f1", json!(42)), &probe, store.clone(), &config)
        .await
        .unwrap();
    assert!(runner.is_running());
    assert_eq!(runner.node_ids(), vec!["source".to_string(), "sink".to_string()]);

    assert!(wait_for(|| probe.received_by("sink") == vec![json!(42)]).await);

    let records = wait_for_log(store.as_ref(), "f1", 1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].node_id, "sink");
    assert_eq!(records[0].status, ExecutionStatus::Success);
    assert_eq!(records[0].input_snapshot["payload"], json!(42));
    assert_eq!(records[0].output_snapshot, serde_json::Value::Null);

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn test_all_nodes_initialized_before_any_start() {
    let probe = Probe::default();
    let store = Arc::new(MemoryFlowStore::new());

    let mut runner = start(emit_to_record("order", json!(1)), &probe, store, &RuntimeConfig::default())
        .await
        .unwrap();
    runner.stop().await.unwrap();

    assert_eq!(
        probe.calls(),
        vec![
            "source:initialize",
            "sink:initialize",
            "source:start",
            "sink:start",
            "source:stop",
            "sink:stop",
            "source:cleanup",
            "sink:cleanup",
        ]
    );
}

#[tokio::test]
async fn test_failing_target_does_not_block_sibling() {
    init_tracing();
    let probe = Probe::default();
    let store = Arc::new(MemoryFlowStore::new());

    let mut definition = FlowDefinition::new("fan out").with_id("fan");
    definition.add_node(node("a", "test.emit").with_config("payload", "hello"));
    definition.add_node(node("b", "test.fail"));
    definition.add_node(node("c", "test.record"));
    definition.connect("a", "out", "b", "in");
    definition.connect("a", "out", "c", "in");

    let mut runner = start(definition, &probe, store.clone(), &RuntimeConfig::default())
        .await
        .unwrap();

    let records = wait_for_log(store.as_ref(), "fan", 2).await;
    assert_eq!(records.len(), 2);

    let b = records.iter().find(|r| r.node_id == "b").expect("record for b");
    assert_eq!(b.status, ExecutionStatus::Error);
    assert!(b.error.as_deref().unwrap_or_default().contains("refused"));

    let c = records.iter().find(|r| r.node_id == "c").expect("record for c");
    assert_eq!(c.status, ExecutionStatus::Success);
    assert_eq!(probe.received_by("c"), vec![json!("hello")]);

    assert!(runner.is_running());
    runner.stop().await.unwrap();
}

#[tokio::test]
async fn test_panicking_node_is_contained() {
    let probe = Probe::default();
    let store = Arc::new(MemoryFlowStore::new());

    let mut definition = FlowDefinition::new("panics").with_id("panics");
    definition.add_node(node("a", "test.emit").with_config("payload", 1));
    definition.add_node(node("boom", "test.panic"));
    definition.add_node(node("ok", "test.record"));
    definition.connect("a", "out", "boom", "in");
    definition.connect("a", "out", "ok", "in");

    let mut runner = start(definition, &probe, store.clone(), &RuntimeConfig::default())
        .await
        .unwrap();

    let records = wait_for_log(store.as_ref(), "panics", 2).await;
    let boom = records.iter().find(|r| r.node_id == "boom").expect("record for boom");
    assert_eq!(boom.status, ExecutionStatus::Error);
    assert!(boom.error.as_deref().unwrap_or_default().contains("blew up"));
    assert_eq!(probe.received_by("ok"), vec![json!(1)]);

    // The panicked node is still stopped and cleaned up normally
    runner.stop().await.unwrap();
    assert_eq!(probe.count("boom:stop"), 1);
    assert_eq!(probe.count("boom:cleanup"), 1);
}

#[tokio::test]
async fn test_start_failure_rolls_back_started_nodes() {
    let probe = Probe::default();
    let store = Arc::new(MemoryFlowStore::new());

    let mut definition = FlowDefinition::new("bad start").with_id("bad-start");
    definition.add_node(node("src", "test.emit").with_config("payload", 1));
    definition.add_node(node("rec", "test.record"));
    definition.add_node(node("bad", "test.fail_start"));
    definition.connect("src", "out", "rec", "in");

    let result = start(definition, &probe, store, &RuntimeConfig::default()).await;
    match result {
        Err(FlowError::NodeLifecycle { node_id, phase, .. }) => {
            assert_eq!(node_id, "bad");
            assert_eq!(phase, LifecyclePhase::Start);
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("flow should not start"),
    }

    assert_eq!(probe.count("src:stop"), 1);
    assert_eq!(probe.count("rec:stop"), 1);
    assert_eq!(probe.count("bad:stop"), 0, "never started, never stopped");
    for id in ["src", "rec", "bad"] {
        assert_eq!(probe.count(&format!("{id}:cleanup")), 1, "{id} not cleaned up");
    }
}

#[tokio::test]
async fn test_initialize_failure_cleans_up_created_nodes() {
    let probe = Probe::default();
    let store = Arc::new(MemoryFlowStore::new());

    let mut definition = FlowDefinition::new("bad init").with_id("bad-init");
    definition.add_node(node("first", "test.record"));
    definition.add_node(node("broken", "test.fail_init"));
    definition.add_node(node("never", "test.record"));

    let result = start(definition, &probe, store, &RuntimeConfig::default()).await;
    assert!(matches!(
        result,
        Err(FlowError::NodeLifecycle {
            phase: LifecyclePhase::Initialize,
            ..
        })
    ));

    assert_eq!(probe.count("first:cleanup"), 1);
    assert_eq!(probe.count("broken:cleanup"), 1);
    assert_eq!(probe.count("never:initialize"), 0);
    assert!(probe.calls().iter().all(|c| !c.ends_with(":start")));
}

#[tokio::test]
async fn test_unknown_node_type_is_rejected() {
    let probe = Probe::default();
    let store = Arc::new(MemoryFlowStore::new());

    let mut definition = FlowDefinition::new("unknown").with_id("unknown");
    definition.add_node(node("ok", "test.record"));
    definition.add_node(node("what", "does.not.exist"));

    let result = start(definition, &probe, store, &RuntimeConfig::default()).await;
    assert!(matches!(result, Err(FlowError::UnknownNodeType(t)) if t == "does.not.exist"));
    assert_eq!(probe.count("ok:cleanup"), 1);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let probe = Probe::default();
    let store = Arc::new(MemoryFlowStore::new());
    let config = RuntimeConfig::default();
    let collaborators = Collaborators::in_process(64, 64);
    let mut events = collaborators.events.subscribe();

    let registry = registry(&probe);
    let mut runner = FlowRunner::start(
        Arc::new(emit_to_record("twice", json!(null))),
        &registry,
        &collaborators,
        store,
        &config,
    )
    .await
    .unwrap();
    assert_eq!(runner.flow_id(), "twice");
    assert_eq!(runner.definition().nodes.len(), 2);

    runner.stop().await.unwrap();
    runner.stop().await.unwrap();
    assert!(!runner.is_running());
    assert_eq!(probe.count("source:stop"), 1);
    assert_eq!(probe.count("sink:cleanup"), 1);

    let mut stopped = 0;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.flow_id(), "twice");
        if let ExecutionEvent::FlowStopped { flow_id, .. } = event {
            assert_eq!(flow_id, "twice");
            stopped += 1;
        }
    }
    assert_eq!(stopped, 1);
}

#[tokio::test]
async fn test_cycle_is_bounded_by_hop_limit() {
    let probe = Probe::default();
    let store = Arc::new(MemoryFlowStore::new());
    let config = RuntimeConfig {
        max_hops: 8,
        ..RuntimeConfig::default()
    };

    let mut definition = FlowDefinition::new("loop").with_id("loop");
    definition.add_node(node("src", "test.emit").with_config("payload", "around"));
    definition.add_node(node("ping", "test.record").with_config("forward", true));
    definition.add_node(node("pong", "test.record").with_config("forward", true));
    definition.connect("src", "out", "ping", "in");
    definition.connect("ping", "out", "pong", "in");
    definition.connect("pong", "out", "ping", "in");

    let mut runner = start(definition, &probe, store.clone(), &config).await.unwrap();

    let dropped = wait_for(|| probe.total_received() >= 8).await;
    assert!(dropped);

    // Give a runaway loop time to show itself
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(probe.total_received(), 8);
    assert_eq!(probe.received_by("ping").len(), 4);
    assert_eq!(probe.received_by("pong").len(), 4);

    let records = store.execution_log("loop", usize::MAX).await.unwrap();
    let errors: Vec<_> = records
        .iter()
        .filter(|r| r.status == ExecutionStatus::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].node_id, "pong");

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn test_reported_errors_are_logged_against_the_reporter() {
    let probe = Probe::default();
    let store = Arc::new(MemoryFlowStore::new());

    let mut definition = emit_to_record("noisy", json!("reading"));
    definition.nodes[0] = node("source", "test.emit")
        .with_config("payload", "reading")
        .with_config("report", "sensor offline");

    let mut runner = start(definition, &probe, store.clone(), &RuntimeConfig::default())
        .await
        .unwrap();

    let records = wait_for_log(store.as_ref(), "noisy", 2).await;
    assert_eq!(records.len(), 2);

    let error = records
        .iter()
        .find(|r| r.status == ExecutionStatus::Error)
        .expect("reported error should be logged");
    assert_eq!(error.node_id, "source");
    assert!(error.error.as_deref().unwrap_or_default().contains("sensor offline"));
    assert!(error.input_snapshot.is_null());

    // The report does not stop delivery
    assert_eq!(probe.received_by("sink"), vec![json!("reading")]);

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn test_outputs_are_attached_to_the_triggering_record() {
    let probe = Probe::default();
    let store = Arc::new(MemoryFlowStore::new());

    let mut definition = FlowDefinition::new("chain").with_id("chain");
    definition.add_node(node("src", "test.emit").with_config("payload", 5));
    definition.add_node(node("relay", "test.record").with_config("forward", true));
    definition.add_node(node("end", "test.record"));
    definition.connect("src", "out", "relay", "in");
    definition.connect("relay", "out", "end", "in");

    let mut runner = start(definition, &probe, store.clone(), &RuntimeConfig::default())
        .await
        .unwrap();

    let records = wait_for_log(store.as_ref(), "chain", 2).await;
    let relay = records.iter().find(|r| r.node_id == "relay").unwrap();
    assert_eq!(relay.output_snapshot, json!([5]));
    let end = records.iter().find(|r| r.node_id == "end").unwrap();
    assert_eq!(end.input_snapshot["hops"], json!(2));

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_lets_in_flight_receive_finish() {
    let probe = Probe::default();
    let store = Arc::new(MemoryFlowStore::new());
    let config = RuntimeConfig {
        node_stop_timeout_ms: 50,
        ..RuntimeConfig::default()
    };

    let mut definition = emit_to_record("busy", json!("key down"));
    definition.nodes[1] = node("sink", "test.record").with_config("receive_delay_ms", 300);

    let mut runner = start(definition, &probe, store.clone(), &config).await.unwrap();
    assert!(wait_for(|| probe.count("sink:receive-begin") == 1).await);

    // Overrunning the stop timeout is not a failure
    runner.stop().await.unwrap();

    let calls = probe.calls();
    let position = |call: &str| {
        calls
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("{call} missing from {calls:?}"))
    };
    assert!(position("sink:receive-end") < position("source:stop"));
    assert!(position("sink:receive-end") < position("sink:stop"));
    assert!(position("sink:stop") < position("sink:cleanup"));

    let records = store.execution_log("busy", usize::MAX).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_outputs_of_spawned_tasks_are_not_attached() {
    let probe = Probe::default();
    let store = Arc::new(MemoryFlowStore::new());

    let mut definition = FlowDefinition::new("later").with_id("later");
    definition.add_node(node("src", "test.emit").with_config("payload", 7));
    definition.add_node(
        node("relay", "test.record")
            .with_config("later_ms", 20)
            .with_config("receive_delay_ms", 150),
    );
    definition.add_node(node("end", "test.record"));
    definition.connect("src", "out", "relay", "in");
    definition.connect("relay", "out", "end", "in");

    let mut runner = start(definition, &probe, store.clone(), &RuntimeConfig::default())
        .await
        .unwrap();

    let records = wait_for_log(store.as_ref(), "later", 2).await;
    assert_eq!(probe.received_by("end"), vec![json!(7)]);

    // The deferred emit fired while relay's receive was still open
    let relay = records.iter().find(|r| r.node_id == "relay").unwrap();
    assert!(relay.output_snapshot.is_null());
    assert_eq!(probe.count("relay:receive-end"), 1);

    runner.stop().await.unwrap();
}

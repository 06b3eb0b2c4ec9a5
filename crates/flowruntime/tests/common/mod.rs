// crates/flowruntime/tests/common/mod.rs
//
// Scriptable nodes shared by the runtime tests.

#![allow(dead_code)]

use async_trait::async_trait;
use flowcore::{
    ExecutionLogRecord, FlowDefinition, Message, Node, NodeConfig, NodeContext, NodeError, NodeKind,
};
use flowruntime::{FlowStore, NodeFactory, NodeMetadata, NodeRegistry};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared record of what the test nodes saw
#[derive(Clone, Default)]
pub struct Probe {
    received: Arc<Mutex<Vec<(String, Value)>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Probe {
    fn call(&self, node_id: &str, phase: &str) {
        self.calls.lock().unwrap().push(format!("{node_id}:{phase}"));
    }

    pub fn received_by(&self, node_id: &str) -> Vec<Value> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == node_id)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn total_received(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }
}

#[derive(Clone, Copy)]
enum Behavior {
    /// Emits its `payload` config once from `start`, and reports
    /// its `report` config as an error if set
    Emit,
    /// Records input, re-emits it when `forward` is set or from a spawned
    /// task `later_ms` afterwards. `receive_delay_ms` holds each receive
    /// open, logged as `receive-begin`/`receive-end`.
    Record,
    FailReceive,
    PanicReceive,
    FailStart,
    FailInit,
}

struct TestNode {
    id: String,
    node_type: String,
    behavior: Behavior,
    config: Value,
    probe: Probe,
    ctx: Option<NodeContext>,
}

impl TestNode {
    fn ctx(&self) -> Result<&NodeContext, NodeError> {
        self.ctx
            .as_ref()
            .ok_or_else(|| NodeError::ExecutionFailed("not initialized".to_string()))
    }

    fn millis(&self, key: &str) -> Option<Duration> {
        self.config.get(key).and_then(Value::as_u64).map(Duration::from_millis)
    }
}

#[async_trait]
impl Node for TestNode {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn kind(&self) -> NodeKind {
        match self.behavior {
            Behavior::Emit => NodeKind::Source,
            _ => NodeKind::Transform,
        }
    }

    async fn initialize(&mut self, ctx: NodeContext) -> Result<(), NodeError> {
        self.probe.call(&self.id, "initialize");
        if let Behavior::FailInit = self.behavior {
            return Err(NodeError::InitializationFailed("no hardware".to_string()));
        }
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), NodeError> {
        self.probe.call(&self.id, "start");
        match self.behavior {
            Behavior::FailStart => Err(NodeError::Hardware("port busy".to_string())),
            Behavior::Emit => {
                let payload = self.config.get("payload").cloned().unwrap_or(Value::Null);
                let ctx = self.ctx()?;
                ctx.send(Message::new(payload));
                if let Some(report) = self.config.get("report").and_then(Value::as_str) {
                    ctx.report_error(NodeError::ExecutionFailed(report.to_string()), None);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn receive(
        &mut self,
        message: Message,
        _source_port: &str,
        _target_port: &str,
    ) -> Result<(), NodeError> {
        match self.behavior {
            Behavior::FailReceive => Err(NodeError::ExecutionFailed("refused".to_string())),
            Behavior::PanicReceive => panic!("node {} blew up", self.id),
            _ => {
                let hold = self.millis("receive_delay_ms");
                if hold.is_some() {
                    self.probe.call(&self.id, "receive-begin");
                }
                self.probe
                    .received
                    .lock()
                    .unwrap()
                    .push((self.id.clone(), message.payload.clone()));
                if self.config.get("forward").and_then(Value::as_bool) == Some(true) {
                    self.ctx()?.send(message.derive(message.payload.clone()));
                }
                if let Some(later) = self.millis("later_ms") {
                    let ctx = self.ctx()?.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(later).await;
                        ctx.send(message.derive(message.payload.clone()));
                    });
                }
                if let Some(hold) = hold {
                    tokio::time::sleep(hold).await;
                    self.probe.call(&self.id, "receive-end");
                }
                Ok(())
            }
        }
    }

    async fn stop(&mut self) -> Result<(), NodeError> {
        if let Some(delay) = self.millis("stop_delay_ms") {
            tokio::time::sleep(delay).await;
        }
        self.probe.call(&self.id, "stop");
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), NodeError> {
        self.probe.call(&self.id, "cleanup");
        Ok(())
    }
}

struct TestFactory {
    node_type: &'static str,
    behavior: Behavior,
    probe: Probe,
}

impl NodeFactory for TestFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(TestNode {
            id: config.id.clone(),
            node_type: self.node_type.to_string(),
            behavior: self.behavior,
            config: config.config.clone(),
            probe: self.probe.clone(),
            ctx: None,
        }))
    }

    fn node_type(&self) -> &str {
        self.node_type
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            kind: match self.behavior {
                Behavior::Emit => NodeKind::Source,
                _ => NodeKind::Transform,
            },
            ..NodeMetadata::default()
        }
    }
}

/// Registry holding every `test.*` node type, all reporting to `probe`
pub fn registry(probe: &Probe) -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    for (node_type, behavior) in [
        ("test.emit", Behavior::Emit),
        ("test.record", Behavior::Record),
        ("test.fail", Behavior::FailReceive),
        ("test.panic", Behavior::PanicReceive),
        ("test.fail_start", Behavior::FailStart),
        ("test.fail_init", Behavior::FailInit),
    ] {
        registry.register(Arc::new(TestFactory {
            node_type,
            behavior,
            probe: probe.clone(),
        }));
    }
    registry
}

pub fn node(id: &str, node_type: &str) -> NodeConfig {
    NodeConfig::new(node_type).with_id(id)
}

/// `source` emits `payload` once on start, straight into a recorder `sink`
pub fn emit_to_record(id: &str, payload: Value) -> FlowDefinition {
    let mut definition = FlowDefinition::new(format!("flow {id}")).with_id(id);
    definition.add_node(node("source", "test.emit").with_config("payload", payload));
    definition.add_node(node("sink", "test.record"));
    definition.connect("source", "out", "sink", "in");
    definition
}

pub async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Poll the execution log until it holds at least `count` records
pub async fn wait_for_log(
    store: &dyn FlowStore,
    flow_id: &str,
    count: usize,
) -> Vec<ExecutionLogRecord> {
    for _ in 0..200 {
        let records = store.execution_log(flow_id, usize::MAX).await.unwrap();
        if records.len() >= count {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    store.execution_log(flow_id, usize::MAX).await.unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

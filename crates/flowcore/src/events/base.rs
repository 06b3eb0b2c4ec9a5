use crate::{FlowId, Message, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events fanned out to real-time observers (UI, CLI)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    FlowStarted {
        flow_id: FlowId,
        node_count: usize,
        timestamp: DateTime<Utc>,
    },
    FlowStopped {
        flow_id: FlowId,
        timestamp: DateTime<Utc>,
    },
    NodeOutput {
        flow_id: FlowId,
        node_id: NodeId,
        port: String,
        message: Message,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        flow_id: FlowId,
        node_id: NodeId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeEvent {
        flow_id: FlowId,
        node_id: NodeId,
        event: NodeEvent,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn flow_id(&self) -> &str {
        match self {
            ExecutionEvent::FlowStarted { flow_id, .. }
            | ExecutionEvent::FlowStopped { flow_id, .. }
            | ExecutionEvent::NodeOutput { flow_id, .. }
            | ExecutionEvent::NodeFailed { flow_id, .. }
            | ExecutionEvent::NodeEvent { flow_id, .. } => flow_id,
        }
    }
}

/// Events specific to one node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type")]
pub enum NodeEvent {
    Info { message: String },
    Warning { message: String },
    /// Short status line shown next to the node in the editor
    Status { text: String },
    /// Payload surfaced by a debug sink
    Debug { payload: serde_json::Value },
}

/// Event emitter for nodes to send real-time updates
#[derive(Clone)]
pub struct EventEmitter {
    flow_id: FlowId,
    node_id: NodeId,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(flow_id: FlowId, node_id: NodeId, sender: broadcast::Sender<ExecutionEvent>) -> Self {
        Self {
            flow_id,
            node_id,
            sender,
        }
    }

    /// Emit a node-specific event
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.sender.send(ExecutionEvent::NodeEvent {
            flow_id: self.flow_id.clone(),
            node_id: self.node_id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Warning {
            message: message.into(),
        });
    }

    pub fn status(&self, text: impl Into<String>) {
        self.emit(NodeEvent::Status { text: text.into() });
    }

    pub fn debug(&self, payload: serde_json::Value) {
        self.emit(NodeEvent::Debug { payload });
    }
}

/// Process-wide real-time fan-out. Publishing never fails; events sent
/// while nobody listens are dropped.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, flow_id: FlowId, node_id: NodeId) -> EventEmitter {
        EventEmitter::new(flow_id, node_id, self.sender.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

use crate::broadcast::BroadcastQueue;
use crate::events::{EventBus, EventEmitter, LocalMessageBus, MessageBus};
use crate::flow::DEFAULT_PORT;
use crate::{FlowId, Message, NodeError, NodeId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

tokio::task_local! {
    static CAPTURED: RefCell<Vec<serde_json::Value>>;
}

/// Core trait that all node types implement.
///
/// A node is driven through a linear lifecycle by the flow runner:
/// `initialize` → `start` → any number of `receive` calls → `stop` →
/// `cleanup`. Outbound messages are never returned from these methods;
/// they are posted through the [`NodeContext`] handed over in `initialize`.
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "inject", "radio.transmit")
    fn node_type(&self) -> &str;

    /// Source, sink or transform
    fn kind(&self) -> NodeKind {
        NodeKind::Transform
    }

    /// Wire in shared collaborators. Must not block.
    async fn initialize(&mut self, ctx: NodeContext) -> Result<(), NodeError>;

    /// Begin self-driven activity (timers, subscriptions).
    async fn start(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    /// React to a message delivered over a wire
    async fn receive(
        &mut self,
        _message: Message,
        _source_port: &str,
        _target_port: &str,
    ) -> Result<(), NodeError> {
        Ok(())
    }

    /// Cancel everything started in `start`. Must be idempotent.
    async fn stop(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Release remaining resources. Called even when `start` never ran.
    async fn cleanup(&mut self) -> Result<(), NodeError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Emits on its own, ignores input
    Source,
    /// Consumes input, never emits
    Sink,
    Transform,
}

/// Runner-tracked lifecycle of a node instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Initialized,
    Started,
    Stopped,
    CleanedUp,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (CleanedUp, _) => false,
            (_, CleanedUp) => true,
            (Created, Initialized) | (Initialized, Started) | (Started, Stopped) => true,
            _ => false,
        }
    }
}

/// Something a node posted to its runner
#[derive(Debug, Clone)]
pub enum Emission {
    Output {
        node_id: NodeId,
        port: String,
        message: Message,
    },
    Error {
        node_id: NodeId,
        error: NodeError,
        message: Option<Message>,
    },
}

/// Run `call` and collect every payload emitted from within it.
///
/// Collection is scoped to the calling task, so emissions made by tasks the
/// node spawned (timers, subscriptions) are never attributed to `call`.
pub async fn capture_outputs<F: Future>(call: F) -> (F::Output, Vec<serde_json::Value>) {
    CAPTURED
        .scope(RefCell::new(Vec::new()), async move {
            let output = call.await;
            let captured = CAPTURED.with(|captured| captured.take());
            (output, captured)
        })
        .await
}

/// A node's handle onto its runner's routing queue
#[derive(Clone)]
pub struct Outbox {
    node_id: NodeId,
    sender: mpsc::UnboundedSender<Emission>,
}

impl Outbox {
    pub fn new(node_id: impl Into<NodeId>, sender: mpsc::UnboundedSender<Emission>) -> Self {
        Self {
            node_id: node_id.into(),
            sender,
        }
    }

    pub fn post_output(&self, port: &str, message: Message) {
        // Outside `capture_outputs` there is nothing to collect into
        let _ = CAPTURED.try_with(|captured| captured.borrow_mut().push(message.payload.clone()));
        let emission = Emission::Output {
            node_id: self.node_id.clone(),
            port: port.to_string(),
            message,
        };
        if self.sender.send(emission).is_err() {
            tracing::debug!(node_id = %self.node_id, "output dropped, flow is not routing");
        }
    }

    pub fn post_error(&self, error: NodeError, message: Option<Message>) {
        let emission = Emission::Error {
            node_id: self.node_id.clone(),
            error,
            message,
        };
        if self.sender.send(emission).is_err() {
            tracing::debug!(node_id = %self.node_id, "error report dropped, flow is not routing");
        }
    }
}

/// Process-scoped services handed to every node at initialize time
#[derive(Clone)]
pub struct Collaborators {
    pub events: Arc<EventBus>,
    pub bus: Arc<dyn MessageBus>,
    pub broadcast: BroadcastQueue,
}

impl Collaborators {
    pub fn new(events: Arc<EventBus>, bus: Arc<dyn MessageBus>, broadcast: BroadcastQueue) -> Self {
        Self {
            events,
            bus,
            broadcast,
        }
    }

    /// Everything in-process, no broadcast job timeout
    pub fn in_process(event_capacity: usize, bus_capacity: usize) -> Self {
        Self::new(
            Arc::new(EventBus::new(event_capacity)),
            Arc::new(LocalMessageBus::new(bus_capacity)),
            BroadcastQueue::new(),
        )
    }
}

/// Context handed to a node in `initialize`
#[derive(Clone)]
pub struct NodeContext {
    pub flow_id: FlowId,
    pub node_id: NodeId,
    pub name: String,

    /// Real-time updates for observers
    pub events: EventEmitter,

    /// Topic-based messaging shared by all flows
    pub bus: Arc<dyn MessageBus>,

    /// Serializer for anything that keys a shared transmitter
    pub broadcast: BroadcastQueue,

    outbox: Outbox,
}

impl NodeContext {
    pub fn new(
        flow_id: impl Into<FlowId>,
        node_id: impl Into<NodeId>,
        name: impl Into<String>,
        collaborators: &Collaborators,
        outbox: Outbox,
    ) -> Self {
        let flow_id = flow_id.into();
        let node_id = node_id.into();
        Self {
            events: collaborators.events.create_emitter(flow_id.clone(), node_id.clone()),
            bus: collaborators.bus.clone(),
            broadcast: collaborators.broadcast.clone(),
            flow_id,
            node_id,
            name: name.into(),
            outbox,
        }
    }

    /// Emit a message on the given output port
    pub fn emit(&self, port: &str, message: Message) {
        self.outbox.post_output(port, message);
    }

    /// Emit on the default output port
    pub fn send(&self, message: Message) {
        self.emit(DEFAULT_PORT, message);
    }

    /// Report a failure that happened outside `receive`
    pub fn report_error(&self, error: NodeError, message: Option<Message>) {
        tracing::warn!(flow_id = %self.flow_id, node_id = %self.node_id, "node reported error: {}", error);
        self.outbox.post_error(error, message);
    }
}

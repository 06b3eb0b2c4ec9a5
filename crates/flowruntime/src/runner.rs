use crate::config::RuntimeConfig;
use crate::registry::NodeRegistry;
use crate::store::FlowStore;
use chrono::Utc;
use flowcore::{
    capture_outputs, panic_message, Collaborators, Emission, EventBus, ExecutionEvent,
    ExecutionLogRecord, FlowDefinition, FlowError, FlowId, LifecyclePhase, LifecycleState, Message,
    Node, NodeContext, NodeError, NodeId, Outbox,
};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One live flow: its node instances and the tasks routing between them.
///
/// Nodes never call each other. Every emission goes into the runner's
/// routing queue; a single router task looks up the wires and posts a
/// delivery into each target's inbox, and every node is driven by its own
/// actor task that drains that inbox one message at a time.
pub struct FlowRunner {
    definition: Arc<FlowDefinition>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    router: Option<JoinHandle<()>>,
    actors: Vec<NodeActor>,
    events: Arc<EventBus>,
    stop_timeout: Duration,
}

struct NodeSlot {
    id: NodeId,
    node_type: String,
    state: LifecycleState,
    node: Box<dyn Node>,
}

impl NodeSlot {
    fn advance(&mut self, next: LifecycleState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal lifecycle transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    /// Stops the node if it was started; anything else is a no-op.
    async fn stop(&mut self) -> Result<(), NodeError> {
        if self.state != LifecycleState::Started {
            return Ok(());
        }
        let result = guarded(self.node.stop()).await;
        self.advance(LifecycleState::Stopped);
        result
    }

    async fn cleanup(&mut self) -> Result<(), NodeError> {
        if self.state == LifecycleState::CleanedUp {
            return Ok(());
        }
        let result = guarded(self.node.cleanup()).await;
        self.advance(LifecycleState::CleanedUp);
        result
    }
}

struct NodeActor {
    node_id: NodeId,
    task: JoinHandle<NodeSlot>,
}

struct Delivery {
    message: Message,
    source_port: String,
    target_port: String,
}

/// Run a node callback, turning a panic into a node error
async fn guarded<F>(call: F) -> Result<(), NodeError>
where
    F: Future<Output = Result<(), NodeError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(NodeError::Panicked(panic_message(&*panic))),
    }
}

async fn append_log(store: &dyn FlowStore, record: ExecutionLogRecord) {
    if let Err(e) = store.append_execution_log(record).await {
        tracing::warn!("failed to append execution log: {}", e);
    }
}

impl FlowRunner {
    /// Bring a flow to life.
    ///
    /// Every node is created and initialized before any node is started, so
    /// a node that emits from `start` always finds its targets. On any
    /// failure the nodes created so far are stopped (if started) and
    /// cleaned up, and nothing keeps running.
    pub async fn start(
        definition: Arc<FlowDefinition>,
        registry: &NodeRegistry,
        collaborators: &Collaborators,
        store: Arc<dyn FlowStore>,
        config: &RuntimeConfig,
    ) -> Result<Self, FlowError> {
        let flow_id = definition.id.clone();
        tracing::info!(flow_id = %flow_id, nodes = definition.nodes.len(), "starting flow '{}'", definition.name);

        // The routing queue exists before any node, so nothing emitted
        // during initialize or start is lost.
        let (emit_tx, emit_rx) = mpsc::unbounded_channel();
        let mut slots: Vec<NodeSlot> = Vec::with_capacity(definition.nodes.len());

        for node_config in &definition.nodes {
            let node = match registry.create(node_config) {
                Ok(node) => node,
                Err(e) => {
                    tracing::error!(flow_id = %flow_id, node_id = %node_config.id, "failed to create node: {}", e);
                    rollback(&flow_id, &mut slots).await;
                    return Err(e);
                }
            };

            let outbox = Outbox::new(node_config.id.clone(), emit_tx.clone());
            let ctx = NodeContext::new(
                flow_id.clone(),
                node_config.id.clone(),
                node_config.display_name(),
                collaborators,
                outbox,
            );
            slots.push(NodeSlot {
                id: node_config.id.clone(),
                node_type: node_config.node_type.clone(),
                state: LifecycleState::Created,
                node,
            });

            let Some(slot) = slots.last_mut() else {
                continue;
            };
            let initialized = guarded(slot.node.initialize(ctx)).await;
            if let Err(e) = initialized {
                tracing::error!(flow_id = %flow_id, node_id = %node_config.id, "failed to initialize node: {}", e);
                rollback(&flow_id, &mut slots).await;
                return Err(FlowError::lifecycle(node_config.id.clone(), LifecyclePhase::Initialize, e));
            }
            slot.advance(LifecycleState::Initialized);
        }
        drop(emit_tx);

        for index in 0..slots.len() {
            let slot = &mut slots[index];
            let started = guarded(slot.node.start()).await;
            if let Err(e) = started {
                let node_id = slot.id.clone();
                tracing::error!(flow_id = %flow_id, node_id = %node_id, "failed to start node: {}", e);
                rollback(&flow_id, &mut slots).await;
                return Err(FlowError::lifecycle(node_id, LifecyclePhase::Start, e));
            }
            slot.advance(LifecycleState::Started);
        }

        let cancel = CancellationToken::new();
        let mut inboxes = HashMap::with_capacity(slots.len());
        let mut actors = Vec::with_capacity(slots.len());
        for slot in slots {
            let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
            let node_id = slot.id.clone();
            inboxes.insert(node_id.clone(), inbox_tx);
            let task = tokio::spawn(run_actor(
                slot,
                inbox_rx,
                ActorEnv {
                    flow_id: flow_id.clone(),
                    store: store.clone(),
                    events: collaborators.events.clone(),
                    cancel: cancel.clone(),
                },
            ));
            actors.push(NodeActor { node_id, task });
        }

        let router = tokio::spawn(route(Router {
            definition: definition.clone(),
            inboxes,
            emissions: emit_rx,
            store,
            events: collaborators.events.clone(),
            max_hops: config.max_hops,
            cancel: cancel.clone(),
        }));

        collaborators.events.emit(ExecutionEvent::FlowStarted {
            flow_id: flow_id.clone(),
            node_count: actors.len(),
            timestamp: Utc::now(),
        });
        tracing::info!(flow_id = %flow_id, "flow running");

        Ok(Self {
            definition,
            running: Arc::new(AtomicBool::new(true)),
            cancel,
            router: Some(router),
            actors,
            events: collaborators.events.clone(),
            stop_timeout: config.node_stop_timeout(),
        })
    }

    pub fn flow_id(&self) -> &FlowId {
        &self.definition.id
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.actors.iter().map(|a| a.node_id.clone()).collect()
    }

    /// Stop the flow. Calling it again is a no-op.
    ///
    /// In-flight `receive` calls finish first; no new deliveries are
    /// accepted. Every node is stopped and cleaned up even when some fail;
    /// the failures are returned together afterwards.
    pub async fn stop(&mut self) -> Result<(), FlowError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let flow_id = self.definition.id.clone();
        tracing::info!(flow_id = %flow_id, "stopping flow");

        self.cancel.cancel();
        if let Some(router) = self.router.take() {
            if let Err(e) = router.await {
                tracing::warn!(flow_id = %flow_id, "router task ended abnormally: {}", e);
            }
        }

        let mut failures = Vec::new();
        let mut slots = Vec::with_capacity(self.actors.len());
        for NodeActor { node_id, mut task } in self.actors.drain(..) {
            let joined = match tokio::time::timeout(self.stop_timeout, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    // Never cut a receive short; keep waiting for it
                    tracing::warn!(
                        flow_id = %flow_id,
                        node_id = %node_id,
                        "in-flight message still running after {}ms, waiting for it",
                        self.stop_timeout.as_millis()
                    );
                    task.await
                }
            };
            match joined {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    tracing::warn!(flow_id = %flow_id, node_id = %node_id, "node task failed: {}", e);
                    failures.push(format!("{node_id}: node task failed: {e}"));
                }
            }
        }

        for slot in &mut slots {
            if let Err(e) = slot.stop().await {
                tracing::warn!(flow_id = %flow_id, node_id = %slot.id, node_type = %slot.node_type, "node stop failed: {}", e);
                failures.push(format!("{}: {} failed: {}", slot.id, LifecyclePhase::Stop, e));
            }
        }
        for slot in &mut slots {
            if let Err(e) = slot.cleanup().await {
                tracing::warn!(flow_id = %flow_id, node_id = %slot.id, node_type = %slot.node_type, "node cleanup failed: {}", e);
                failures.push(format!("{}: {} failed: {}", slot.id, LifecyclePhase::Cleanup, e));
            }
        }
        drop(slots);

        self.events.emit(ExecutionEvent::FlowStopped {
            flow_id: flow_id.clone(),
            timestamp: Utc::now(),
        });

        if failures.is_empty() {
            tracing::info!(flow_id = %flow_id, "flow stopped");
            Ok(())
        } else {
            Err(FlowError::StopFailed { flow_id, failures })
        }
    }
}

impl Drop for FlowRunner {
    fn drop(&mut self) {
        if self.is_running() {
            tracing::warn!(flow_id = %self.definition.id, "flow runner dropped while running");
            self.cancel.cancel();
        }
    }
}

/// Undo a partial startup
async fn rollback(flow_id: &str, slots: &mut [NodeSlot]) {
    for slot in slots.iter_mut() {
        if let Err(e) = slot.stop().await {
            tracing::warn!(flow_id = %flow_id, node_id = %slot.id, "stop during rollback failed: {}", e);
        }
    }
    for slot in slots.iter_mut() {
        if let Err(e) = slot.cleanup().await {
            tracing::warn!(flow_id = %flow_id, node_id = %slot.id, "cleanup during rollback failed: {}", e);
        }
    }
}

struct Router {
    definition: Arc<FlowDefinition>,
    inboxes: HashMap<NodeId, mpsc::UnboundedSender<Delivery>>,
    emissions: mpsc::UnboundedReceiver<Emission>,
    store: Arc<dyn FlowStore>,
    events: Arc<EventBus>,
    max_hops: u32,
    cancel: CancellationToken,
}

async fn route(mut router: Router) {
    loop {
        let emission = tokio::select! {
            biased;
            _ = router.cancel.cancelled() => break,
            emission = router.emissions.recv() => match emission {
                Some(emission) => emission,
                None => break,
            },
        };

        match emission {
            Emission::Output {
                node_id,
                port,
                message,
            } => router.dispatch(node_id, port, message).await,
            Emission::Error {
                node_id,
                error,
                message,
            } => router.record_error(&node_id, &error, message.as_ref()).await,
        }
    }
    tracing::debug!(flow_id = %router.definition.id, "router stopped");
}

impl Router {
    async fn dispatch(&self, node_id: NodeId, port: String, message: Message) {
        let flow_id = &self.definition.id;

        self.events.emit(ExecutionEvent::NodeOutput {
            flow_id: flow_id.clone(),
            node_id: node_id.clone(),
            port: port.clone(),
            message: message.clone(),
            timestamp: Utc::now(),
        });

        if message.hops >= self.max_hops {
            let error = NodeError::ExecutionFailed(format!(
                "message {} dropped after crossing {} wires",
                message.id, message.hops
            ));
            self.record_error(&node_id, &error, Some(&message)).await;
            return;
        }

        for wire in self.definition.wires_from(&node_id, &port) {
            let Some(inbox) = self.inboxes.get(&wire.target_node) else {
                tracing::warn!(flow_id = %flow_id, "wire to unknown node {}", wire.target_node);
                continue;
            };
            tracing::debug!(
                flow_id = %flow_id,
                from = %node_id,
                to = %wire.target_node,
                "routing message {}",
                message.id
            );
            let delivery = Delivery {
                message: message.clone().hopped(),
                source_port: wire.source_port.clone(),
                target_port: wire.target_port.clone(),
            };
            if inbox.send(delivery).is_err() {
                tracing::debug!(flow_id = %flow_id, node_id = %wire.target_node, "target no longer accepting messages");
            }
        }
    }

    async fn record_error(&self, node_id: &str, error: &NodeError, message: Option<&Message>) {
        let flow_id = &self.definition.id;
        tracing::warn!(flow_id = %flow_id, node_id = %node_id, "node error: {}", error);

        self.events.emit(ExecutionEvent::NodeFailed {
            flow_id: flow_id.clone(),
            node_id: node_id.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });

        let input = message
            .and_then(|m| serde_json::to_value(m).ok())
            .unwrap_or(serde_json::Value::Null);
        append_log(
            self.store.as_ref(),
            ExecutionLogRecord::error(flow_id.clone(), node_id, input, error),
        )
        .await;
    }
}

struct ActorEnv {
    flow_id: FlowId,
    store: Arc<dyn FlowStore>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
}

/// Drive one node: take deliveries in order and hand them to `receive`.
/// Gives the node back once the flow is cancelled.
async fn run_actor(
    mut slot: NodeSlot,
    mut inbox: mpsc::UnboundedReceiver<Delivery>,
    env: ActorEnv,
) -> NodeSlot {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = env.cancel.cancelled() => break,
            delivery = inbox.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let Delivery {
            message,
            source_port,
            target_port,
        } = delivery;
        let input = serde_json::to_value(&message).unwrap_or(serde_json::Value::Null);

        let (result, outputs) =
            capture_outputs(guarded(slot.node.receive(message, &source_port, &target_port))).await;

        let record = match result {
            Ok(()) => {
                let output = if outputs.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::Value::Array(outputs)
                };
                ExecutionLogRecord::success(env.flow_id.clone(), slot.id.clone(), input, output)
            }
            Err(e) => {
                tracing::warn!(flow_id = %env.flow_id, node_id = %slot.id, "receive failed: {}", e);
                env.events.emit(ExecutionEvent::NodeFailed {
                    flow_id: env.flow_id.clone(),
                    node_id: slot.id.clone(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                ExecutionLogRecord::error(env.flow_id.clone(), slot.id.clone(), input, e)
            }
        };
        append_log(env.store.as_ref(), record).await;
    }
    slot
}

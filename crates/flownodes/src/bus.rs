use crate::initialized;
use async_trait::async_trait;
use flowcore::{Message, Node, NodeConfig, NodeContext, NodeError, NodeKind};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Deserialize)]
struct BusInConfig {
    /// MQTT-style filter, e.g. `sensors/+/temperature`
    topic: String,
}

/// Feeds messages from the shared bus into the flow
pub struct BusInNode {
    pattern: String,
    ctx: Option<NodeContext>,
    listener: Option<CancellationToken>,
}

#[async_trait]
impl Node for BusInNode {
    fn node_type(&self) -> &str {
        "bus.in"
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Source
    }

    async fn initialize(&mut self, ctx: NodeContext) -> Result<(), NodeError> {
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), NodeError> {
        let ctx = initialized(&self.ctx)?.clone();
        let mut subscription = ctx.bus.subscribe(&self.pattern);
        ctx.events.info(format!("subscribed to {}", self.pattern));
        let token = CancellationToken::new();
        let cancelled = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    received = subscription.recv() => match received {
                        Some(bus_message) => {
                            ctx.send(Message::new(bus_message.payload).with_topic(bus_message.topic));
                        }
                        None => {
                            ctx.report_error(
                                NodeError::ExecutionFailed("message bus closed".to_string()),
                                None,
                            );
                            break;
                        }
                    },
                }
            }
            subscription.unsubscribe();
        });

        self.listener = Some(token);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), NodeError> {
        if let Some(listener) = self.listener.take() {
            listener.cancel();
        }
        Ok(())
    }
}

pub struct BusInNodeFactory;

impl NodeFactory for BusInNodeFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        let parsed: BusInConfig = config.parse_config()?;
        if parsed.topic.is_empty() {
            return Err(NodeError::Configuration("topic must not be empty".to_string()));
        }
        Ok(Box::new(BusInNode {
            pattern: parsed.topic,
            ctx: None,
            listener: None,
        }))
    }

    fn node_type(&self) -> &str {
        "bus.in"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Subscribe to a message bus topic".to_string(),
            category: "network".to_string(),
            kind: NodeKind::Source,
            inputs: vec![],
            outputs: vec![PortDefinition::new("out", "Bus message, topic preserved")],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct BusOutConfig {
    topic: Option<String>,
}

/// Publishes each message to the shared bus.
///
/// Uses the configured topic, falling back to the message's own.
pub struct BusOutNode {
    topic: Option<String>,
    ctx: Option<NodeContext>,
}

#[async_trait]
impl Node for BusOutNode {
    fn node_type(&self) -> &str {
        "bus.out"
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Sink
    }

    async fn initialize(&mut self, ctx: NodeContext) -> Result<(), NodeError> {
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn receive(
        &mut self,
        message: Message,
        _source_port: &str,
        _target_port: &str,
    ) -> Result<(), NodeError> {
        let ctx = initialized(&self.ctx)?;
        let topic = self
            .topic
            .as_deref()
            .or(message.topic.as_deref())
            .ok_or_else(|| NodeError::ExecutionFailed("no topic configured or on message".to_string()))?;

        let receivers = ctx.bus.publish(topic, message.payload);
        if receivers == 0 {
            ctx.events.warn(format!("nobody is listening on {}", topic));
        }
        tracing::debug!(node = %ctx.name, topic, receivers, "published to bus");
        Ok(())
    }
}

pub struct BusOutNodeFactory;

impl NodeFactory for BusOutNodeFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        let parsed: BusOutConfig = config.parse_config()?;
        Ok(Box::new(BusOutNode {
            topic: parsed.topic.filter(|t| !t.is_empty()),
            ctx: None,
        }))
    }

    fn node_type(&self) -> &str {
        "bus.out"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Publish to a message bus topic".to_string(),
            category: "network".to_string(),
            kind: NodeKind::Sink,
            inputs: vec![PortDefinition::new("in", "Payload to publish")],
            outputs: vec![],
        }
    }
}

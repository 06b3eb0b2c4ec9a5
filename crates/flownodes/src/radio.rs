//! Radio output.
//!
//! A process has one physical transmitter, so every transmission goes
//! through the broadcast queue: nodes in different flows may fire at the
//! same moment but only one of them keys up at a time.

use crate::initialized;
use async_trait::async_trait;
use chrono::Utc;
use flowcore::{
    BroadcastJobError, BroadcastMetadata, Message, Node, NodeConfig, NodeContext, NodeError,
    NodeKind,
};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::time::Duration;

/// Driver for the shared transmitter hardware
#[async_trait]
pub trait Transmitter: Send + Sync {
    async fn transmit(&self, channel: &str, payload: &serde_json::Value) -> Result<(), NodeError>;
}

/// Stand-in driver that logs and holds the key for a fixed time
#[derive(Debug, Clone)]
pub struct SimulatedTransmitter {
    pub key_up: Duration,
}

impl Default for SimulatedTransmitter {
    fn default() -> Self {
        Self {
            key_up: Duration::from_millis(50),
        }
    }
}

#[async_trait]
impl Transmitter for SimulatedTransmitter {
    async fn transmit(&self, channel: &str, payload: &serde_json::Value) -> Result<(), NodeError> {
        tracing::info!(channel, key_up_ms = self.key_up.as_millis() as u64, "TX: {}", payload);
        tokio::time::sleep(self.key_up).await;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TransmitConfig {
    channel: String,
}

pub struct TransmitNode {
    channel: String,
    transmitter: Arc<dyn Transmitter>,
    ctx: Option<NodeContext>,
}

#[async_trait]
impl Node for TransmitNode {
    fn node_type(&self) -> &str {
        "radio.transmit"
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
        let metadata = BroadcastMetadata::new(ctx.name.clone()).on_channel(self.channel.clone());

        let transmitter = self.transmitter.clone();
        let channel = self.channel.clone();
        let payload = message.payload.clone();
        let handle = ctx.broadcast.enqueue(metadata, async move {
            transmitter
                .transmit(&channel, &payload)
                .await
                .map_err(|e| BroadcastJobError::Failed(e.to_string()))
        });

        let queued_at = handle.metadata().enqueued_at;
        handle.wait().await?;

        ctx.events.status(format!("sent on {}", self.channel));
        ctx.send(message.derive(json!({
            "channel": self.channel,
            "payload": message.payload,
            "queued_at": queued_at,
            "sent_at": Utc::now(),
        })));
        Ok(())
    }
}

/// Builds `radio.transmit` nodes that all share one driver
pub struct TransmitNodeFactory {
    transmitter: Arc<dyn Transmitter>,
}

impl TransmitNodeFactory {
    pub fn new(transmitter: Arc<dyn Transmitter>) -> Self {
        Self { transmitter }
    }
}

impl NodeFactory for TransmitNodeFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        let parsed: TransmitConfig = config.parse_config()?;
        if parsed.channel.is_empty() {
            return Err(NodeError::Configuration("channel must not be empty".to_string()));
        }
        Ok(Box::new(TransmitNode {
            channel: parsed.channel,
            transmitter: self.transmitter.clone(),
            ctx: None,
        }))
    }

    fn node_type(&self) -> &str {
        "radio.transmit"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Transmit payloads on a radio channel, one sender at a time".to_string(),
            category: "hardware".to_string(),
            kind: NodeKind::Transform,
            inputs: vec![PortDefinition::new("in", "Payload to transmit")],
            outputs: vec![PortDefinition::new("out", "Transmission receipt")],
        }
    }
}

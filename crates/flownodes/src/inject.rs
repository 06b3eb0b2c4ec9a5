use crate::initialized;
use async_trait::async_trait;
use chrono::Utc;
use flowcore::{Message, Node, NodeConfig, NodeContext, NodeError, NodeKind};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use serde::Deserialize;
use tokio::time::{sleep, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct InjectConfig {
    /// Fixed payload; null injects the current timestamp in milliseconds
    payload: serde_json::Value,
    topic: Option<String>,
    /// Fire once right after start
    once: bool,
    once_delay_ms: u64,
    /// Keep firing at this period
    interval_ms: Option<u64>,
}

impl Default for InjectConfig {
    fn default() -> Self {
        Self {
            payload: serde_json::Value::Null,
            topic: None,
            once: true,
            once_delay_ms: 0,
            interval_ms: None,
        }
    }
}

/// Source that emits a configured payload once and/or on an interval
pub struct InjectNode {
    config: InjectConfig,
    ctx: Option<NodeContext>,
    timer: Option<CancellationToken>,
}

impl InjectNode {
    fn message(config: &InjectConfig) -> Message {
        let payload = if config.payload.is_null() {
            serde_json::Value::from(Utc::now().timestamp_millis())
        } else {
            config.payload.clone()
        };
        let message = Message::new(payload);
        match &config.topic {
            Some(topic) => message.with_topic(topic.clone()),
            None => message,
        }
    }
}

#[async_trait]
impl Node for InjectNode {
    fn node_type(&self) -> &str {
        "inject"
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
        let config = self.config.clone();
        let token = CancellationToken::new();
        let cancelled = token.clone();

        tokio::spawn(async move {
            if config.once {
                tokio::select! {
                    _ = cancelled.cancelled() => return,
                    _ = sleep(Duration::from_millis(config.once_delay_ms)) => {
                        ctx.send(Self::message(&config));
                    }
                }
            }

            let Some(interval_ms) = config.interval_ms else {
                return;
            };
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately; `once` covers that case
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => ctx.send(Self::message(&config)),
                }
            }
        });

        self.timer = Some(token);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), NodeError> {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        Ok(())
    }
}

pub struct InjectNodeFactory;

impl NodeFactory for InjectNodeFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        let parsed: InjectConfig = config.parse_config()?;
        if parsed.interval_ms == Some(0) {
            return Err(NodeError::Configuration("interval_ms must be positive".to_string()));
        }
        Ok(Box::new(InjectNode {
            config: parsed,
            ctx: None,
            timer: None,
        }))
    }

    fn node_type(&self) -> &str {
        "inject"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Emit a payload at start and/or on an interval".to_string(),
            category: "common".to_string(),
            kind: NodeKind::Source,
            inputs: vec![],
            outputs: vec![PortDefinition::new("out", "Injected message")],
        }
    }
}

use crate::initialized;
use async_trait::async_trait;
use flowcore::{Message, Node, NodeConfig, NodeContext, NodeError, NodeKind};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use serde::Deserialize;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct DelayConfig {
    delay_ms: u64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        // Default to 1 second if not specified
        Self { delay_ms: 1000 }
    }
}

/// Hold each message for a fixed time, then pass it on.
///
/// Messages are delayed independently; `stop` drops any still waiting.
pub struct DelayNode {
    delay: Duration,
    ctx: Option<NodeContext>,
    pending: CancellationToken,
}

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        "delay"
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
        let ctx = initialized(&self.ctx)?.clone();
        let delay = self.delay;
        let cancelled = self.pending.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    tracing::debug!(node = %ctx.name, "dropping delayed message {}", message.id);
                }
                _ = sleep(delay) => ctx.send(message),
            }
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), NodeError> {
        self.pending.cancel();
        Ok(())
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        let parsed: DelayConfig = config.parse_config()?;
        Ok(Box::new(DelayNode {
            delay: Duration::from_millis(parsed.delay_ms),
            ctx: None,
            pending: CancellationToken::new(),
        }))
    }

    fn node_type(&self) -> &str {
        "delay"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Delay each message for specified milliseconds".to_string(),
            category: "time".to_string(),
            kind: NodeKind::Transform,
            inputs: vec![PortDefinition::new("in", "Message to delay")],
            outputs: vec![PortDefinition::new("out", "Same message, later")],
        }
    }
}

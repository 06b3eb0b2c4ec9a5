use crate::initialized;
use async_trait::async_trait;
use flowcore::{Message, Node, NodeConfig, NodeContext, NodeError, NodeKind};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DebugConfig {
    /// Show the whole message instead of just the payload
    complete: bool,
}

/// Sink that logs what it receives and shows it to observers
pub struct DebugNode {
    config: DebugConfig,
    ctx: Option<NodeContext>,
}

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug"
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

        let shown = if self.config.complete {
            serde_json::to_value(&message)
                .map_err(|e| NodeError::ExecutionFailed(format!("cannot render message: {}", e)))?
        } else {
            message.payload
        };

        tracing::info!(flow_id = %ctx.flow_id, node = %ctx.name, "DEBUG: {}", shown);
        ctx.events.debug(shown);
        Ok(())
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DebugNode {
            config: config.parse_config()?,
            ctx: None,
        }))
    }

    fn node_type(&self) -> &str {
        "debug"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Logs received messages for debugging".to_string(),
            category: "common".to_string(),
            kind: NodeKind::Sink,
            inputs: vec![PortDefinition::new("in", "Message to show")],
            outputs: vec![],
        }
    }
}

use crate::initialized;
use async_trait::async_trait;
use flowcore::{Message, Node, NodeConfig, NodeContext, NodeError, NodeKind};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use serde::Deserialize;

/// Parse a JSON string payload into structured data
pub struct JsonParseNode {
    ctx: Option<NodeContext>,
}

#[async_trait]
impl Node for JsonParseNode {
    fn node_type(&self) -> &str {
        "json.parse"
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
        let input = message
            .payload_str()
            .ok_or_else(|| NodeError::ExecutionFailed("payload is not a string".to_string()))?;

        let parsed: serde_json::Value = serde_json::from_str(input)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        ctx.send(message.derive(parsed));
        Ok(())
    }
}

pub struct JsonParseNodeFactory;

impl NodeFactory for JsonParseNodeFactory {
    fn create(&self, _config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(JsonParseNode { ctx: None }))
    }

    fn node_type(&self) -> &str {
        "json.parse"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Parse JSON string".to_string(),
            category: "transform".to_string(),
            kind: NodeKind::Transform,
            inputs: vec![PortDefinition::new("in", "JSON text")],
            outputs: vec![PortDefinition::new("out", "Parsed value")],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct StringifyConfig {
    pretty: bool,
}

/// Render a payload as JSON text
pub struct JsonStringifyNode {
    pretty: bool,
    ctx: Option<NodeContext>,
}

#[async_trait]
impl Node for JsonStringifyNode {
    fn node_type(&self) -> &str {
        "json.stringify"
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

        let rendered = if self.pretty {
            serde_json::to_string_pretty(&message.payload)
        } else {
            serde_json::to_string(&message.payload)
        }
        .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        ctx.send(message.derive(rendered));
        Ok(())
    }
}

pub struct JsonStringifyNodeFactory;

impl NodeFactory for JsonStringifyNodeFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        let parsed: StringifyConfig = config.parse_config()?;
        Ok(Box::new(JsonStringifyNode {
            pretty: parsed.pretty,
            ctx: None,
        }))
    }

    fn node_type(&self) -> &str {
        "json.stringify"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Convert payload to JSON string".to_string(),
            category: "transform".to_string(),
            kind: NodeKind::Transform,
            inputs: vec![PortDefinition::new("in", "Any value")],
            outputs: vec![PortDefinition::new("out", "JSON text")],
        }
    }
}

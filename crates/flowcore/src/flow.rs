use crate::NodeError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type FlowId = String;
pub type NodeId = String;

/// Default output/input port name
pub const DEFAULT_PORT: &str = "out";

/// Persisted flow definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowDefinition {
    #[serde(default)]
    pub id: FlowId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: FlowStatus,
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub wires: Vec<WireSpec>,
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl FlowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            status: FlowStatus::Stopped,
            nodes: Vec::new(),
            wires: Vec::new(),
            version: 0,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<FlowId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn add_node(&mut self, node: NodeConfig) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn connect(
        &mut self,
        source_node: impl Into<NodeId>,
        source_port: impl Into<String>,
        target_node: impl Into<NodeId>,
        target_port: impl Into<String>,
    ) {
        self.wires.push(WireSpec {
            source_node: source_node.into(),
            source_port: source_port.into(),
            target_node: target_node.into(),
            target_port: target_port.into(),
        });
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Wires leaving `node_id` on `port`, in definition order
    pub fn wires_from<'a>(
        &'a self,
        node_id: &'a str,
        port: &'a str,
    ) -> impl Iterator<Item = &'a WireSpec> + 'a {
        self.wires
            .iter()
            .filter(move |w| w.source_node == node_id && w.source_port == port)
    }

    /// Same definition ignoring id, status and bookkeeping fields
    pub fn same_shape(&self, other: &FlowDefinition) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.nodes == other.nodes
            && self.wires == other.wires
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    #[default]
    Stopped,
    Running,
}

/// Node configuration inside a flow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl NodeConfig {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node_type: node_type.into(),
            name: None,
            config: empty_object(),
        }
    }

    pub fn with_id(mut self, id: impl Into<NodeId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        if !self.config.is_object() {
            self.config = empty_object();
        }
        if let Some(map) = self.config.as_object_mut() {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Display name, falling back to the node id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Deserialize the free-form payload into a node's typed configuration
    pub fn parse_config<T: DeserializeOwned>(&self) -> Result<T, NodeError> {
        serde_json::from_value(self.config.clone()).map_err(|e| {
            NodeError::Configuration(format!("{} ({}): {}", self.display_name(), self.node_type, e))
        })
    }
}

/// Directed edge from one node's output to another node's input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireSpec {
    pub source_node: NodeId,
    #[serde(default = "default_port")]
    pub source_port: String,
    pub target_node: NodeId,
    #[serde(default = "default_input_port")]
    pub target_port: String,
}

fn default_port() -> String {
    DEFAULT_PORT.to_string()
}

fn default_input_port() -> String {
    "in".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
}

/// Append-only audit entry, one per message-routing event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLogRecord {
    pub flow_id: FlowId,
    pub node_id: NodeId,
    pub status: ExecutionStatus,
    pub input_snapshot: serde_json::Value,
    pub output_snapshot: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionLogRecord {
    pub fn success(
        flow_id: impl Into<FlowId>,
        node_id: impl Into<NodeId>,
        input_snapshot: serde_json::Value,
        output_snapshot: serde_json::Value,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            node_id: node_id.into(),
            status: ExecutionStatus::Success,
            input_snapshot,
            output_snapshot,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(
        flow_id: impl Into<FlowId>,
        node_id: impl Into<NodeId>,
        input_snapshot: serde_json::Value,
        error: impl ToString,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            node_id: node_id.into(),
            status: ExecutionStatus::Error,
            input_snapshot,
            output_snapshot: serde_json::Value::Null,
            error: Some(error.to_string()),
            timestamp: Utc::now(),
        }
    }
}

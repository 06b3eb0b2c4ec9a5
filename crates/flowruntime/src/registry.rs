use flowcore::{FlowError, LifecyclePhase, Node, NodeConfig, NodeError, NodeKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create a fresh instance for one node of a flow
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError>;

    /// Get node type identifier
    fn node_type(&self) -> &str;

    /// Optional: Get node metadata (description, ports, kind)
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub kind: NodeKind,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            kind: NodeKind::Transform,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
}

impl PortDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Registry of available node types.
///
/// Filled once at startup, then shared read-only behind an `Arc`.
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory. A type registered twice keeps the newest
    /// factory.
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        if self.factories.insert(node_type.clone(), factory).is_some() {
            tracing::warn!("Node type {} registered again, replacing previous factory", node_type);
        } else {
            tracing::info!("Registering node type: {}", node_type);
        }
    }

    pub fn has(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Create a node instance for one node of a flow
    pub fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, FlowError> {
        let factory = self
            .factories
            .get(&config.node_type)
            .ok_or_else(|| FlowError::UnknownNodeType(config.node_type.clone()))?;

        factory
            .create(config)
            .map_err(|e| FlowError::lifecycle(config.id.clone(), LifecyclePhase::Construct, e))
    }

    /// All registered node types, sorted
    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.factories.get(node_type).map(|f| f.metadata())
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

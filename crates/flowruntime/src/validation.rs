use crate::registry::NodeRegistry;
use flowcore::{FlowDefinition, FlowError, NodeKind};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use std::collections::{HashMap, HashSet};

/// Non-fatal findings about a definition that passed validation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    /// The wires form at least one cycle; routing relies on the hop limit
    pub cyclic: bool,
    pub warnings: Vec<String>,
}

/// Check a definition's shape before it is persisted.
///
/// Rejects a missing name, an empty node list, duplicate node ids, node
/// types the registry does not know and wires to nodes that do not exist.
/// Cycles are allowed and only reported.
pub fn validate_definition(
    definition: &FlowDefinition,
    registry: &NodeRegistry,
) -> Result<ValidationReport, FlowError> {
    if definition.name.trim().is_empty() {
        return Err(FlowError::Invalid("flow name is required".to_string()));
    }
    if definition.nodes.is_empty() {
        return Err(FlowError::Invalid(format!(
            "flow '{}' has no nodes",
            definition.name
        )));
    }

    let mut report = ValidationReport::default();
    let mut graph = DiGraph::<&str, ()>::new();
    let mut index_of = HashMap::new();
    let mut seen = HashSet::new();

    for node in &definition.nodes {
        if node.id.trim().is_empty() {
            return Err(FlowError::Invalid(format!(
                "node of type '{}' has an empty id",
                node.node_type
            )));
        }
        if !seen.insert(node.id.as_str()) {
            return Err(FlowError::Invalid(format!("duplicate node id '{}'", node.id)));
        }
        if !registry.has(&node.node_type) {
            return Err(FlowError::UnknownNodeType(node.node_type.clone()));
        }
        index_of.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
    }

    for wire in &definition.wires {
        let from = index_of.get(wire.source_node.as_str()).ok_or_else(|| {
            FlowError::Invalid(format!("wire from unknown node '{}'", wire.source_node))
        })?;
        let to = index_of.get(wire.target_node.as_str()).ok_or_else(|| {
            FlowError::Invalid(format!("wire to unknown node '{}'", wire.target_node))
        })?;
        graph.add_edge(*from, *to, ());

        if let Some(target) = definition.find_node(&wire.target_node) {
            if kind_of(registry, &target.node_type) == Some(NodeKind::Source) {
                report.warnings.push(format!(
                    "node '{}' is a source and ignores its input from '{}'",
                    target.id, wire.source_node
                ));
            }
        }
        if let Some(source) = definition.find_node(&wire.source_node) {
            if kind_of(registry, &source.node_type) == Some(NodeKind::Sink) {
                report.warnings.push(format!(
                    "node '{}' is a sink and never emits to '{}'",
                    source.id, wire.target_node
                ));
            }
        }
    }

    if is_cyclic_directed(&graph) {
        report.cyclic = true;
        report
            .warnings
            .push("wires form a cycle; messages are bounded by the hop limit".to_string());
    }

    Ok(report)
}

fn kind_of(registry: &NodeRegistry, node_type: &str) -> Option<NodeKind> {
    registry.metadata(node_type).map(|m| m.kind)
}

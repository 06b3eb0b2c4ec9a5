use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Node {node_id} failed during {phase}: {source}")]
    NodeLifecycle {
        node_id: String,
        phase: LifecyclePhase,
        #[source]
        source: NodeError,
    },

    #[error("Invalid flow: {0}")]
    Invalid(String),

    #[error("Flow not found: {0}")]
    NotFound(String),

    #[error("Flow {flow_id} stopped with {} node failure(s): {}", failures.len(), failures.join("; "))]
    StopFailed {
        flow_id: String,
        failures: Vec<String>,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    pub fn lifecycle(node_id: impl Into<String>, phase: LifecyclePhase, source: NodeError) -> Self {
        FlowError::NodeLifecycle {
            node_id: node_id.into(),
            phase,
            source,
        }
    }
}

/// Lifecycle step a node was in when it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Construct,
    Initialize,
    Start,
    Stop,
    Cleanup,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecyclePhase::Construct => "construct",
            LifecyclePhase::Initialize => "initialize",
            LifecyclePhase::Start => "start",
            LifecyclePhase::Stop => "stop",
            LifecyclePhase::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Node initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Broadcast job failed: {0}")]
    Broadcast(#[from] BroadcastJobError),

    #[error("Node panicked: {0}")]
    Panicked(String),

    #[error("Timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,
}

/// Failure of a single job submitted to the broadcast queue
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastJobError {
    #[error("{0}")]
    Failed(String),

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("job exceeded {}ms", .0.as_millis())]
    TimedOut(Duration),

    #[error("job dropped before completion")]
    Dropped,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Best-effort text for a caught panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

use flowcore::{BroadcastQueue, Collaborators, EventBus, FlowError, LocalMessageBus};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of the real-time event channel
    pub event_buffer_size: usize,
    /// Capacity of the in-process message bus
    pub bus_buffer_size: usize,
    /// Messages that crossed this many wires are dropped
    pub max_hops: u32,
    /// Stop warns about a node whose in-flight `receive` runs past this.
    /// It still waits for the call to finish.
    pub node_stop_timeout_ms: u64,
    /// Abandon broadcast jobs after this long. Unset means wait forever.
    pub broadcast_job_timeout_ms: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            bus_buffer_size: 1024,
            max_hops: 64,
            node_stop_timeout_ms: 5000,
            broadcast_job_timeout_ms: None,
        }
    }
}

impl RuntimeConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn node_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.node_stop_timeout_ms)
    }

    pub fn broadcast_job_timeout(&self) -> Option<Duration> {
        self.broadcast_job_timeout_ms.map(Duration::from_millis)
    }

    /// Fresh in-process collaborators sized by this config
    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            Arc::new(EventBus::new(self.event_buffer_size)),
            Arc::new(LocalMessageBus::new(self.bus_buffer_size)),
            BroadcastQueue::with_job_timeout(self.broadcast_job_timeout()),
        )
    }
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope routed along wires between node instances
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub payload: serde_json::Value,
    /// Number of wires this message lineage has crossed
    #[serde(default)]
    pub hops: u32,
}

impl Message {
    pub fn new(payload: impl Into<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: None,
            payload: payload.into(),
            hops: 0,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// New message in the same lineage: keeps topic and hop count.
    pub fn derive(&self, payload: impl Into<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: self.topic.clone(),
            payload: payload.into(),
            hops: self.hops,
        }
    }

    /// Copy of this message as it crosses one more wire
    pub fn hopped(mut self) -> Self {
        self.hops = self.hops.saturating_add(1);
        self
    }

    pub fn payload_str(&self) -> Option<&str> {
        self.payload.as_str()
    }
}

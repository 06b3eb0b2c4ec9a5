// crates/flowcore/src/events/bus.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Message carried on the topic bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Topic-based messaging used by message-oriented node types.
///
/// Subscribing returns a [`Subscription`]; dropping it (or calling
/// [`Subscription::unsubscribe`]) ends the subscription.
pub trait MessageBus: Send + Sync {
    /// Publish to every matching subscriber. Returns how many subscriptions
    /// were live at send time (not all of them have to match).
    fn publish(&self, topic: &str, payload: serde_json::Value) -> usize;

    /// Subscribe with an MQTT-style pattern (`+` one level, `#` the rest)
    fn subscribe(&self, pattern: &str) -> Subscription;
}

/// In-process bus backed by a single broadcast channel
pub struct LocalMessageBus {
    sender: broadcast::Sender<BusMessage>,
}

impl LocalMessageBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for LocalMessageBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MessageBus for LocalMessageBus {
    fn publish(&self, topic: &str, payload: serde_json::Value) -> usize {
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        self.sender.send(message).unwrap_or(0)
    }

    fn subscribe(&self, pattern: &str) -> Subscription {
        Subscription {
            pattern: pattern.to_string(),
            receiver: self.sender.subscribe(),
        }
    }
}

pub struct Subscription {
    pattern: String,
    receiver: broadcast::Receiver<BusMessage>,
}

impl Subscription {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next message matching the pattern; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if topic_matches(&self.pattern, &message.topic) => return Some(message),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(pattern = %self.pattern, skipped, "bus subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

/// MQTT-style topic filter match
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

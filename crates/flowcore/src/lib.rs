//! Core abstractions for the flow engine
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: the persisted flow model, the node lifecycle
//! contract, real-time events, the messaging bus and the broadcast queue
//! that serializes access to shared transmitters.

pub mod broadcast;
mod error;
pub mod events;
mod flow;
mod message;
mod node;

pub use broadcast::{BroadcastHandle, BroadcastMetadata, BroadcastQueue, BroadcastStats};
pub use error::{panic_message, BroadcastJobError, FlowError, LifecyclePhase, NodeError, StoreError};
pub use events::*;
pub use flow::{
    ExecutionLogRecord, ExecutionStatus, FlowDefinition, FlowId, FlowStatus, NodeConfig, NodeId,
    WireSpec, DEFAULT_PORT,
};
pub use message::Message;
pub use node::{
    capture_outputs, Collaborators, Emission, LifecycleState, Node, NodeContext, NodeKind, Outbox,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;

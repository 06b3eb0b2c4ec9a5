//! Flow execution runtime
//!
//! This crate turns persisted flow definitions into live node networks:
//! the node registry, the per-flow runner that routes messages along
//! wires, the orchestrator that owns every running flow, and the
//! persistence collaborator they share.

mod config;
mod orchestrator;
mod registry;
mod runner;
mod store;
mod validation;

pub use config::RuntimeConfig;
pub use orchestrator::{FlowOrchestrator, RecoveryReport, ShutdownReport};
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry, PortDefinition};
pub use runner::FlowRunner;
pub use store::{FlowStore, JsonFileStore, MemoryFlowStore};
pub use validation::{validate_definition, ValidationReport};

//! Standard node library
//!
//! Collection of built-in nodes: timed sources, debug output, delays,
//! JSON transforms, message bus bridges and the radio transmitter.

mod bus;
mod debug;
mod inject;
mod radio;
mod time;
mod transform;

pub use bus::{BusInNode, BusOutNode};
pub use debug::DebugNode;
pub use inject::InjectNode;
pub use radio::{SimulatedTransmitter, TransmitNode, TransmitNodeFactory, Transmitter};
pub use time::DelayNode;
pub use transform::{JsonParseNode, JsonStringifyNode};

use flowcore::{NodeContext, NodeError};
use flowruntime::NodeRegistry;
use std::sync::Arc;

/// Register all standard nodes with a registry, using a simulated radio
pub fn register_all(registry: &mut NodeRegistry) {
    register_with_transmitter(registry, Arc::new(SimulatedTransmitter::default()));
}

/// Register all standard nodes, driving `radio.transmit` with `transmitter`
pub fn register_with_transmitter(registry: &mut NodeRegistry, transmitter: Arc<dyn Transmitter>) {
    registry.register(Arc::new(inject::InjectNodeFactory));
    registry.register(Arc::new(debug::DebugNodeFactory));
    registry.register(Arc::new(time::DelayNodeFactory));
    registry.register(Arc::new(transform::JsonParseNodeFactory));
    registry.register(Arc::new(transform::JsonStringifyNodeFactory));
    registry.register(Arc::new(bus::BusInNodeFactory));
    registry.register(Arc::new(bus::BusOutNodeFactory));
    registry.register(Arc::new(TransmitNodeFactory::new(transmitter)));
}

/// The context stored by `initialize`, or an error if it never ran
fn initialized(ctx: &Option<NodeContext>) -> Result<&NodeContext, NodeError> {
    ctx.as_ref()
        .ok_or_else(|| NodeError::ExecutionFailed("node used before initialize".to_string()))
}

// crates/flowcore/src/events/mod.rs

mod base;
mod bus;

pub use base::{EventBus, EventEmitter, ExecutionEvent, NodeEvent};
pub use bus::{topic_matches, BusMessage, LocalMessageBus, MessageBus, Subscription};

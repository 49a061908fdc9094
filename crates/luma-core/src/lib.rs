//! Core types for the Luma automation server
//!
//! This crate defines the canonical [`Event`] record that every producer
//! (bus adapter, scheduler, host API) materialises, the [`Value`] sum type
//! that crosses the host/script boundary, the static [`Device`] record
//! loaded from the inventory, and the [`EventSink`] seam that decouples
//! event producers from the routing layer.

mod device;
mod event;
mod value;

pub use device::{CommandEncoding, Device, MqttTopics};
pub use event::{Event, EventSource};
pub use value::Value;

/// Receiver side of the event pipeline.
///
/// Implemented by the event router; producers hold it as a trait object so
/// the bus adapter and scheduler never depend on routing internals.
pub trait EventSink: Send + Sync {
    /// Hand a freshly produced event over for routing and dispatch.
    fn dispatch(&self, event: Event);
}

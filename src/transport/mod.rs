//! Publish/subscribe transport seam.
//!
//! The sync engine only talks to a [`Transport`]: connect, subscribe to a
//! topic, publish bytes. Inbound traffic and link state arrive on the
//! [`EventStream`] handed back by [`Transport::connect`]. Delivery is assumed
//! to be at-least-once and unordered, with no deduplication.
//!
//! Implementations:
//! - [`MemoryBroker`] / [`MemoryTransport`]: in-process broker for tests and demos
//! - `MqttTransport`: rumqttc-backed client (feature `mqtt`)

pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use memory::{MemoryBroker, MemoryTransport};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Link-level notifications and inbound payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The broker accepted the session.
    Connected,
    /// The link dropped; no further messages arrive on this stream.
    ConnectionLost { reason: String },
    /// A payload delivered on `topic`.
    Message { topic: String, payload: Vec<u8> },
}

/// Receiving half of a connected session.
pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

/// Connect, subscribe and publish failures. All recoverable.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },
}

/// A publish/subscribe broker connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Open a session. The returned stream yields [`TransportEvent::Connected`]
    /// first, then messages for subscribed topics until the link drops.
    async fn connect(&self) -> Result<EventStream, TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Hand `payload` to the broker. Returning `Ok` does not mean any
    /// subscriber received it.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Close the session. Idempotent.
    async fn disconnect(&self);
}

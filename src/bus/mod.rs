//! Event bus over a managed topic/subscription broker.
//!
//! This module contains:
//! - `BusError`: Errors surfaced by the bus API
//! - `TransportMessage`: Broker-level envelope for a published event
//! - `SubscriptionRegistry`: Event type → handler mapping
//! - `TopicProducer` / `TopicConsumer`: Publish and consume integration events
//! - Connections that survive broker-side client closure
//! - Broker seam (`broker`) and the in-process implementation (`memory`)

use serde::{Deserialize, Serialize};

use crate::handlers::HandlerError;

pub mod broker;
pub mod connection;
pub mod consumer;
pub mod consumers;
pub mod dispatch;
#[cfg(feature = "memory")]
pub mod memory;
pub mod producer;
pub mod registry;

// Re-exports
pub use broker::{BrokerConnector, BrokerError, ManagementOutcome};
pub use connection::{ConsumerConnection, ProducerConnection};
pub use consumer::TopicConsumer;
pub use consumers::ConsumerSet;
pub use dispatch::DispatchOutcome;
#[cfg(feature = "memory")]
pub use memory::InMemoryBroker;
pub use producer::{EventProducer, TopicProducer};
pub use registry::{SubscriptionInfo, SubscriptionRegistry};

/// Content type of every message body published by the bus.
pub const JSON_CONTENT_TYPE: &str = "application/json";

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Handler '{handler}' already registered for '{event_type}'")]
    DuplicateHandler { event_type: String, handler: String },

    #[error("No subscriptions for event type '{0}'")]
    UnknownEventType(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handler '{handler}' failed on '{event_type}' (message {message_id}): {source}")]
    HandlerExecution {
        event_type: String,
        message_id: String,
        handler: String,
        #[source]
        source: HandlerError,
    },

    #[error("Failed to decode message {message_id}: {reason}")]
    Decode { message_id: String, reason: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl From<BrokerError> for BusError {
    fn from(err: BrokerError) -> Self {
        BusError::Transport(err.to_string())
    }
}

// ============================================================================
// Wire envelope
// ============================================================================

/// Broker-level envelope for one published integration event.
///
/// `message_id` carries the event id, `label` the event type and `session_id`
/// the event key (or the event type when no key was given).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub message_id: String,
    pub label: String,
    pub content_type: String,
    pub session_id: String,
    pub body: Vec<u8>,
}

impl TransportMessage {
    /// Build a JSON message for the given label.
    pub fn json(
        message_id: impl Into<String>,
        label: impl Into<String>,
        session_id: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            label: label.into(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            session_id: session_id.into(),
            body,
        }
    }
}

#[cfg(test)]
mod tests;

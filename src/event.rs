//! Integration event envelope.
//!
//! Every published event carries an id, a UTC creation timestamp, the
//! event-type name used for routing, and an optional partition key. The
//! payload fields are flattened next to the envelope fields, so a consumer can
//! decode the message body straight into the payload type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::{BusError, Result};

/// Marker for types that can travel as integration event payloads.
pub trait EventPayload: Serialize + serde::de::DeserializeOwned + Send + Sync + 'static {}

impl<T> EventPayload for T where T: Serialize + serde::de::DeserializeOwned + Send + Sync + 'static {}

/// Envelope around a payload published to a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationEvent<P> {
    id: Uuid,
    create_date_time: DateTime<Utc>,
    event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(flatten)]
    payload: P,
}

/// Event types are labels and rule names; blank ones are rejected everywhere.
pub(crate) fn require_event_type(event_type: &str) -> Result<()> {
    if event_type.trim().is_empty() {
        return Err(BusError::InvalidArgument(
            "event type must not be empty".to_string(),
        ));
    }
    Ok(())
}

impl<P> IntegrationEvent<P> {
    /// Create an event without a partition key.
    pub fn new(event_type: impl Into<String>, payload: P) -> Result<Self> {
        let event_type = event_type.into();
        require_event_type(&event_type)?;

        Ok(Self {
            id: Uuid::new_v4(),
            create_date_time: Utc::now(),
            event_type,
            key: None,
            payload,
        })
    }

    /// Create an event with an explicit partition/session key.
    pub fn with_key(
        event_type: impl Into<String>,
        key: impl Into<String>,
        payload: P,
    ) -> Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(BusError::InvalidArgument("key must not be empty".to_string()));
        }

        let mut event = Self::new(event_type, payload)?;
        event.key = Some(key);
        Ok(event)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn create_date_time(&self) -> DateTime<Utc> {
        self.create_date_time
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Session id used for broker-side grouping: the key, or the event type.
    pub fn session_id(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.event_type)
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

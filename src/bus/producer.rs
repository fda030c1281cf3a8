//! Integration event producer.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::broker::BrokerConnector;
use super::connection::ProducerConnection;
use super::{Result, TransportMessage};
use crate::config::EventBusOptions;
use crate::event::{EventPayload, IntegrationEvent};

/// Publishes integration events.
#[async_trait]
pub trait EventProducer: Send + Sync {
    /// Serialize and send one event. Not retried on failure.
    async fn send<P: EventPayload>(&self, event: &IntegrationEvent<P>) -> Result<()>;
}

/// Producer bound to one topic.
pub struct TopicProducer {
    connection: ProducerConnection,
}

impl TopicProducer {
    /// Connect to the topic named in `options`, creating it if needed.
    pub async fn connect(
        options: EventBusOptions,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self> {
        let connection = ProducerConnection::connect(options, connector).await?;
        Ok(Self { connection })
    }

    pub fn topic(&self) -> &str {
        self.connection.topic()
    }

    /// Build the broker message for `event` without sending it.
    pub fn build_message<P: EventPayload>(event: &IntegrationEvent<P>) -> Result<TransportMessage> {
        let body = serde_json::to_vec(event)?;
        Ok(TransportMessage::json(
            event.id().to_string(),
            event.event_type(),
            event.session_id(),
            body,
        ))
    }

    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }
}

#[async_trait]
impl EventProducer for TopicProducer {
    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(topic = %self.connection.topic(), event_type = %event.event_type())
    )]
    async fn send<P: EventPayload>(&self, event: &IntegrationEvent<P>) -> Result<()> {
        let message = Self::build_message(event)?;
        let message_id = message.message_id.clone();

        self.connection.send(message).await?;

        info!(
            event_type = %event.event_type(),
            topic = %self.connection.topic(),
            message_id = %message_id,
            "Event published"
        );
        Ok(())
    }
}

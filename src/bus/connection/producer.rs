//! Send-side connection to one topic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::handle::HandleCell;
use crate::bus::broker::{BrokerConnector, ManagementClient, ManagementOutcome, TopicClient};
use crate::bus::{BusError, Result, TransportMessage};
use crate::config::EventBusOptions;

/// Owns the topic client handle used by a producer.
pub struct ProducerConnection {
    options: EventBusOptions,
    client: HandleCell<dyn TopicClient>,
    closed: AtomicBool,
}

impl ProducerConnection {
    /// Validate options, make sure the topic exists, and open a handle.
    pub async fn connect(
        options: EventBusOptions,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self> {
        options.validate()?;

        let management = connector.management_client(&options.connection_string);
        ensure_topic_exists(management.as_ref(), &options.topic).await?;

        let client = HandleCell::new({
            let connection_string = options.connection_string.clone();
            let topic = options.topic.clone();
            move || connector.topic_client(&connection_string, &topic)
        });

        info!(topic = %options.topic, "Producer connection opened");

        Ok(Self {
            options,
            client,
            closed: AtomicBool::new(false),
        })
    }

    pub fn topic(&self) -> &str {
        &self.options.topic
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// A live topic client, recreated if the broker closed the previous one.
    ///
    /// Fails once the connection itself was closed.
    pub fn topic_client(&self) -> Result<Arc<dyn TopicClient>> {
        if self.is_closed() {
            return Err(BusError::Transport(format!(
                "connection to topic '{}' is closed",
                self.options.topic
            )));
        }

        let (client, recreated) = self.client.get();
        if recreated {
            info!(topic = %self.options.topic, "Topic client was closed, created a new one");
        }
        Ok(client)
    }

    /// Send one message. Broker failures surface as `BusError::Transport`.
    pub async fn send(&self, message: TransportMessage) -> Result<()> {
        self.topic_client()?.send(message).await?;
        Ok(())
    }

    /// Close the topic client.
    ///
    /// After the first call no client is ever recreated. Calling again is a
    /// no-op once the handle is closed, and retries the close if it failed.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);

        let client = self.client.current();
        if client.is_closed_or_closing() {
            debug!(topic = %self.options.topic, "Topic client already closed");
            return Ok(());
        }

        client.close().await?;
        info!(topic = %self.options.topic, "Producer connection closed");
        Ok(())
    }
}

/// Create the topic unless it is already there.
///
/// Losing a creation race to another process is not an error.
pub(crate) async fn ensure_topic_exists(
    management: &dyn ManagementClient,
    topic: &str,
) -> Result<()> {
    if management.topic_exists(topic).await? {
        return Ok(());
    }

    match management.create_topic(topic).await? {
        ManagementOutcome::Done => {
            info!(topic = %topic, "Topic created");
            Ok(())
        }
        ManagementOutcome::AlreadyExists => {
            debug!(topic = %topic, "Topic created concurrently");
            Ok(())
        }
        ManagementOutcome::NotFound => Err(BusError::Transport(format!(
            "namespace for topic '{}' not found",
            topic
        ))),
    }
}

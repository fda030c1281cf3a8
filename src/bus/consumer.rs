//! Integration event consumer for one topic.
//!
//! Owns the subscription registry and the consumer connection, and hands
//! the connection a callback that runs the dispatch pipeline.

use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::info;

use super::broker::BrokerConnector;
use super::connection::{ConsumerConnection, ProcessFn};
use super::dispatch::Dispatcher;
use super::registry::SubscriptionRegistry;
use super::{BusError, Result, TransportMessage};
use crate::config::EventBusOptions;
use crate::event::{require_event_type, EventPayload};
use crate::handlers::{short_type_name, HandlerResolver, IntegrationEventHandler};

/// Subscribes typed handlers to event types on one topic subscription.
pub struct TopicConsumer {
    registry: Arc<RwLock<SubscriptionRegistry>>,
    connection: ConsumerConnection,
    dispatcher: Arc<Dispatcher>,
}

impl TopicConsumer {
    /// Connect to the subscription and start receiving.
    ///
    /// Messages arriving before any `subscribe` call are acknowledged and
    /// dropped.
    pub async fn connect(
        options: EventBusOptions,
        connector: Arc<dyn BrokerConnector>,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Result<Self> {
        let connection = ConsumerConnection::connect(options, connector).await?;
        let registry = Arc::new(RwLock::new(SubscriptionRegistry::new()));
        let dispatcher = Arc::new(Dispatcher::new(
            connection.topic(),
            registry.clone(),
            resolver,
        ));

        let process: ProcessFn = {
            let dispatcher = dispatcher.clone();
            Arc::new(move |message: TransportMessage| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.process(&message).await }.boxed()
            })
        };
        connection.register_handler(process)?;

        Ok(Self {
            registry,
            connection,
            dispatcher,
        })
    }

    pub fn topic(&self) -> &str {
        self.connection.topic()
    }

    pub fn subscription(&self) -> &str {
        self.connection.subscription()
    }

    /// Subscribe handler `H` for payload `E` to `event_type`.
    ///
    /// The broker rule is added before the registry entry, and only for the
    /// first handler of an event type.
    pub async fn subscribe<E, H>(&self, event_type: &str) -> Result<()>
    where
        E: EventPayload,
        H: IntegrationEventHandler<E>,
    {
        require_event_type(event_type)?;
        self.ensure_open()?;

        let mut registry = self.registry.write().await;
        if !registry.has_subscriptions(event_type) {
            self.connection.add_rule(event_type).await?;
        }

        info!(
            event_type = %event_type,
            handler = short_type_name::<H>(),
            topic = %self.topic(),
            "Subscribing to event"
        );

        registry.add::<E, H>(event_type)
    }

    /// Unsubscribe handler `H` from `event_type`.
    ///
    /// The broker rule is removed even if other handlers remain subscribed.
    pub async fn unsubscribe<E, H>(&self, event_type: &str) -> Result<()>
    where
        E: EventPayload,
        H: IntegrationEventHandler<E>,
    {
        require_event_type(event_type)?;

        let mut registry = self.registry.write().await;
        self.connection.remove_rule(event_type).await?;

        info!(
            event_type = %event_type,
            handler = short_type_name::<H>(),
            topic = %self.topic(),
            "Unsubscribing from event"
        );

        registry.remove::<H>(event_type);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.connection.is_closed() {
            return Err(BusError::Transport(format!(
                "consumer for subscription '{}' is closed",
                self.subscription()
            )));
        }
        Ok(())
    }

    pub async fn has_subscriptions(&self, event_type: &str) -> bool {
        self.registry.read().await.has_subscriptions(event_type)
    }

    pub fn connection(&self) -> &ConsumerConnection {
        &self.connection
    }

    /// Run one message through the dispatch pipeline directly, bypassing the
    /// broker.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }
}

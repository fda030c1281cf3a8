//! Consumers keyed by topic.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info};

use super::broker::BrokerConnector;
use super::consumer::TopicConsumer;
use super::{BusError, Result};
use crate::config::EventBusOptions;
use crate::handlers::HandlerResolver;

/// One consumer per topic, sharing a broker connector and handler resolver.
pub struct ConsumerSet {
    consumers: HashMap<String, Arc<TopicConsumer>>,
    connector: Arc<dyn BrokerConnector>,
    resolver: Arc<dyn HandlerResolver>,
}

impl ConsumerSet {
    pub fn new(connector: Arc<dyn BrokerConnector>, resolver: Arc<dyn HandlerResolver>) -> Self {
        Self {
            consumers: HashMap::new(),
            connector,
            resolver,
        }
    }

    /// Build a consumer for `topic` from the shared options.
    pub async fn add(&mut self, options: &EventBusOptions, topic: &str) -> Result<Arc<TopicConsumer>> {
        if topic.trim().is_empty() {
            return Err(BusError::InvalidArgument("topic should not be empty".to_string()));
        }
        if self.consumers.contains_key(topic) {
            return Err(BusError::InvalidArgument(format!(
                "a consumer for topic '{}' is already registered",
                topic
            )));
        }

        let consumer = Arc::new(
            TopicConsumer::connect(
                options.for_topic(topic),
                self.connector.clone(),
                self.resolver.clone(),
            )
            .await?,
        );
        self.consumers.insert(topic.to_string(), consumer.clone());

        info!(topic = %topic, "Consumer registered");
        Ok(consumer)
    }

    /// The consumer for `topic`.
    pub fn get(&self, topic: &str) -> Result<Arc<TopicConsumer>> {
        if topic.trim().is_empty() {
            return Err(BusError::InvalidArgument("topic should not be empty".to_string()));
        }
        self.consumers
            .get(topic)
            .cloned()
            .ok_or_else(|| BusError::InvalidArgument(format!("no consumer for topic '{}'", topic)))
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.consumers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Close every consumer. Returns the first failure after trying all.
    pub async fn close_all(&self) -> Result<()> {
        let mut first_error = None;
        for (topic, consumer) in &self.consumers {
            if let Err(e) = consumer.close().await {
                error!(topic = %topic, error = %e, "Failed to close consumer");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

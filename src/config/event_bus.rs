//! Event bus options.

use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;
use crate::bus::broker::SubscriptionDescription;

/// Connection and delivery settings for one topic.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EventBusOptions {
    /// Broker connection string.
    pub connection_string: String,
    /// Topic to publish to / consume from.
    pub topic: String,
    /// Subscription name (consumers only).
    pub subscription: String,
    /// Max concurrent callbacks (message mode) or sessions (session mode).
    pub max_concurrent_calls: usize,
    /// Deliveries before the broker dead-letters a message.
    pub max_delivery_count: u32,
    /// Receive session-affine instead of individual messages.
    pub use_sessions: bool,
    /// How long a received message stays locked.
    pub lock_duration_secs: u64,
    /// Default time-to-live for messages in a newly created subscription.
    pub message_time_to_live_secs: u64,
    /// How often a consumer checks for a broker-closed client and reattaches.
    pub reconnect_interval_ms: u64,
}

impl Default for EventBusOptions {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            topic: String::new(),
            subscription: String::new(),
            max_concurrent_calls: 10,
            max_delivery_count: 10,
            use_sessions: false,
            lock_duration_secs: 30,
            message_time_to_live_secs: 24 * 60 * 60,
            reconnect_interval_ms: 1000,
        }
    }
}

impl EventBusOptions {
    /// Same options, bound to `topic`.
    pub fn for_topic(&self, topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..self.clone()
        }
    }

    /// Set the subscription name.
    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = subscription.into();
        self
    }

    /// Enable or disable session mode.
    pub fn with_sessions(mut self, use_sessions: bool) -> Self {
        self.use_sessions = use_sessions;
        self
    }

    /// Set max concurrent calls / sessions.
    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max;
        self
    }

    /// Set the max delivery count.
    pub fn with_max_delivery_count(mut self, max: u32) -> Self {
        self.max_delivery_count = max;
        self
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn message_time_to_live(&self) -> Duration {
        Duration::from_secs(self.message_time_to_live_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Validate settings shared by producers and consumers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_string.trim().is_empty() {
            return Err(invalid("connection_string", "should not be empty"));
        }
        if self.topic.trim().is_empty() {
            return Err(invalid("topic", "should not be empty"));
        }
        if self.max_concurrent_calls == 0 {
            return Err(invalid("max_concurrent_calls", "must be at least 1"));
        }
        if self.max_delivery_count == 0 {
            return Err(invalid("max_delivery_count", "must be at least 1"));
        }
        if self.reconnect_interval_ms == 0 {
            return Err(invalid("reconnect_interval_ms", "must be at least 1"));
        }
        Ok(())
    }

    /// Validate settings needed to consume.
    pub fn validate_consumer(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.subscription.trim().is_empty() {
            return Err(invalid("subscription", "should not be empty"));
        }
        Ok(())
    }

    /// Description used when the subscription has to be created.
    pub fn subscription_description(&self) -> SubscriptionDescription {
        SubscriptionDescription {
            topic: self.topic.clone(),
            name: self.subscription.clone(),
            requires_session: self.use_sessions,
            max_delivery_count: self.max_delivery_count,
            lock_duration: self.lock_duration(),
            default_message_time_to_live: self.message_time_to_live(),
        }
    }

    /// Create options for testing.
    pub fn for_test() -> Self {
        Self {
            connection_string: "memory://test".to_string(),
            topic: "test-topic".to_string(),
            subscription: "test-subscription".to_string(),
            reconnect_interval_ms: 50,
            ..Self::default()
        }
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = EventBusOptions::default();
        assert_eq!(options.max_concurrent_calls, 10);
        assert_eq!(options.max_delivery_count, 10);
        assert!(!options.use_sessions);
        assert_eq!(options.lock_duration(), Duration::from_secs(30));
        assert_eq!(options.message_time_to_live(), Duration::from_secs(86_400));
        assert_eq!(options.reconnect_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_empty_topic() {
        let options = EventBusOptions::for_test().for_topic("  ");
        assert!(matches!(
            options.validate(),
            Err(ConfigError::Invalid { field: "topic", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_connection_string() {
        let options = EventBusOptions {
            connection_string: String::new(),
            ..EventBusOptions::for_test()
        };
        assert!(matches!(
            options.validate(),
            Err(ConfigError::Invalid { field: "connection_string", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let options = EventBusOptions::for_test().with_max_concurrent_calls(0);
        assert!(options.validate().is_err());

        let options = EventBusOptions::for_test().with_max_delivery_count(0);
        assert!(options.validate().is_err());

        let options = EventBusOptions {
            reconnect_interval_ms: 0,
            ..EventBusOptions::for_test()
        };
        assert!(matches!(
            options.validate(),
            Err(ConfigError::Invalid { field: "reconnect_interval_ms", .. })
        ));
    }

    #[test]
    fn test_producer_does_not_need_subscription() {
        let options = EventBusOptions::for_test().with_subscription("");
        assert!(options.validate().is_ok());
        assert!(matches!(
            options.validate_consumer(),
            Err(ConfigError::Invalid { field: "subscription", .. })
        ));
    }

    #[test]
    fn test_for_topic_keeps_other_settings() {
        let base = EventBusOptions::for_test()
            .with_sessions(true)
            .with_max_delivery_count(4);
        let bound = base.for_topic("edge-device");

        assert_eq!(bound.topic, "edge-device");
        assert!(bound.use_sessions);
        assert_eq!(bound.max_delivery_count, 4);
        assert_eq!(bound.subscription, base.subscription);
    }

    #[test]
    fn test_subscription_description() {
        let description = EventBusOptions::for_test()
            .with_sessions(true)
            .subscription_description();

        assert_eq!(description.topic, "test-topic");
        assert_eq!(description.name, "test-subscription");
        assert!(description.requires_session);
        assert_eq!(description.max_delivery_count, 10);
        assert_eq!(description.lock_duration, Duration::from_secs(30));
    }
}

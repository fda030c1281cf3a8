//! Per-message dispatch.
//!
//! Looks the message label up in the subscription registry, decodes the body
//! for each subscribed payload type, and runs the matching handlers in
//! subscription order inside one handler scope. The first handler failure
//! stops the run and is returned so the connection withholds the
//! acknowledgement.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::registry::SubscriptionRegistry;
use super::{BusError, Result, TransportMessage};
use crate::event::EventPayload;
use crate::handlers::{HandlerError, HandlerResolver, HandlerScope, IntegrationEventHandler};

/// Result of processing a message through handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handlers ran; `handled` counts those resolved and invoked.
    Processed { handled: usize },
    /// Nobody subscribes to the label; the message is dropped.
    NoSubscribers,
}

impl DispatchOutcome {
    /// Returns true if the message should be acknowledged (removed from the
    /// subscription).
    ///
    /// Messages nobody subscribes to are acknowledged too, so the broker does
    /// not redeliver them.
    pub fn should_ack(&self) -> bool {
        matches!(self, Self::Processed { .. } | Self::NoSubscribers)
    }
}

// ============================================================================
// Typed invocation
// ============================================================================

/// What happened when one subscription was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InvokeOutcome {
    Handled,
    HandlerNotRegistered,
}

#[derive(Debug)]
pub(crate) enum InvokeError {
    Decode(serde_json::Error),
    Handler(HandlerError),
}

/// Decode-and-invoke step for one (payload, handler) subscription.
#[async_trait]
pub(crate) trait Invoke: Send + Sync {
    async fn invoke(
        &self,
        scope: &dyn HandlerScope,
        body: &str,
    ) -> std::result::Result<InvokeOutcome, InvokeError>;
}

pub(crate) struct TypedInvoker<E, H> {
    _marker: PhantomData<fn() -> (E, H)>,
}

impl<E, H> TypedInvoker<E, H> {
    pub(crate) fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<E, H> Invoke for TypedInvoker<E, H>
where
    E: EventPayload,
    H: IntegrationEventHandler<E>,
{
    async fn invoke(
        &self,
        scope: &dyn HandlerScope,
        body: &str,
    ) -> std::result::Result<InvokeOutcome, InvokeError> {
        let Some(handler) = scope.resolve::<H>() else {
            return Ok(InvokeOutcome::HandlerNotRegistered);
        };

        let event: E = serde_json::from_str(body).map_err(InvokeError::Decode)?;
        handler.handle(event).await.map_err(InvokeError::Handler)?;
        Ok(InvokeOutcome::Handled)
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Runs the dispatch procedure for one topic's consumer.
pub struct Dispatcher {
    topic: String,
    registry: Arc<RwLock<SubscriptionRegistry>>,
    resolver: Arc<dyn HandlerResolver>,
}

impl Dispatcher {
    pub fn new(
        topic: impl Into<String>,
        registry: Arc<RwLock<SubscriptionRegistry>>,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Self {
        Self {
            topic: topic.into(),
            registry,
            resolver,
        }
    }

    /// Process one received message.
    ///
    /// # Returns
    /// * `Ok(DispatchOutcome::NoSubscribers)` - Label has no subscriptions
    /// * `Ok(DispatchOutcome::Processed)` - Every resolved handler succeeded
    /// * `Err(BusError::Decode)` - Body is not UTF-8 or not the payload JSON
    /// * `Err(BusError::HandlerExecution)` - A handler failed; later handlers
    ///   did not run
    #[tracing::instrument(
        name = "bus.consume",
        skip_all,
        fields(topic = %self.topic, event_type = %message.label, message_id = %message.message_id)
    )]
    pub async fn process(&self, message: &TransportMessage) -> Result<DispatchOutcome> {
        let event_type = message.label.as_str();

        // Snapshot the subscriptions so handlers run without holding the lock.
        let subscriptions = {
            let registry = self.registry.read().await;
            if !registry.has_subscriptions(event_type) {
                debug!(event_type = %event_type, "Ignore message. No subscribers for event");
                return Ok(DispatchOutcome::NoSubscribers);
            }
            registry.get(event_type)?.to_vec()
        };

        let body = std::str::from_utf8(&message.body).map_err(|e| BusError::Decode {
            message_id: message.message_id.clone(),
            reason: e.to_string(),
        })?;

        info!(
            event_type = %event_type,
            topic = %self.topic,
            payload = %body,
            "Event received"
        );

        let scope = self.resolver.create_scope();
        let mut handled = 0;

        for subscription in &subscriptions {
            let handler = subscription.handler_type();

            match subscription.invoker().invoke(scope.as_ref(), body).await {
                Ok(InvokeOutcome::Handled) => handled += 1,
                Ok(InvokeOutcome::HandlerNotRegistered) => {
                    debug!(handler = %handler, "Handler not registered, skipping");
                }
                Err(InvokeError::Decode(e)) => {
                    error!(
                        event_type = %event_type,
                        message_id = %message.message_id,
                        payload_type = subscription.payload_type(),
                        error = %e,
                        "Failed to decode event payload"
                    );
                    return Err(BusError::Decode {
                        message_id: message.message_id.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(InvokeError::Handler(e)) => {
                    error!(
                        event_type = %event_type,
                        message_id = %message.message_id,
                        handler = %handler,
                        error = %e,
                        "Message handler encountered an exception"
                    );
                    return Err(BusError::HandlerExecution {
                        event_type: event_type.to_string(),
                        message_id: message.message_id.clone(),
                        handler: handler.name().to_string(),
                        source: e,
                    });
                }
            }
        }

        Ok(DispatchOutcome::Processed { handled })
    }
}

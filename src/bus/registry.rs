//! In-memory subscription registry.
//!
//! Maps an event-type name to the ordered list of (payload type, handler type)
//! pairs subscribed to it. Insertion order is dispatch order. A key never maps
//! to an empty list: removing the last subscription removes the key.
//!
//! The registry performs no I/O and no locking; owners that share it across
//! tasks wrap it in a lock (see `TopicConsumer`).

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::dispatch::{Invoke, TypedInvoker};
use super::{BusError, Result};
use crate::event::EventPayload;
use crate::handlers::{short_type_name, IntegrationEventHandler};

/// Identity of a handler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerType {
    id: TypeId,
    name: &'static str,
}

impl HandlerType {
    pub fn of<H: 'static>() -> Self {
        Self {
            id: TypeId::of::<H>(),
            name: short_type_name::<H>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// One subscription: which payload type to decode and which handler to run.
///
/// Carries the monomorphized decode-and-invoke function for the pair, so
/// dispatch never looks types up at runtime.
#[derive(Clone)]
pub struct SubscriptionInfo {
    payload_type: &'static str,
    handler_type: HandlerType,
    invoker: Arc<dyn Invoke>,
}

impl SubscriptionInfo {
    /// Build the subscription for payload `E` handled by `H`.
    pub fn new<E, H>() -> Self
    where
        E: EventPayload,
        H: IntegrationEventHandler<E>,
    {
        Self {
            payload_type: short_type_name::<E>(),
            handler_type: HandlerType::of::<H>(),
            invoker: Arc::new(TypedInvoker::<E, H>::new()),
        }
    }

    pub fn payload_type(&self) -> &'static str {
        self.payload_type
    }

    pub fn handler_type(&self) -> HandlerType {
        self.handler_type
    }

    pub(crate) fn invoker(&self) -> &dyn Invoke {
        self.invoker.as_ref()
    }
}

impl fmt::Debug for SubscriptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionInfo")
            .field("payload_type", &self.payload_type)
            .field("handler_type", &self.handler_type.name)
            .finish()
    }
}

/// Event type → ordered subscriptions.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: HashMap<String, Vec<SubscriptionInfo>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff at least one handler is subscribed to `event_type`.
    pub fn has_subscriptions(&self, event_type: &str) -> bool {
        self.subscriptions.contains_key(event_type)
    }

    /// Subscribe handler `H` for payload `E` under `event_type`.
    pub fn add<E, H>(&mut self, event_type: &str) -> Result<()>
    where
        E: EventPayload,
        H: IntegrationEventHandler<E>,
    {
        self.add_subscription(event_type, SubscriptionInfo::new::<E, H>())
    }

    /// Append a prepared subscription.
    ///
    /// Fails with `DuplicateHandler` if the handler type is already subscribed
    /// to `event_type`; the existing entry is kept.
    pub fn add_subscription(&mut self, event_type: &str, info: SubscriptionInfo) -> Result<()> {
        let entries = self.subscriptions.entry(event_type.to_string()).or_default();

        if entries
            .iter()
            .any(|existing| existing.handler_type == info.handler_type)
        {
            return Err(BusError::DuplicateHandler {
                event_type: event_type.to_string(),
                handler: info.handler_type.name.to_string(),
            });
        }

        entries.push(info);
        Ok(())
    }

    /// Unsubscribe handler `H` from `event_type`.
    pub fn remove<H: 'static>(&mut self, event_type: &str) {
        self.remove_handler(event_type, HandlerType::of::<H>());
    }

    /// Remove every entry for `handler_type` under `event_type`.
    ///
    /// Drops the key once its list is empty. Unknown event types are a no-op.
    pub fn remove_handler(&mut self, event_type: &str, handler_type: HandlerType) {
        let Some(entries) = self.subscriptions.get_mut(event_type) else {
            return;
        };

        entries.retain(|info| info.handler_type != handler_type);

        if entries.is_empty() {
            self.subscriptions.remove(event_type);
        }
    }

    /// Subscriptions for `event_type`, in dispatch order.
    pub fn get(&self, event_type: &str) -> Result<&[SubscriptionInfo]> {
        self.subscriptions
            .get(event_type)
            .map(Vec::as_slice)
            .ok_or_else(|| BusError::UnknownEventType(event_type.to_string()))
    }

    /// Event types with at least one subscription.
    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }
}

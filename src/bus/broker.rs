//! Broker seam.
//!
//! The bus never talks to a messaging SDK directly. It talks to these traits,
//! which model the surface of a managed topic/subscription broker: topic and
//! subscription management, label-correlation rules, peek-lock receive in
//! plain and session-affine modes, and lock-token acknowledgement.
//!
//! Management calls report the idempotent conditions ("already exists",
//! "not found") as [`ManagementOutcome`] variants rather than errors, so
//! callers handle them as ordinary control flow.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::TransportMessage;

/// Name of the catch-all rule every new subscription starts with.
pub const DEFAULT_RULE_NAME: &str = "$Default";

/// Result type for broker calls.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Error type returned by receive callbacks.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Failures reported by the broker client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Client for '{0}' is closed")]
    Closed(String),

    #[error("Lock lost for token {0}")]
    LockLost(LockToken),

    #[error("{operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },
}

/// Outcome of an idempotent management call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementOutcome {
    /// The change was applied.
    Done,
    /// The entity was already there.
    AlreadyExists,
    /// The entity (or its parent) does not exist.
    NotFound,
}

// ============================================================================
// Value types
// ============================================================================

/// Predicate deciding which published messages reach a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleFilter {
    /// Matches every message.
    True,
    /// Matches messages whose label equals `label`.
    Correlation { label: String },
}

impl RuleFilter {
    pub fn matches(&self, message: &TransportMessage) -> bool {
        match self {
            RuleFilter::True => true,
            RuleFilter::Correlation { label } => *label == message.label,
        }
    }
}

impl fmt::Display for RuleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleFilter::True => f.write_str("TrueFilter"),
            RuleFilter::Correlation { label } => write!(f, "CorrelationFilter: Label = '{}'", label),
        }
    }
}

/// Named subscription rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDescription {
    pub name: String,
    pub filter: RuleFilter,
}

impl RuleDescription {
    /// Rule named after the event type, matching messages labelled with it.
    pub fn for_label(event_type: &str) -> Self {
        Self {
            name: event_type.to_string(),
            filter: RuleFilter::Correlation {
                label: event_type.to_string(),
            },
        }
    }

    /// The catch-all rule a subscription is created with.
    pub fn catch_all() -> Self {
        Self {
            name: DEFAULT_RULE_NAME.to_string(),
            filter: RuleFilter::True,
        }
    }
}

/// Parameters for creating a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDescription {
    pub topic: String,
    pub name: String,
    pub requires_session: bool,
    pub max_delivery_count: u32,
    pub lock_duration: Duration,
    pub default_message_time_to_live: Duration,
}

/// Opaque token identifying one locked delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A message delivered under a peek-lock.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: TransportMessage,
    pub lock_token: LockToken,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

/// Context passed to the exception callback when a receive callback fails.
#[derive(Debug, Clone)]
pub struct ExceptionReceived {
    pub error: String,
    pub endpoint: String,
    pub entity_path: String,
    pub action: String,
}

pub type ExceptionHandler = Arc<dyn Fn(ExceptionReceived) + Send + Sync>;

/// Callback for message mode. The token is cancelled when the receiving
/// client shuts down.
pub type MessageCallback = Arc<
    dyn Fn(ReceivedMessage, CancellationToken) -> BoxFuture<'static, Result<(), CallbackError>>
        + Send
        + Sync,
>;

/// Callback for session mode; completion goes through the session.
pub type SessionCallback = Arc<
    dyn Fn(
            Arc<dyn MessageSession>,
            ReceivedMessage,
            CancellationToken,
        ) -> BoxFuture<'static, Result<(), CallbackError>>
        + Send
        + Sync,
>;

/// Options for message-mode receive.
#[derive(Clone)]
pub struct MessageHandlerOptions {
    pub max_concurrent_calls: usize,
    pub auto_complete: bool,
    pub exception_received: ExceptionHandler,
}

/// Options for session-mode receive.
#[derive(Clone)]
pub struct SessionHandlerOptions {
    pub max_concurrent_sessions: usize,
    pub auto_complete: bool,
    pub exception_received: ExceptionHandler,
}

// ============================================================================
// Client traits
// ============================================================================

/// Lifecycle state shared by every broker client handle.
pub trait ClientState: Send + Sync {
    fn is_closed_or_closing(&self) -> bool;
}

/// Send-capable handle bound to one topic.
#[async_trait]
pub trait TopicClient: ClientState {
    fn topic_name(&self) -> &str;

    async fn send(&self, message: TransportMessage) -> BrokerResult<()>;

    async fn close(&self) -> BrokerResult<()>;
}

/// Receive-capable handle bound to one topic + subscription pair.
#[async_trait]
pub trait SubscriptionClient: ClientState {
    fn topic_path(&self) -> &str;

    fn subscription_name(&self) -> &str;

    async fn add_rule(&self, rule: RuleDescription) -> BrokerResult<ManagementOutcome>;

    async fn remove_rule(&self, name: &str) -> BrokerResult<ManagementOutcome>;

    /// Current rules, or `None` if the subscription does not exist.
    async fn get_rules(&self) -> BrokerResult<Option<Vec<RuleDescription>>>;

    fn register_message_handler(
        &self,
        callback: MessageCallback,
        options: MessageHandlerOptions,
    ) -> BrokerResult<()>;

    fn register_session_handler(
        &self,
        callback: SessionCallback,
        options: SessionHandlerOptions,
    ) -> BrokerResult<()>;

    /// Acknowledge a message received in message mode.
    async fn complete(&self, lock_token: LockToken) -> BrokerResult<()>;

    async fn close(&self) -> BrokerResult<()>;
}

/// Session a session-mode message was delivered on.
#[async_trait]
pub trait MessageSession: Send + Sync {
    fn session_id(&self) -> &str;

    async fn complete(&self, lock_token: LockToken) -> BrokerResult<()>;
}

/// Broker management surface.
#[async_trait]
pub trait ManagementClient: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> BrokerResult<bool>;

    async fn create_topic(&self, topic: &str) -> BrokerResult<ManagementOutcome>;

    async fn subscription_exists(&self, topic: &str, subscription: &str) -> BrokerResult<bool>;

    async fn create_subscription(
        &self,
        description: SubscriptionDescription,
    ) -> BrokerResult<ManagementOutcome>;
}

/// Entry point of a broker SDK: hands out client handles.
///
/// Creating a handle is cheap and never fails; network work happens on use.
pub trait BrokerConnector: Send + Sync {
    fn topic_client(&self, connection_string: &str, topic: &str) -> Arc<dyn TopicClient>;

    fn subscription_client(
        &self,
        connection_string: &str,
        topic: &str,
        subscription: &str,
    ) -> Arc<dyn SubscriptionClient>;

    fn management_client(&self, connection_string: &str) -> Arc<dyn ManagementClient>;
}

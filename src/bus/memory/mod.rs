//! In-process broker.
//!
//! Implements the broker seam without any network: topics fan messages out
//! to subscriptions whose rules match, and subscriptions hand them to
//! registered callbacks under a peek-lock. A message that is not completed
//! before its callback returns is put back at the head of the queue with its
//! delivery count kept; once the count reaches the subscription's
//! `max_delivery_count` it is moved to the dead-letter list instead.
//!
//! Connection strings are accepted but ignored. Lock expiry is not simulated:
//! a message stays locked until its callback returns.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::broker::{
    BrokerConnector, BrokerError, BrokerResult, ClientState, ExceptionHandler, ExceptionReceived,
    LockToken, ManagementClient, ManagementOutcome, MessageCallback, MessageHandlerOptions,
    MessageSession, ReceivedMessage, RuleDescription, SessionCallback, SessionHandlerOptions,
    SubscriptionClient, SubscriptionDescription, TopicClient,
};
use super::TransportMessage;

/// How long an idle receive loop sleeps before checking the queue again.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

const ENDPOINT: &str = "memory://";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Broker state
// ============================================================================

/// In-process broker shared by every client it hands out.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    topics: Mutex<HashMap<String, HashMap<String, Arc<SubscriptionState>>>>,
    clients: Mutex<Vec<Weak<Lifecycle>>>,
    created_clients: AtomicUsize,
}

struct Pending {
    message: TransportMessage,
    delivery_count: u32,
}

struct InFlight {
    message: TransportMessage,
    delivery_count: u32,
}

#[derive(Default)]
struct Queues {
    rules: Vec<RuleDescription>,
    ready: VecDeque<Pending>,
    in_flight: HashMap<LockToken, InFlight>,
    active_sessions: HashSet<String>,
    dead_letters: Vec<TransportMessage>,
}

struct SubscriptionState {
    description: SubscriptionDescription,
    queues: Mutex<Queues>,
    notify: Notify,
}

impl SubscriptionState {
    fn new(description: SubscriptionDescription) -> Self {
        Self {
            description,
            queues: Mutex::new(Queues {
                rules: vec![RuleDescription::catch_all()],
                ..Queues::default()
            }),
            notify: Notify::new(),
        }
    }

    fn entity_path(&self) -> String {
        format!(
            "{}/subscriptions/{}",
            self.description.topic, self.description.name
        )
    }

    /// Enqueue if any rule matches. Returns whether the message was accepted.
    fn offer(&self, message: &TransportMessage) -> bool {
        let accepted = {
            let mut queues = lock(&self.queues);
            if queues.rules.iter().any(|rule| rule.filter.matches(message)) {
                queues.ready.push_back(Pending {
                    message: message.clone(),
                    delivery_count: 0,
                });
                true
            } else {
                false
            }
        };
        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    /// Lock the next deliverable message.
    ///
    /// In session mode a message is deliverable only if no other message of
    /// its session is in flight.
    fn take_next(&self, sessions: bool) -> Option<ReceivedMessage> {
        let mut queues = lock(&self.queues);

        let position = if sessions {
            let active = &queues.active_sessions;
            queues
                .ready
                .iter()
                .position(|pending| !active.contains(&pending.message.session_id))?
        } else if queues.ready.is_empty() {
            return None;
        } else {
            0
        };

        let pending = queues.ready.remove(position)?;
        let delivery_count = pending.delivery_count + 1;
        let lock_token = LockToken::new();

        if sessions {
            queues
                .active_sessions
                .insert(pending.message.session_id.clone());
        }

        queues.in_flight.insert(
            lock_token,
            InFlight {
                message: pending.message.clone(),
                delivery_count,
            },
        );

        Some(ReceivedMessage {
            message: pending.message,
            lock_token,
            delivery_count,
        })
    }

    fn complete(&self, lock_token: LockToken) -> BrokerResult<()> {
        let mut queues = lock(&self.queues);
        match queues.in_flight.remove(&lock_token) {
            Some(_) => Ok(()),
            None => Err(BrokerError::LockLost(lock_token)),
        }
    }

    /// Release the lock after the callback returned. Uncompleted messages are
    /// abandoned: requeued, or dead-lettered once out of deliveries.
    fn settle(&self, lock_token: LockToken, session_id: Option<&str>) {
        {
            let mut queues = lock(&self.queues);
            if let Some(session_id) = session_id {
                queues.active_sessions.remove(session_id);
            }

            if let Some(abandoned) = queues.in_flight.remove(&lock_token) {
                if abandoned.delivery_count >= self.description.max_delivery_count {
                    debug!(
                        message_id = %abandoned.message.message_id,
                        entity_path = %self.entity_path(),
                        delivery_count = abandoned.delivery_count,
                        "Message dead-lettered"
                    );
                    queues.dead_letters.push(abandoned.message);
                } else {
                    queues.ready.push_front(Pending {
                        message: abandoned.message,
                        delivery_count: abandoned.delivery_count,
                    });
                }
            }
        }
        self.notify.notify_one();
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscription(&self, topic: &str, subscription: &str) -> Option<Arc<SubscriptionState>> {
        lock(&self.inner.topics)
            .get(topic)
            .and_then(|subscriptions| subscriptions.get(subscription))
            .cloned()
    }

    fn track(&self) -> Arc<Lifecycle> {
        let lifecycle = Arc::new(Lifecycle::default());
        let mut clients = lock(&self.inner.clients);
        clients.retain(|client| client.strong_count() > 0);
        clients.push(Arc::downgrade(&lifecycle));
        self.inner.created_clients.fetch_add(1, Ordering::SeqCst);
        lifecycle
    }

    /// Create `topic` if it does not exist yet.
    pub fn ensure_topic(&self, topic: &str) {
        lock(&self.inner.topics)
            .entry(topic.to_string())
            .or_default();
    }

    /// Close every client handed out so far, as the broker does when it drops
    /// connections. Receive loops stop and in-flight callbacks see their
    /// cancellation token fire.
    pub fn close_all_clients(&self) {
        let clients: Vec<_> = lock(&self.inner.clients)
            .drain(..)
            .filter_map(|client| client.upgrade())
            .collect();
        info!(count = clients.len(), "Closing all broker clients");
        for client in clients {
            client.close();
        }
    }

    /// Number of topic and subscription clients created.
    pub fn created_clients(&self) -> usize {
        self.inner.created_clients.load(Ordering::SeqCst)
    }

    /// Rules of a subscription, or `None` if it does not exist.
    pub fn rules(&self, topic: &str, subscription: &str) -> Option<Vec<RuleDescription>> {
        self.subscription(topic, subscription)
            .map(|state| lock(&state.queues).rules.clone())
    }

    /// Messages moved to the dead-letter list.
    pub fn dead_letters(&self, topic: &str, subscription: &str) -> Vec<TransportMessage> {
        self.subscription(topic, subscription)
            .map(|state| lock(&state.queues).dead_letters.clone())
            .unwrap_or_default()
    }

    /// Messages queued or locked (not yet completed or dead-lettered).
    pub fn active_message_count(&self, topic: &str, subscription: &str) -> usize {
        self.subscription(topic, subscription)
            .map(|state| {
                let queues = lock(&state.queues);
                queues.ready.len() + queues.in_flight.len()
            })
            .unwrap_or(0)
    }
}

impl BrokerConnector for InMemoryBroker {
    fn topic_client(&self, _connection_string: &str, topic: &str) -> Arc<dyn TopicClient> {
        Arc::new(MemoryTopicClient {
            broker: self.clone(),
            topic: topic.to_string(),
            lifecycle: self.track(),
        })
    }

    fn subscription_client(
        &self,
        _connection_string: &str,
        topic: &str,
        subscription: &str,
    ) -> Arc<dyn SubscriptionClient> {
        Arc::new(MemorySubscriptionClient {
            broker: self.clone(),
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            lifecycle: self.track(),
            handler_registered: AtomicBool::new(false),
        })
    }

    fn management_client(&self, _connection_string: &str) -> Arc<dyn ManagementClient> {
        Arc::new(MemoryManagementClient {
            broker: self.clone(),
        })
    }
}

// ============================================================================
// Clients
// ============================================================================

#[derive(Default)]
struct Lifecycle {
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Lifecycle {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MemoryTopicClient {
    broker: InMemoryBroker,
    topic: String,
    lifecycle: Arc<Lifecycle>,
}

impl ClientState for MemoryTopicClient {
    fn is_closed_or_closing(&self) -> bool {
        self.lifecycle.is_closed()
    }
}

#[async_trait]
impl TopicClient for MemoryTopicClient {
    fn topic_name(&self) -> &str {
        &self.topic
    }

    async fn send(&self, message: TransportMessage) -> BrokerResult<()> {
        if self.lifecycle.is_closed() {
            return Err(BrokerError::Closed(self.topic.clone()));
        }

        let subscriptions: Vec<_> = {
            let topics = lock(&self.broker.inner.topics);
            let Some(subscriptions) = topics.get(&self.topic) else {
                return Err(BrokerError::Operation {
                    operation: "send",
                    message: format!("topic '{}' not found", self.topic),
                });
            };
            subscriptions.values().cloned().collect()
        };

        let routed = subscriptions
            .iter()
            .filter(|subscription| subscription.offer(&message))
            .count();
        debug!(
            topic = %self.topic,
            label = %message.label,
            subscriptions = routed,
            "Message routed"
        );
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.lifecycle.close();
        Ok(())
    }
}

struct MemorySubscriptionClient {
    broker: InMemoryBroker,
    topic: String,
    subscription: String,
    lifecycle: Arc<Lifecycle>,
    handler_registered: AtomicBool,
}

impl MemorySubscriptionClient {
    /// Subscription state, or `None` if it was never created.
    fn state(&self) -> BrokerResult<Option<Arc<SubscriptionState>>> {
        if self.lifecycle.is_closed() {
            return Err(BrokerError::Closed(format!(
                "{}/subscriptions/{}",
                self.topic, self.subscription
            )));
        }
        Ok(self.broker.subscription(&self.topic, &self.subscription))
    }

    fn start_receiving(
        &self,
        receiver: Receiver,
        max_concurrent: usize,
        exception_received: ExceptionHandler,
    ) -> BrokerResult<()> {
        let operation = "register handler";
        let state = self.state()?.ok_or_else(|| BrokerError::Operation {
            operation,
            message: format!("subscription '{}' not found", self.subscription),
        })?;

        let sessions = matches!(receiver, Receiver::Sessions(_));
        if state.description.requires_session != sessions {
            return Err(BrokerError::Operation {
                operation,
                message: format!(
                    "subscription '{}' requires_session={} does not match handler kind",
                    self.subscription, state.description.requires_session
                ),
            });
        }

        if self.handler_registered.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Operation {
                operation,
                message: "a handler is already registered on this client".to_string(),
            });
        }

        tokio::spawn(receive_loop(
            state,
            self.lifecycle.clone(),
            receiver,
            max_concurrent.max(1),
            exception_received,
        ));
        Ok(())
    }
}

impl ClientState for MemorySubscriptionClient {
    fn is_closed_or_closing(&self) -> bool {
        self.lifecycle.is_closed()
    }
}

#[async_trait]
impl SubscriptionClient for MemorySubscriptionClient {
    fn topic_path(&self) -> &str {
        &self.topic
    }

    fn subscription_name(&self) -> &str {
        &self.subscription
    }

    async fn add_rule(&self, rule: RuleDescription) -> BrokerResult<ManagementOutcome> {
        let Some(state) = self.state()? else {
            return Ok(ManagementOutcome::NotFound);
        };
        let mut queues = lock(&state.queues);
        if queues.rules.iter().any(|existing| existing.name == rule.name) {
            return Ok(ManagementOutcome::AlreadyExists);
        }
        queues.rules.push(rule);
        Ok(ManagementOutcome::Done)
    }

    async fn remove_rule(&self, name: &str) -> BrokerResult<ManagementOutcome> {
        let Some(state) = self.state()? else {
            return Ok(ManagementOutcome::NotFound);
        };
        let mut queues = lock(&state.queues);
        let before = queues.rules.len();
        queues.rules.retain(|rule| rule.name != name);
        if queues.rules.len() == before {
            Ok(ManagementOutcome::NotFound)
        } else {
            Ok(ManagementOutcome::Done)
        }
    }

    async fn get_rules(&self) -> BrokerResult<Option<Vec<RuleDescription>>> {
        Ok(self
            .state()?
            .map(|state| lock(&state.queues).rules.clone()))
    }

    fn register_message_handler(
        &self,
        callback: MessageCallback,
        options: MessageHandlerOptions,
    ) -> BrokerResult<()> {
        self.start_receiving(
            Receiver::Messages(callback),
            options.max_concurrent_calls,
            options.exception_received,
        )
    }

    fn register_session_handler(
        &self,
        callback: SessionCallback,
        options: SessionHandlerOptions,
    ) -> BrokerResult<()> {
        self.start_receiving(
            Receiver::Sessions(callback),
            options.max_concurrent_sessions,
            options.exception_received,
        )
    }

    async fn complete(&self, lock_token: LockToken) -> BrokerResult<()> {
        let state = self
            .state()?
            .ok_or(BrokerError::LockLost(lock_token))?;
        state.complete(lock_token)
    }

    async fn close(&self) -> BrokerResult<()> {
        self.lifecycle.close();
        Ok(())
    }
}

struct MemorySession {
    state: Arc<SubscriptionState>,
    session_id: String,
    lifecycle: Arc<Lifecycle>,
}

#[async_trait]
impl MessageSession for MemorySession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn complete(&self, lock_token: LockToken) -> BrokerResult<()> {
        if self.lifecycle.is_closed() {
            return Err(BrokerError::Closed(self.state.entity_path()));
        }
        self.state.complete(lock_token)
    }
}

struct MemoryManagementClient {
    broker: InMemoryBroker,
}

#[async_trait]
impl ManagementClient for MemoryManagementClient {
    async fn topic_exists(&self, topic: &str) -> BrokerResult<bool> {
        Ok(lock(&self.broker.inner.topics).contains_key(topic))
    }

    async fn create_topic(&self, topic: &str) -> BrokerResult<ManagementOutcome> {
        let mut topics = lock(&self.broker.inner.topics);
        if topics.contains_key(topic) {
            return Ok(ManagementOutcome::AlreadyExists);
        }
        topics.insert(topic.to_string(), HashMap::new());
        Ok(ManagementOutcome::Done)
    }

    async fn subscription_exists(&self, topic: &str, subscription: &str) -> BrokerResult<bool> {
        Ok(self.broker.subscription(topic, subscription).is_some())
    }

    async fn create_subscription(
        &self,
        description: SubscriptionDescription,
    ) -> BrokerResult<ManagementOutcome> {
        let mut topics = lock(&self.broker.inner.topics);
        let Some(subscriptions) = topics.get_mut(&description.topic) else {
            return Ok(ManagementOutcome::NotFound);
        };
        if subscriptions.contains_key(&description.name) {
            return Ok(ManagementOutcome::AlreadyExists);
        }
        subscriptions.insert(
            description.name.clone(),
            Arc::new(SubscriptionState::new(description)),
        );
        Ok(ManagementOutcome::Done)
    }
}

// ============================================================================
// Receive loop
// ============================================================================

#[derive(Clone)]
enum Receiver {
    Messages(MessageCallback),
    Sessions(SessionCallback),
}

async fn receive_loop(
    state: Arc<SubscriptionState>,
    lifecycle: Arc<Lifecycle>,
    receiver: Receiver,
    max_concurrent: usize,
    exception_received: ExceptionHandler,
) {
    let sessions = matches!(receiver, Receiver::Sessions(_));
    let permits = Arc::new(Semaphore::new(max_concurrent));

    debug!(entity_path = %state.entity_path(), sessions, "Receive loop started");

    loop {
        let permit = tokio::select! {
            biased;
            _ = lifecycle.cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let received = loop {
            if lifecycle.is_closed() {
                break None;
            }
            if let Some(received) = state.take_next(sessions) {
                break Some(received);
            }
            tokio::select! {
                biased;
                _ = lifecycle.cancel.cancelled() => break None,
                _ = state.notify.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        };
        let Some(received) = received else {
            break;
        };

        let state = state.clone();
        let lifecycle = lifecycle.clone();
        let receiver = receiver.clone();
        let exception_received = exception_received.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let lock_token = received.lock_token;
            let session_id = sessions.then(|| received.message.session_id.clone());
            let cancel = lifecycle.cancel.clone();

            let result = match receiver {
                Receiver::Messages(callback) => callback(received, cancel).await,
                Receiver::Sessions(callback) => {
                    let session: Arc<dyn MessageSession> = Arc::new(MemorySession {
                        state: state.clone(),
                        session_id: received.message.session_id.clone(),
                        lifecycle: lifecycle.clone(),
                    });
                    callback(session, received, cancel).await
                }
            };

            if let Err(e) = result {
                exception_received(ExceptionReceived {
                    error: e.to_string(),
                    endpoint: ENDPOINT.to_string(),
                    entity_path: state.entity_path(),
                    action: "UserCallback".to_string(),
                });
            }

            state.settle(lock_token, session_id.as_deref());
        });
    }

    debug!(entity_path = %state.entity_path(), "Receive loop stopped");
}

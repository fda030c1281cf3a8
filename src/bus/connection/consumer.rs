//! Receive-side connection to one topic + subscription pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handle::HandleCell;
use crate::bus::broker::{
    BrokerConnector, CallbackError, ExceptionHandler, ExceptionReceived, ManagementOutcome,
    MessageCallback, MessageHandlerOptions, MessageSession, ReceivedMessage, RuleDescription,
    SessionCallback, SessionHandlerOptions, SubscriptionClient, DEFAULT_RULE_NAME,
};
use crate::bus::dispatch::DispatchOutcome;
use crate::bus::{BusError, Result, TransportMessage};
use crate::config::EventBusOptions;

/// Message-processing callback supplied by the consumer.
///
/// `Ok` with [`DispatchOutcome::should_ack`] acknowledges the message; `Err`
/// leaves it locked so the broker redelivers it.
pub type ProcessFn =
    Arc<dyn Fn(TransportMessage) -> BoxFuture<'static, Result<DispatchOutcome>> + Send + Sync>;

/// Owns the subscription client handle used by a consumer.
///
/// Once a callback is registered, a watcher task checks the handle every
/// `reconnect_interval` (or right after a callback failure) and reattaches
/// the callback to a fresh client when the broker closed the old one.
pub struct ConsumerConnection {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

struct Shared {
    options: EventBusOptions,
    client: HandleCell<dyn SubscriptionClient>,
    process: OnceLock<ProcessFn>,
    closed: AtomicBool,
    wake: Arc<Notify>,
}

impl ConsumerConnection {
    /// Validate options, create the subscription if missing, drop the
    /// catch-all rule, and log the rule set.
    pub async fn connect(
        options: EventBusOptions,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self> {
        options.validate_consumer()?;

        let management = connector.management_client(&options.connection_string);
        if !management
            .subscription_exists(&options.topic, &options.subscription)
            .await?
        {
            info!(
                subscription = %options.subscription,
                topic = %options.topic,
                "Creating subscription"
            );
            match management
                .create_subscription(options.subscription_description())
                .await?
            {
                ManagementOutcome::Done | ManagementOutcome::AlreadyExists => {}
                ManagementOutcome::NotFound => {
                    return Err(BusError::Transport(format!(
                        "topic '{}' not found while creating subscription '{}'",
                        options.topic, options.subscription
                    )));
                }
            }
        }

        let client = HandleCell::new({
            let connection_string = options.connection_string.clone();
            let topic = options.topic.clone();
            let subscription = options.subscription.clone();
            move || connector.subscription_client(&connection_string, &topic, &subscription)
        });

        let connection = Self {
            shared: Arc::new(Shared {
                options,
                client,
                process: OnceLock::new(),
                closed: AtomicBool::new(false),
                wake: Arc::new(Notify::new()),
            }),
            shutdown: CancellationToken::new(),
        };

        connection.remove_default_rule().await?;
        connection.print_subscription_info().await?;

        Ok(connection)
    }

    pub fn topic(&self) -> &str {
        &self.shared.options.topic
    }

    pub fn subscription(&self) -> &str {
        &self.shared.options.subscription
    }

    pub fn options(&self) -> &EventBusOptions {
        &self.shared.options
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// A live subscription client.
    ///
    /// If the broker closed the previous handle, a new one is created and the
    /// registered callback (if any) is attached to it. Fails once the
    /// connection itself was closed.
    pub fn subscription_client(&self) -> Result<Arc<dyn SubscriptionClient>> {
        self.shared.subscription_client()
    }

    /// Start receiving. Only one callback can be registered per connection.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register_handler(&self, process: ProcessFn) -> Result<()> {
        let client = self.subscription_client()?;

        self.shared.process.set(process.clone()).map_err(|_| {
            BusError::InvalidArgument(format!(
                "a message handler is already registered for subscription '{}'",
                self.shared.options.subscription
            ))
        })?;

        self.shared.attach(&client, process)?;

        tokio::spawn(watch(self.shared.clone(), self.shutdown.clone()));
        Ok(())
    }

    /// Add a label-correlation rule named after `event_type`.
    ///
    /// An existing rule with that name is left as is.
    pub async fn add_rule(&self, event_type: &str) -> Result<()> {
        let client = self.subscription_client()?;
        match client.add_rule(RuleDescription::for_label(event_type)).await {
            Ok(ManagementOutcome::Done) => {
                debug!(event_type = %event_type, topic = %self.topic(), "Rule added");
                Ok(())
            }
            Ok(ManagementOutcome::AlreadyExists) => {
                debug!(event_type = %event_type, topic = %self.topic(), "Rule already exists");
                Ok(())
            }
            Ok(ManagementOutcome::NotFound) => Err(BusError::Transport(format!(
                "subscription '{}' not found while adding rule '{}'",
                self.subscription(),
                event_type
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the rule named after `event_type`. A missing rule is logged.
    pub async fn remove_rule(&self, event_type: &str) -> Result<()> {
        let client = self.subscription_client()?;
        match client.remove_rule(event_type).await? {
            ManagementOutcome::Done | ManagementOutcome::AlreadyExists => Ok(()),
            ManagementOutcome::NotFound => {
                warn!(
                    event_type = %event_type,
                    topic = %client.topic_path(),
                    "The messaging entity could not be found"
                );
                Ok(())
            }
        }
    }

    async fn remove_default_rule(&self) -> Result<()> {
        let client = self.subscription_client()?;
        match client.remove_rule(DEFAULT_RULE_NAME).await? {
            ManagementOutcome::Done => {
                debug!(subscription = %self.subscription(), "Default rule removed");
            }
            ManagementOutcome::AlreadyExists | ManagementOutcome::NotFound => {}
        }
        Ok(())
    }

    async fn print_subscription_info(&self) -> Result<()> {
        let client = self.subscription_client()?;
        match client.get_rules().await? {
            Some(rules) => {
                let rules = rules
                    .iter()
                    .map(|rule| rule.filter.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                info!(
                    subscription = %client.subscription_name(),
                    topic = %client.topic_path(),
                    rules = %rules,
                    "Subscription rules"
                );
            }
            None => {
                warn!(
                    subscription = %client.subscription_name(),
                    "The subscription could not be found"
                );
            }
        }
        Ok(())
    }

    /// Close the subscription client and stop reconnecting.
    ///
    /// After the first call no client is ever recreated. Calling again is a
    /// no-op once the handle is closed, and retries the close if it failed.
    pub async fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();

        let client = self.shared.client.current();
        if client.is_closed_or_closing() {
            return Ok(());
        }

        info!(
            topic = %client.topic_path(),
            subscription = %client.subscription_name(),
            "Closing connection"
        );
        client.close().await?;
        Ok(())
    }
}

impl Drop for ConsumerConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscription_client(&self) -> Result<Arc<dyn SubscriptionClient>> {
        if self.is_closed() {
            return Err(closed_error(&self.options));
        }

        let (client, recreated) = self.client.get();
        if recreated {
            // A close that landed during recreation wins; the fresh handle
            // gets no callback and is closed by the next `close` call.
            if self.is_closed() {
                return Err(closed_error(&self.options));
            }
            info!(
                topic = %self.options.topic,
                subscription = %self.options.subscription,
                "Subscription client was closed, created a new one"
            );
            if let Some(process) = self.process.get() {
                self.attach(&client, process.clone())?;
            }
        }
        Ok(client)
    }

    fn attach(&self, client: &Arc<dyn SubscriptionClient>, process: ProcessFn) -> Result<()> {
        let exception_received = exception_logger(self.wake.clone());

        if self.options.use_sessions {
            info!(
                subscription = %self.options.subscription,
                topic = %client.topic_path(),
                "Register session handler"
            );

            let callback: SessionCallback = Arc::new(
                move |session: Arc<dyn MessageSession>,
                      received: ReceivedMessage,
                      cancel: CancellationToken| {
                    let process = process.clone();
                    async move {
                        let lock_token = received.lock_token;
                        let outcome = process(received.message).await.map_err(boxed)?;
                        if outcome.should_ack() && !cancel.is_cancelled() {
                            session.complete(lock_token).await.map_err(boxed)?;
                        }
                        Ok::<(), CallbackError>(())
                    }
                    .boxed()
                },
            );

            client.register_session_handler(
                callback,
                SessionHandlerOptions {
                    max_concurrent_sessions: self.options.max_concurrent_calls,
                    auto_complete: false,
                    exception_received,
                },
            )?;
        } else {
            info!(
                subscription = %self.options.subscription,
                topic = %client.topic_path(),
                "Register message handler"
            );

            // Completion goes through the client the callback is attached to.
            let completer: Weak<dyn SubscriptionClient> = Arc::downgrade(client);
            let callback: MessageCallback =
                Arc::new(move |received: ReceivedMessage, cancel: CancellationToken| {
                    let process = process.clone();
                    let completer = completer.clone();
                    async move {
                        let lock_token = received.lock_token;
                        let outcome = process(received.message).await.map_err(boxed)?;
                        if outcome.should_ack() && !cancel.is_cancelled() {
                            let client = completer.upgrade().ok_or_else(|| {
                                boxed(BusError::Transport(
                                    "subscription client dropped before completion".to_string(),
                                ))
                            })?;
                            client.complete(lock_token).await.map_err(boxed)?;
                        }
                        Ok::<(), CallbackError>(())
                    }
                    .boxed()
                });

            client.register_message_handler(
                callback,
                MessageHandlerOptions {
                    max_concurrent_calls: self.options.max_concurrent_calls,
                    auto_complete: false,
                    exception_received,
                },
            )?;
        }

        Ok(())
    }
}

/// Keep a live client attached until the connection is closed or dropped.
async fn watch(shared: Arc<Shared>, shutdown: CancellationToken) {
    let interval = shared.options.reconnect_interval();
    debug!(subscription = %shared.options.subscription, "Reconnect watcher started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }

        if shared.is_closed() {
            break;
        }
        if let Err(e) = shared.subscription_client() {
            warn!(
                error = %e,
                subscription = %shared.options.subscription,
                "Failed to reattach subscription client, will retry"
            );
        }
    }

    debug!(subscription = %shared.options.subscription, "Reconnect watcher stopped");
}

fn closed_error(options: &EventBusOptions) -> BusError {
    BusError::Transport(format!(
        "connection to subscription '{}' is closed",
        options.subscription
    ))
}

fn boxed(err: impl std::error::Error + Send + Sync + 'static) -> CallbackError {
    Box::new(err)
}

/// Logs callback failures and wakes the reconnect watcher.
fn exception_logger(wake: Arc<Notify>) -> ExceptionHandler {
    Arc::new(move |context: ExceptionReceived| {
        error!(
            error = %context.error,
            endpoint = %context.endpoint,
            entity_path = %context.entity_path,
            action = %context.action,
            "Message handler encountered an exception"
        );
        wake.notify_one();
    })
}

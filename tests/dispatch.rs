//! End-to-end dispatch through the in-memory broker.
//!
//! Each test publishes through a `TopicProducer` (or a raw topic client) and
//! observes handler invocations, acknowledgement and dead-lettering on the
//! consumer side.

use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;

use topicbus::bus::broker::{BrokerConnector, RuleDescription};
use topicbus::bus::{
    BusError, ConsumerSet, DispatchOutcome, EventProducer, InMemoryBroker, TopicConsumer,
    TopicProducer, TransportMessage,
};
use topicbus::config::EventBusOptions;
use topicbus::event::IntegrationEvent;
use topicbus::handlers::ServiceProvider;
use topicbus::test_utils::{
    wait_until, DeviceConnectionStateChangedEvent, DeviceConnectionStateChangedEventHandler,
    DeviceDescriptionEvent, DeviceDescriptionEventHandler, FailingHandler, InvocationLog,
    RecordingHandler,
};
use topicbus::utils::bootstrap::try_init_tracing;

const TIMEOUT: Duration = Duration::from_secs(5);
const SUBSCRIPTION: &str = "edge-worker";

fn options(topic: &str) -> EventBusOptions {
    EventBusOptions::for_test()
        .for_topic(topic)
        .with_subscription(SUBSCRIPTION)
}

struct Harness {
    broker: Arc<InMemoryBroker>,
    producer: TopicProducer,
    consumer: TopicConsumer,
    topic: String,
}

impl Harness {
    async fn start(options: EventBusOptions, provider: ServiceProvider) -> Self {
        try_init_tracing();
        let broker = Arc::new(InMemoryBroker::new());
        let producer = TopicProducer::connect(options.clone(), broker.clone())
            .await
            .unwrap();
        let consumer = TopicConsumer::connect(options.clone(), broker.clone(), Arc::new(provider))
            .await
            .unwrap();
        Self {
            broker,
            producer,
            consumer,
            topic: options.topic,
        }
    }

    fn active(&self) -> usize {
        self.broker.active_message_count(&self.topic, SUBSCRIPTION)
    }

    fn dead_letters(&self) -> Vec<TransportMessage> {
        self.broker.dead_letters(&self.topic, SUBSCRIPTION)
    }

    async fn send_raw(&self, label: &str, body: &str) {
        self.broker
            .topic_client("memory://test", &self.topic)
            .send(TransportMessage::json(
                uuid::Uuid::new_v4().to_string(),
                label,
                label,
                body.as_bytes().to_vec(),
            ))
            .await
            .unwrap();
    }
}

fn device_description() -> DeviceDescriptionEvent {
    DeviceDescriptionEvent {
        group_id: "g1".to_string(),
        device_id: "d1".to_string(),
        health_state: "ok".to_string(),
        generic_state: "active".to_string(),
    }
}

#[tokio::test]
async fn test_handlers_run_in_subscription_order_and_message_is_acked() {
    let log = InvocationLog::new();
    let h = Harness::start(options("edge-device-data"), log.provider_for_recorders()).await;

    h.consumer
        .subscribe::<DeviceDescriptionEvent, RecordingHandler<1>>("DeviceDescription")
        .await
        .unwrap();
    h.consumer
        .subscribe::<DeviceDescriptionEvent, RecordingHandler<2>>("DeviceDescription")
        .await
        .unwrap();
    h.consumer
        .subscribe::<DeviceDescriptionEvent, RecordingHandler<3>>("DeviceDescription")
        .await
        .unwrap();

    let event = IntegrationEvent::new("DeviceDescription", device_description()).unwrap();
    h.producer.send(&event).await.unwrap();

    assert!(wait_until(TIMEOUT, || log.len() == 3).await);
    assert!(wait_until(TIMEOUT, || h.active() == 0).await);
    assert_eq!(log.handlers(), vec!["H1", "H2", "H3"]);
    assert!(h.dead_letters().is_empty());
}

#[tokio::test]
async fn test_failing_handler_stops_later_handlers_and_message_is_dead_lettered() {
    let log = InvocationLog::new();
    let provider = log.provider_for_recorders().add_scoped({
        let log = log.clone();
        move || FailingHandler::<2>::new(log.clone())
    });
    let h = Harness::start(
        options("edge-device-data").with_max_delivery_count(2),
        provider,
    )
    .await;

    h.consumer
        .subscribe::<DeviceDescriptionEvent, RecordingHandler<1>>("DeviceDescription")
        .await
        .unwrap();
    h.consumer
        .subscribe::<DeviceDescriptionEvent, FailingHandler<2>>("DeviceDescription")
        .await
        .unwrap();
    h.consumer
        .subscribe::<DeviceDescriptionEvent, RecordingHandler<3>>("DeviceDescription")
        .await
        .unwrap();

    let event = IntegrationEvent::new("DeviceDescription", device_description()).unwrap();
    h.producer.send(&event).await.unwrap();

    assert!(wait_until(TIMEOUT, || h.dead_letters().len() == 1).await);

    // Two deliveries, each stopping at H2. No rollback of H1.
    assert_eq!(log.handlers(), vec!["H1", "H2", "H1", "H2"]);
    assert_eq!(h.dead_letters()[0].message_id, event.id().to_string());
    assert_eq!(h.active(), 0);
}

#[tokio::test]
async fn test_device_description_reaches_its_handler() {
    let log = InvocationLog::new();
    let h = Harness::start(options("edge-device-data"), log.provider_for_devices()).await;

    h.consumer
        .subscribe::<DeviceDescriptionEvent, DeviceDescriptionEventHandler>("DeviceDescription")
        .await
        .unwrap();

    h.send_raw(
        "DeviceDescription",
        r#"{"groupId":"g1","deviceId":"d1","healthState":"ok","genericState":"active"}"#,
    )
    .await;

    assert!(wait_until(TIMEOUT, || log.len() == 1).await);
    assert!(wait_until(TIMEOUT, || h.active() == 0).await);

    let entries = log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].handler, "DeviceDescriptionEventHandler");
    let payload: DeviceDescriptionEvent = serde_json::from_value(entries[0].payload.clone()).unwrap();
    assert_eq!(payload, device_description());
    assert!(h.dead_letters().is_empty());
}

#[tokio::test]
async fn test_unsubscribed_event_is_dropped_and_acked() {
    let log = InvocationLog::new();
    let h = Harness::start(options("edge-device"), log.provider_for_devices()).await;

    h.consumer
        .subscribe::<DeviceConnectionStateChangedEvent, DeviceConnectionStateChangedEventHandler>(
            "DeviceConnectionStateChanged",
        )
        .await
        .unwrap();
    h.consumer
        .unsubscribe::<DeviceConnectionStateChangedEvent, DeviceConnectionStateChangedEventHandler>(
            "DeviceConnectionStateChanged",
        )
        .await
        .unwrap();

    assert!(!h.consumer.has_subscriptions("DeviceConnectionStateChanged").await);

    // The pipeline reports success without running anything.
    let message = TransportMessage::json(
        "m-1",
        "DeviceConnectionStateChanged",
        "DeviceConnectionStateChanged",
        br#"{"deviceId":"d1","connected":true}"#.to_vec(),
    );
    let outcome = h.consumer.dispatcher().process(&message).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::NoSubscribers);
    assert!(outcome.should_ack());

    // Through the broker, nothing is left behind either.
    h.send_raw("DeviceConnectionStateChanged", r#"{"deviceId":"d1","connected":true}"#)
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(log.is_empty());
    assert_eq!(h.active(), 0);
    assert!(h.dead_letters().is_empty());
}

#[tokio::test]
async fn test_routed_message_without_subscribers_is_acked() {
    let log = InvocationLog::new();
    let h = Harness::start(options("edge-device"), log.provider_for_devices()).await;

    // A rule the registry knows nothing about, e.g. left over from a previous
    // process.
    h.consumer
        .connection()
        .subscription_client()
        .unwrap()
        .add_rule(RuleDescription::for_label("Stale"))
        .await
        .unwrap();

    h.send_raw("Stale", "{}").await;

    assert!(wait_until(TIMEOUT, || h.active() == 0).await);
    assert!(log.is_empty());
    assert!(h.dead_letters().is_empty());
}

#[tokio::test]
async fn test_duplicate_subscription_fails_and_keeps_one_handler() {
    let log = InvocationLog::new();
    let h = Harness::start(options("edge-device-data"), log.provider_for_devices()).await;

    h.consumer
        .subscribe::<DeviceDescriptionEvent, DeviceDescriptionEventHandler>("DeviceDescription")
        .await
        .unwrap();
    let second = h
        .consumer
        .subscribe::<DeviceDescriptionEvent, DeviceDescriptionEventHandler>("DeviceDescription")
        .await;

    assert!(matches!(second, Err(BusError::DuplicateHandler { .. })));

    let event = IntegrationEvent::new("DeviceDescription", device_description()).unwrap();
    h.producer.send(&event).await.unwrap();

    assert!(wait_until(TIMEOUT, || h.active() == 0).await);
    assert_eq!(log.len(), 1);
}

#[tokio::test]
async fn test_rule_added_once_per_event_type() {
    let log = InvocationLog::new();
    let h = Harness::start(options("edge-device-data"), log.provider_for_recorders()).await;

    h.consumer
        .subscribe::<DeviceDescriptionEvent, RecordingHandler<1>>("DeviceDescription")
        .await
        .unwrap();
    h.consumer
        .subscribe::<DeviceDescriptionEvent, RecordingHandler<2>>("DeviceDescription")
        .await
        .unwrap();

    let rules = h.broker.rules(&h.topic, SUBSCRIPTION).unwrap();
    assert_eq!(rules, vec![RuleDescription::for_label("DeviceDescription")]);
}

#[tokio::test]
async fn test_messages_without_rule_are_not_delivered() {
    let log = InvocationLog::new();
    let h = Harness::start(options("edge-device-data"), log.provider_for_devices()).await;

    // The catch-all rule was removed on connect.
    assert!(h.broker.rules(&h.topic, SUBSCRIPTION).unwrap().is_empty());

    let event = IntegrationEvent::new("DeviceDescription", device_description()).unwrap();
    h.producer.send(&event).await.unwrap();

    assert_eq!(h.active(), 0);
    assert!(log.is_empty());
}

#[tokio::test]
async fn test_remove_rule_twice_is_harmless() {
    let log = InvocationLog::new();
    let h = Harness::start(options("edge-device-data"), log.provider_for_devices()).await;

    h.consumer
        .subscribe::<DeviceDescriptionEvent, DeviceDescriptionEventHandler>("DeviceDescription")
        .await
        .unwrap();

    assert_ok!(h.consumer.connection().remove_rule("DeviceDescription").await);
    assert_ok!(h.consumer.connection().remove_rule("DeviceDescription").await);

    // Registry untouched by rule removal.
    assert!(h.consumer.has_subscriptions("DeviceDescription").await);

    h.consumer
        .unsubscribe::<DeviceDescriptionEvent, DeviceDescriptionEventHandler>("DeviceDescription")
        .await
        .unwrap();
    h.consumer
        .unsubscribe::<DeviceDescriptionEvent, DeviceDescriptionEventHandler>("DeviceDescription")
        .await
        .unwrap();

    assert!(!h.consumer.has_subscriptions("DeviceDescription").await);
}

#[tokio::test]
async fn test_invalid_payload_is_not_acked() {
    let log = InvocationLog::new();
    let h = Harness::start(
        options("edge-device-data").with_max_delivery_count(1),
        log.provider_for_devices(),
    )
    .await;

    h.consumer
        .subscribe::<DeviceDescriptionEvent, DeviceDescriptionEventHandler>("DeviceDescription")
        .await
        .unwrap();

    h.send_raw("DeviceDescription", "not json").await;

    assert!(wait_until(TIMEOUT, || h.dead_letters().len() == 1).await);
    assert!(log.is_empty());
}

#[tokio::test]
async fn test_empty_event_type_is_rejected() {
    let log = InvocationLog::new();
    let h = Harness::start(options("edge-device-data"), log.provider_for_devices()).await;

    let result = h
        .consumer
        .subscribe::<DeviceDescriptionEvent, DeviceDescriptionEventHandler>("  ")
        .await;
    assert!(matches!(result, Err(BusError::InvalidArgument(_))));

    // Publishing under the same blank label is rejected just the same.
    let event = IntegrationEvent::new("  ", device_description());
    assert!(matches!(event, Err(BusError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_consumer_set_routes_by_topic() {
    try_init_tracing();
    let log = InvocationLog::new();
    let broker = Arc::new(InMemoryBroker::new());
    let base = options("unused");

    let data_producer = TopicProducer::connect(base.for_topic("edge-device-data"), broker.clone())
        .await
        .unwrap();
    let device_producer = TopicProducer::connect(base.for_topic("edge-device"), broker.clone())
        .await
        .unwrap();

    let mut consumers = ConsumerSet::new(broker.clone(), Arc::new(log.provider_for_devices()));
    consumers.add(&base, "edge-device-data").await.unwrap();
    consumers.add(&base, "edge-device").await.unwrap();
    assert_eq!(consumers.len(), 2);

    assert!(matches!(
        consumers.add(&base, "edge-device").await,
        Err(BusError::InvalidArgument(_))
    ));
    assert!(matches!(consumers.get(""), Err(BusError::InvalidArgument(_))));
    assert!(matches!(
        consumers.get("unknown"),
        Err(BusError::InvalidArgument(_))
    ));

    consumers
        .get("edge-device-data")
        .unwrap()
        .subscribe::<DeviceDescriptionEvent, DeviceDescriptionEventHandler>("DeviceDescription")
        .await
        .unwrap();
    consumers
        .get("edge-device")
        .unwrap()
        .subscribe::<DeviceConnectionStateChangedEvent, DeviceConnectionStateChangedEventHandler>(
            "DeviceConnectionStateChanged",
        )
        .await
        .unwrap();

    data_producer
        .send(&IntegrationEvent::new("DeviceDescription", device_description()).unwrap())
        .await
        .unwrap();
    device_producer
        .send(
            &IntegrationEvent::new(
                "DeviceConnectionStateChanged",
                DeviceConnectionStateChangedEvent {
                    device_id: "d1".to_string(),
                    connected: true,
                },
            )
            .unwrap(),
        )
        .await
        .unwrap();

    assert!(wait_until(TIMEOUT, || log.len() == 2).await);
    let mut handlers = log.handlers();
    handlers.sort();
    assert_eq!(
        handlers,
        vec![
            "DeviceConnectionStateChangedEventHandler",
            "DeviceDescriptionEventHandler"
        ]
    );

    consumers.close_all().await.unwrap();
}

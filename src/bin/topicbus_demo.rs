//! topicbus-demo: device events over the in-memory broker
//!
//! Wires two topic consumers and producers the way an edge service would:
//! ```text
//! [edge-device-data] --DeviceDescription-----------> DeviceDescriptionEventHandler
//! [edge-device]      --DeviceConnectionStateChanged-> DeviceConnectionStateChangedEventHandler
//! ```
//!
//! ## Configuration
//! - TOPICBUS_CONFIG: optional YAML file with an `event_bus` section
//! - TOPICBUS__EVENT_BUS__*: per-field overrides
//! - TOPICBUS_LOG: log filter (default: info)
//!
//! Without any configuration the demo runs against `memory://local`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use topicbus::bus::{ConsumerSet, EventProducer, InMemoryBroker, TopicProducer};
use topicbus::config::{Config, EventBusOptions};
use topicbus::event::IntegrationEvent;
use topicbus::handlers::{HandlerError, IntegrationEventHandler, ServiceProvider};
use topicbus::utils::bootstrap::init_tracing;

const EDGE_DEVICE_DATA: &str = "edge-device-data";
const EDGE_DEVICE: &str = "edge-device";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceDescriptionEvent {
    group_id: String,
    device_id: String,
    health_state: String,
    generic_state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceConnectionStateChangedEvent {
    device_id: String,
    connected: bool,
}

struct DeviceDescriptionEventHandler;

#[async_trait]
impl IntegrationEventHandler<DeviceDescriptionEvent> for DeviceDescriptionEventHandler {
    async fn handle(&self, event: DeviceDescriptionEvent) -> Result<(), HandlerError> {
        info!(
            device_id = %event.device_id,
            group_id = %event.group_id,
            health_state = %event.health_state,
            "Device description"
        );
        Ok(())
    }
}

struct DeviceConnectionStateChangedEventHandler;

#[async_trait]
impl IntegrationEventHandler<DeviceConnectionStateChangedEvent>
    for DeviceConnectionStateChangedEventHandler
{
    async fn handle(&self, event: DeviceConnectionStateChangedEvent) -> Result<(), HandlerError> {
        info!(
            device_id = %event.device_id,
            connected = event.connected,
            "Device connection state changed"
        );
        Ok(())
    }
}

fn load_options() -> Result<EventBusOptions, Box<dyn std::error::Error>> {
    let config = Config::load(None)?;
    match config.event_bus {
        Some(_) => Ok(config.event_bus()?),
        None => Ok(EventBusOptions {
            connection_string: "memory://local".to_string(),
            topic: EDGE_DEVICE_DATA.to_string(),
            subscription: "topicbus-demo".to_string(),
            ..EventBusOptions::default()
        }),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let options = load_options().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting topicbus demo");

    let broker = Arc::new(InMemoryBroker::new());
    let provider = ServiceProvider::new()
        .add_scoped(|| DeviceDescriptionEventHandler)
        .add_scoped(|| DeviceConnectionStateChangedEventHandler);

    // Producers first: they create the topics the consumers subscribe to.
    let device_data_producer =
        TopicProducer::connect(options.for_topic(EDGE_DEVICE_DATA), broker.clone()).await?;
    let device_producer =
        TopicProducer::connect(options.for_topic(EDGE_DEVICE), broker.clone()).await?;

    let mut consumers = ConsumerSet::new(broker.clone(), Arc::new(provider));
    consumers.add(&options, EDGE_DEVICE_DATA).await?;
    consumers.add(&options, EDGE_DEVICE).await?;

    consumers
        .get(EDGE_DEVICE_DATA)?
        .subscribe::<DeviceDescriptionEvent, DeviceDescriptionEventHandler>("DeviceDescription")
        .await?;
    consumers
        .get(EDGE_DEVICE)?
        .subscribe::<DeviceConnectionStateChangedEvent, DeviceConnectionStateChangedEventHandler>(
            "DeviceConnectionStateChanged",
        )
        .await?;

    device_data_producer
        .send(&IntegrationEvent::with_key(
            "DeviceDescription",
            "d1",
            DeviceDescriptionEvent {
                group_id: "g1".to_string(),
                device_id: "d1".to_string(),
                health_state: "ok".to_string(),
                generic_state: "active".to_string(),
            },
        )?)
        .await?;
    device_producer
        .send(&IntegrationEvent::with_key(
            "DeviceConnectionStateChanged",
            "d1",
            DeviceConnectionStateChangedEvent {
                device_id: "d1".to_string(),
                connected: true,
            },
        )?)
        .await?;

    info!("Demo running, press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    consumers.close_all().await?;
    device_data_producer.close().await?;
    device_producer.close().await?;

    Ok(())
}

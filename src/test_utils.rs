//! Test utilities: recording handlers and sample payloads.
//!
//! Handlers write into a shared [`InvocationLog`] so tests can assert which
//! handlers ran, in which order, and with which payloads.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::event::EventPayload;
use crate::handlers::{HandlerError, IntegrationEventHandler, ServiceProvider};

/// One recorded handler call.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub handler: String,
    pub payload: serde_json::Value,
}

/// Shared journal of handler invocations.
#[derive(Debug, Clone, Default)]
pub struct InvocationLog {
    entries: Arc<Mutex<Vec<Invocation>>>,
}

impl InvocationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, handler: impl Into<String>, payload: serde_json::Value) {
        self.entries.lock().unwrap().push(Invocation {
            handler: handler.into(),
            payload,
        });
    }

    pub fn entries(&self) -> Vec<Invocation> {
        self.entries.lock().unwrap().clone()
    }

    /// Handler names in invocation order.
    pub fn handlers(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.handler).collect()
    }

    pub fn payloads(&self) -> Vec<serde_json::Value> {
        self.entries().into_iter().map(|e| e.payload).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Provider with `RecordingHandler<1>`, `<2>` and `<3>` bound to this log.
    pub fn provider_for_recorders(&self) -> ServiceProvider {
        let (a, b, c) = (self.clone(), self.clone(), self.clone());
        ServiceProvider::new()
            .add_scoped(move || RecordingHandler::<1>::new(a.clone()))
            .add_scoped(move || RecordingHandler::<2>::new(b.clone()))
            .add_scoped(move || RecordingHandler::<3>::new(c.clone()))
    }

    /// Provider with the device sample handlers bound to this log.
    pub fn provider_for_devices(&self) -> ServiceProvider {
        let (a, b) = (self.clone(), self.clone());
        ServiceProvider::new()
            .add_scoped(move || DeviceDescriptionEventHandler::new(a.clone()))
            .add_scoped(move || DeviceConnectionStateChangedEventHandler::new(b.clone()))
    }
}

// ============================================================================
// Generic handlers
// ============================================================================

/// Records `"H{ID}"` and the payload, then succeeds.
pub struct RecordingHandler<const ID: usize> {
    log: InvocationLog,
}

impl<const ID: usize> RecordingHandler<ID> {
    pub fn new(log: InvocationLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl<E: EventPayload, const ID: usize> IntegrationEventHandler<E> for RecordingHandler<ID> {
    async fn handle(&self, event: E) -> Result<(), HandlerError> {
        self.log.record(format!("H{}", ID), serde_json::to_value(&event)?);
        Ok(())
    }
}

/// Records `"H{ID}"`, then fails.
pub struct FailingHandler<const ID: usize> {
    log: InvocationLog,
}

impl<const ID: usize> FailingHandler<ID> {
    pub fn new(log: InvocationLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl<E: EventPayload, const ID: usize> IntegrationEventHandler<E> for FailingHandler<ID> {
    async fn handle(&self, event: E) -> Result<(), HandlerError> {
        self.log.record(format!("H{}", ID), serde_json::to_value(&event)?);
        Err(format!("handler H{} failed", ID).into())
    }
}

// ============================================================================
// Device sample
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptionEvent {
    pub group_id: String,
    pub device_id: String,
    pub health_state: String,
    pub generic_state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConnectionStateChangedEvent {
    pub device_id: String,
    pub connected: bool,
}

pub struct DeviceDescriptionEventHandler {
    log: InvocationLog,
}

impl DeviceDescriptionEventHandler {
    pub fn new(log: InvocationLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl IntegrationEventHandler<DeviceDescriptionEvent> for DeviceDescriptionEventHandler {
    async fn handle(&self, event: DeviceDescriptionEvent) -> Result<(), HandlerError> {
        self.log
            .record("DeviceDescriptionEventHandler", serde_json::to_value(&event)?);
        Ok(())
    }
}

pub struct DeviceConnectionStateChangedEventHandler {
    log: InvocationLog,
}

impl DeviceConnectionStateChangedEventHandler {
    pub fn new(log: InvocationLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl IntegrationEventHandler<DeviceConnectionStateChangedEvent>
    for DeviceConnectionStateChangedEventHandler
{
    async fn handle(&self, event: DeviceConnectionStateChangedEvent) -> Result<(), HandlerError> {
        self.log.record(
            "DeviceConnectionStateChangedEventHandler",
            serde_json::to_value(&event)?,
        );
        Ok(())
    }
}

// ============================================================================
// Waiting
// ============================================================================

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
///
/// Returns whether the condition held.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Like [`wait_until`] for async conditions.
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

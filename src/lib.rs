//! Topicbus - typed integration events over a managed pub/sub broker
//!
//! Producers publish [`event::IntegrationEvent`]s to a topic. Consumers
//! subscribe typed handlers to event-type names on a subscription; each
//! inbound message runs the matching handlers in subscription order and is
//! acknowledged only when all of them succeed.

pub mod bus;
pub mod config;
pub mod event;
pub mod handlers;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

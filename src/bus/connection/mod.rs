//! Broker connections that survive broker-side client closure.
//!
//! Each connection keeps its client handle in a swappable cell. When the
//! broker reports a handle closed, the next access builds a fresh one and
//! swaps it in; callers never see the closure as an error.

mod consumer;
mod handle;
mod producer;

pub use consumer::{ConsumerConnection, ProcessFn};
pub use producer::ProducerConnection;

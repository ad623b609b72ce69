//! Pub/sub providers

pub mod in_memory;
#[cfg(feature = "nats")]
pub mod nats;

pub use in_memory::{InMemoryBroker, InMemoryConnection, InMemoryConnector};
#[cfg(feature = "nats")]
pub use nats::{NatsConnection, NatsConnector};

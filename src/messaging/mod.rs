//! # Messaging
//!
//! Typed message envelopes, the provider-agnostic pub/sub connection seam, the
//! built-in providers, and the [`MessageTransport`] every component publishes
//! and subscribes through.

pub mod connection;
pub mod errors;
pub mod message;
pub mod providers;
pub mod subjects;
pub mod transport;

pub use connection::{FrameReceiver, PubSubConnection, PubSubConnector, RawFrame};
pub use errors::{MessagingError, MessagingResult};
pub use message::{
    Message, MessageHeaders, MessagePayload, MessageType, PersistenceAckPayload,
    ServiceLoadPayload, ServiceRegisterPayload, TaskAssignPayload, TaskCancelPayload,
    TaskCompletePayload, TaskCreatePayload, TaskFailPayload, TaskRequestPayload,
    TaskUpdatePayload, PERSISTENCE_ATTEMPT_HEADER, PERSISTENCE_ID_HEADER,
};
pub use providers::{InMemoryBroker, InMemoryConnector};
pub use transport::{
    handler_fn, ConnectionState, MessageHandler, MessageTransport, SubscribeOptions,
    TransportEvent,
};

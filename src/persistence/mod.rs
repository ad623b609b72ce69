//! Durable at-least-once delivery over the message transport.

pub mod message_persistence;

pub use message_persistence::{
    MessagePersistence, PersistOptions, PersistedMessage, PersistenceEvent, PersistenceStats,
    PersistenceStatus,
};

//! # Pub/Sub Connection Abstraction
//!
//! Provider-agnostic seam between [`MessageTransport`](crate::messaging::MessageTransport)
//! and the broker it talks to. A [`PubSubConnector`] knows how to open a
//! connection; a [`PubSubConnection`] moves raw bytes for as long as it lives.
//!
//! Providers report a lost connection in two ways: `publish` returns a
//! connection-class [`MessagingError`](crate::messaging::MessagingError), and
//! subscription receivers yield `None` once the broker drops them. The
//! transport treats both as a signal to reconnect.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::messaging::MessagingResult;

/// Default buffer size for provider-side subscription channels
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 1024;

/// One inbound frame as delivered by a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Receiving side of a provider subscription. Dropping it unsubscribes.
pub type FrameReceiver = mpsc::Receiver<RawFrame>;

/// A live broker connection
#[async_trait]
pub trait PubSubConnection: Send + Sync + Debug {
    /// Provider name for logging
    fn provider_name(&self) -> &'static str;

    /// Publish raw bytes on a subject
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> MessagingResult<()>;

    /// Subscribe to a subject pattern, optionally as part of a queue group
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> MessagingResult<FrameReceiver>;

    /// Whether the connection is still usable
    fn is_connected(&self) -> bool;

    /// Close the connection, ending all of its subscriptions
    async fn close(&self) -> MessagingResult<()>;
}

/// Factory for broker connections, used for the initial connect and every reconnect
#[async_trait]
pub trait PubSubConnector: Send + Sync + Debug {
    fn provider_name(&self) -> &'static str;

    async fn connect(&self) -> MessagingResult<Arc<dyn PubSubConnection>>;
}

//! # NATS Provider
//!
//! [`PubSubConnector`] backed by `async-nats`. The client's own reconnect logic
//! is disabled so that connection loss surfaces to the transport, which owns
//! the reconnect policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::messaging::connection::{
    FrameReceiver, PubSubConnection, PubSubConnector, RawFrame, DEFAULT_SUBSCRIPTION_BUFFER,
};
use crate::messaging::{MessagingError, MessagingResult};

/// Connector for a NATS server
#[derive(Debug, Clone)]
pub struct NatsConnector {
    url: String,
    client_name: String,
}

impl NatsConnector {
    pub fn new(url: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_name: client_name.into(),
        }
    }
}

#[async_trait]
impl PubSubConnector for NatsConnector {
    fn provider_name(&self) -> &'static str {
        "nats"
    }

    async fn connect(&self) -> MessagingResult<Arc<dyn PubSubConnection>> {
        info!(url = %self.url, "Connecting to NATS");

        let client = async_nats::ConnectOptions::default()
            .name(&self.client_name)
            .max_reconnects(Some(0))
            .connect(&self.url)
            .await
            .map_err(|e| {
                MessagingError::connection(format!("failed to connect to {}: {e}", self.url))
            })?;

        let connection: Arc<dyn PubSubConnection> = Arc::new(NatsConnection {
            client,
            closed: AtomicBool::new(false),
        });
        Ok(connection)
    }
}

/// Live NATS connection
#[derive(Debug)]
pub struct NatsConnection {
    client: async_nats::Client,
    closed: AtomicBool,
}

#[async_trait]
impl PubSubConnection for NatsConnection {
    fn provider_name(&self) -> &'static str {
        "nats"
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> MessagingResult<()> {
        if !self.is_connected() {
            return Err(MessagingError::publish(subject, "connection lost"));
        }
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| MessagingError::publish(subject, e.to_string()))
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> MessagingResult<FrameReceiver> {
        let mut subscriber = match queue_group {
            Some(group) => self
                .client
                .queue_subscribe(subject.to_string(), group.to_string())
                .await,
            None => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| MessagingError::subscribe(subject, e.to_string()))?;

        let (sender, receiver) = mpsc::channel(DEFAULT_SUBSCRIPTION_BUFFER);
        let subject_name = subject.to_string();
        tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let frame = RawFrame {
                    subject: message.subject.to_string(),
                    payload: message.payload.to_vec(),
                };
                if sender.send(frame).await.is_err() {
                    break;
                }
            }
            debug!(subject = %subject_name, "NATS subscription stream ended");
        });

        Ok(receiver)
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.client.connection_state() == async_nats::connection::State::Connected
    }

    async fn close(&self) -> MessagingResult<()> {
        self.closed.store(true, Ordering::Release);
        self.client
            .flush()
            .await
            .map_err(|e| MessagingError::connection(e.to_string()))
    }
}

//! # In-Memory Broker
//!
//! Process-local pub/sub broker for tests, demos and single-process deployments.
//!
//! ## Features
//!
//! - **Wildcards**: `*` matches one subject token, `>` matches the remaining tokens
//! - **Queue Groups**: one member of each group receives a given frame (round robin)
//! - **Fault Injection**: [`InMemoryBroker::sever_connections`] drops every live
//!   connection, [`InMemoryBroker::set_available`] makes new connects fail

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::messaging::connection::{
    FrameReceiver, PubSubConnection, PubSubConnector, RawFrame, DEFAULT_SUBSCRIPTION_BUFFER,
};
use crate::messaging::subjects::{is_valid_publish_subject, subject_matches};
use crate::messaging::{MessagingError, MessagingResult};

#[derive(Debug)]
struct BrokerSubscription {
    id: u64,
    connection_id: u64,
    pattern: String,
    queue_group: Option<String>,
    sender: mpsc::Sender<RawFrame>,
}

#[derive(Debug)]
struct BrokerState {
    subscriptions: RwLock<Vec<BrokerSubscription>>,
    /// Bumped by `sever_connections`; connections from older epochs are dead
    epoch: AtomicU64,
    available: AtomicBool,
    next_id: AtomicU64,
    queue_cursor: AtomicU64,
    total_published: AtomicU64,
    total_delivered: AtomicU64,
}

/// Shared in-memory broker. Cloning yields another handle to the same broker.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                subscriptions: RwLock::new(Vec::new()),
                epoch: AtomicU64::new(0),
                available: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
                queue_cursor: AtomicU64::new(0),
                total_published: AtomicU64::new(0),
                total_delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Connector handing out connections to this broker
    pub fn connector(&self) -> Arc<InMemoryConnector> {
        Arc::new(InMemoryConnector {
            broker: self.clone(),
        })
    }

    /// Open a connection directly
    pub fn connect(&self) -> MessagingResult<Arc<InMemoryConnection>> {
        if !self.state.available.load(Ordering::Acquire) {
            return Err(MessagingError::connection("in-memory broker unavailable"));
        }

        Ok(Arc::new(InMemoryConnection {
            id: self.state.next_id.fetch_add(1, Ordering::Relaxed),
            epoch: self.state.epoch.load(Ordering::Acquire),
            closed: AtomicBool::new(false),
            broker: Arc::clone(&self.state),
        }))
    }

    /// Drop every live connection and subscription (simulated network partition)
    pub fn sever_connections(&self) {
        self.state.epoch.fetch_add(1, Ordering::AcqRel);
        let dropped = {
            let mut subscriptions = self.state.subscriptions.write();
            let count = subscriptions.len();
            subscriptions.clear();
            count
        };
        warn!(
            dropped_subscriptions = dropped,
            "In-memory broker severed all connections"
        );
    }

    /// Toggle whether new connections are accepted
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::Release);
    }

    pub fn subscription_count(&self) -> usize {
        self.state
            .subscriptions
            .read()
            .iter()
            .filter(|s| !s.sender.is_closed())
            .count()
    }

    pub fn total_published(&self) -> u64 {
        self.state.total_published.load(Ordering::Relaxed)
    }

    pub fn total_delivered(&self) -> u64 {
        self.state.total_delivered.load(Ordering::Relaxed)
    }

    fn route(&self, subject: &str) -> Vec<mpsc::Sender<RawFrame>> {
        let mut subscriptions = self.state.subscriptions.write();
        subscriptions.retain(|s| !s.sender.is_closed());

        let mut targets = Vec::new();
        let mut groups: HashMap<&str, Vec<&BrokerSubscription>> = HashMap::new();

        for subscription in subscriptions.iter() {
            if !subject_matches(&subscription.pattern, subject) {
                continue;
            }
            match subscription.queue_group.as_deref() {
                Some(group) => groups.entry(group).or_default().push(subscription),
                None => targets.push(subscription.sender.clone()),
            }
        }

        for members in groups.values() {
            let cursor = self.state.queue_cursor.fetch_add(1, Ordering::Relaxed) as usize;
            targets.push(members[cursor % members.len()].sender.clone());
        }

        targets
    }
}

/// Connector for [`InMemoryBroker`]
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

impl InMemoryConnector {
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl PubSubConnector for InMemoryConnector {
    fn provider_name(&self) -> &'static str {
        "in_memory"
    }

    async fn connect(&self) -> MessagingResult<Arc<dyn PubSubConnection>> {
        let connection: Arc<dyn PubSubConnection> = self.broker.connect()?;
        Ok(connection)
    }
}

/// One connection to an [`InMemoryBroker`]
#[derive(Debug)]
pub struct InMemoryConnection {
    id: u64,
    epoch: u64,
    closed: AtomicBool,
    broker: Arc<BrokerState>,
}

impl InMemoryConnection {
    fn broker(&self) -> InMemoryBroker {
        InMemoryBroker {
            state: Arc::clone(&self.broker),
        }
    }
}

#[async_trait]
impl PubSubConnection for InMemoryConnection {
    fn provider_name(&self) -> &'static str {
        "in_memory"
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> MessagingResult<()> {
        if !self.is_connected() {
            return Err(MessagingError::publish(subject, "connection lost"));
        }
        if !is_valid_publish_subject(subject) {
            return Err(MessagingError::invalid_subject(
                subject,
                "publish subjects must be non-empty and wildcard free",
            ));
        }

        self.broker.total_published.fetch_add(1, Ordering::Relaxed);
        let targets = self.broker().route(subject);
        debug!(subject = %subject, receivers = targets.len(), "Routing frame");

        for sender in targets {
            let frame = RawFrame {
                subject: subject.to_string(),
                payload: payload.clone(),
            };
            // A receiver dropped between routing and sending is just an unsubscribe
            if sender.send(frame).await.is_ok() {
                self.broker.total_delivered.fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> MessagingResult<FrameReceiver> {
        if !self.is_connected() {
            return Err(MessagingError::subscribe(subject, "connection lost"));
        }
        if subject.is_empty() {
            return Err(MessagingError::invalid_subject(subject, "empty subject"));
        }

        let (sender, receiver) = mpsc::channel(DEFAULT_SUBSCRIPTION_BUFFER);
        let subscription = BrokerSubscription {
            id: self.broker.next_id.fetch_add(1, Ordering::Relaxed),
            connection_id: self.id,
            pattern: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
            sender,
        };
        debug!(
            subject = %subject,
            subscription_id = subscription.id,
            queue_group = ?queue_group,
            "In-memory subscription created"
        );
        self.broker.subscriptions.write().push(subscription);

        Ok(receiver)
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.broker.epoch.load(Ordering::Acquire) == self.epoch
    }

    async fn close(&self) -> MessagingResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.broker
            .subscriptions
            .write()
            .retain(|s| s.connection_id != self.id);
        debug!(connection_id = self.id, "In-memory connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_wildcard_subscribers() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().unwrap();

        let mut exact = connection.subscribe("task.create", None).await.unwrap();
        let mut wildcard = connection.subscribe("task.*", None).await.unwrap();
        let mut other = connection.subscribe("system.load", None).await.unwrap();

        connection
            .publish("task.create", b"hello".to_vec())
            .await
            .unwrap();

        assert_eq!(exact.recv().await.unwrap().payload, b"hello".to_vec());
        assert_eq!(wildcard.recv().await.unwrap().subject, "task.create");
        assert!(other.try_recv().is_err());
        assert_eq!(broker.total_delivered(), 2);
    }

    #[tokio::test]
    async fn test_queue_group_delivers_to_one_member() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().unwrap();

        let mut a = connection.subscribe("work", Some("workers")).await.unwrap();
        let mut b = connection.subscribe("work", Some("workers")).await.unwrap();

        for _ in 0..4 {
            connection.publish("work", vec![1]).await.unwrap();
        }

        let mut received = 0;
        while a.try_recv().is_ok() {
            received += 1;
        }
        while b.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 4);
    }

    #[tokio::test]
    async fn test_sever_connections_closes_streams() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().unwrap();
        let mut receiver = connection.subscribe("a.b", None).await.unwrap();

        broker.sever_connections();

        assert!(!connection.is_connected());
        assert!(receiver.recv().await.is_none());
        assert!(connection.publish("a.b", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_broker_rejects_connect() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        assert!(broker.connector().connect().await.is_err());

        broker.set_available(true);
        assert!(broker.connector().connect().await.is_ok());
    }
}

//! # Message Persistence
//!
//! At-least-once delivery for messages that must survive a receiver outage or a
//! crash of the sending node.
//!
//! `persist_message` writes a `pending` record to the key/value store and tracks
//! it in the retry queue. Each sweep of `process_retry_queue`:
//!
//! 1. treats records left `processing` longer than `ack_timeout` as failed deliveries,
//! 2. republishes every due `pending` record with `persistenceId` and
//!    `persistenceAttempt` headers after marking it `processing`.
//!
//! Receivers answer on `a2a.persistence.ack`. A positive ack marks the record
//! `delivered`; a negative ack or a publish failure schedules the next attempt
//! from the fixed delay table until [`MAX_RETRY_ATTEMPTS`] is reached, after
//! which the record is `failed` for good. Every state change is written through
//! to the store before anything is published, so a restarted node can recover
//! its queue with [`MessagePersistence::get_pending_messages`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PersistenceConfig;
use crate::constants::{persistence_retry_delay, MAX_RETRY_ATTEMPTS, PERSISTENCE_KEY_PREFIX};
use crate::error::{A2aError, A2aResult};
use crate::events::EventBus;
use crate::logging::log_message_operation;
use crate::messaging::{
    handler_fn, subjects, Message, MessagePayload, MessageTransport, MessagingResult,
    PersistenceAckPayload, SubscribeOptions, PERSISTENCE_ATTEMPT_HEADER, PERSISTENCE_ID_HEADER,
};
use crate::services::{KeyValueStore, ListOptions, StoreOptions};
use crate::utils::Ticker;

/// Delivery state of a persisted message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl PersistenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistenceStatus::Pending => "pending",
            PersistenceStatus::Processing => "processing",
            PersistenceStatus::Delivered => "delivered",
            PersistenceStatus::Failed => "failed",
        }
    }

    /// Still owed a delivery
    pub fn is_outstanding(&self) -> bool {
        matches!(self, PersistenceStatus::Pending | PersistenceStatus::Processing)
    }
}

impl fmt::Display for PersistenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored record for one persisted message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMessage {
    pub id: String,
    pub message: Message,
    pub target_subject: String,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_attempt: DateTime<Utc>,
    pub persisted_at: DateTime<Utc>,
    pub status: PersistenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

/// Options for [`MessagePersistence::persist_message`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistOptions {
    /// Caller-chosen id; a UUID is generated otherwise
    pub persistence_id: Option<String>,
    /// Stored alongside the record
    pub metadata: HashMap<String, String>,
}

impl PersistOptions {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            persistence_id: Some(id.into()),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceEvent {
    Persisted { id: String, target_subject: String },
    DeliveryAttempted { id: String, attempt: u32 },
    Delivered { id: String, attempts: u32 },
    RetryScheduled { id: String, attempts: u32, delay: Duration },
    Failed { id: String, attempts: u32, error: String },
    Recovered { id: String },
}

/// Counts of tracked records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceStats {
    pub pending: usize,
    pub processing: usize,
    pub delivered: u64,
    pub failed: u64,
}

/// Durable retry queue for one node
pub struct MessagePersistence {
    transport: Arc<MessageTransport>,
    store: Arc<dyn KeyValueStore>,
    config: PersistenceConfig,
    queue: DashMap<String, PersistedMessage>,
    delivered: AtomicU64,
    failed: AtomicU64,
    events: EventBus<PersistenceEvent>,
    retry_ticker: Mutex<Option<Ticker>>,
    ack_subscription: Mutex<Option<String>>,
    shutdown: CancellationToken,
    self_ref: Weak<Self>,
}

impl fmt::Debug for MessagePersistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePersistence")
            .field("namespace", &self.config.namespace)
            .field("queued", &self.queue.len())
            .finish()
    }
}

fn record_key(id: &str) -> String {
    format!("{PERSISTENCE_KEY_PREFIX}{id}")
}

fn add_delay(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(at)
}

impl MessagePersistence {
    pub fn new(
        transport: Arc<MessageTransport>,
        store: Arc<dyn KeyValueStore>,
        config: PersistenceConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            transport,
            store,
            config,
            queue: DashMap::new(),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            events: EventBus::new("message_persistence"),
            retry_ticker: Mutex::new(None),
            ack_subscription: Mutex::new(None),
            shutdown: CancellationToken::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn events(&self) -> &EventBus<PersistenceEvent> {
        &self.events
    }

    /// Subscribe to acknowledgments, recover stored records and start the
    /// retry sweep
    pub async fn start(&self) -> A2aResult<()> {
        let weak = self.self_ref.clone();
        let handler = handler_fn(move |message: Message| {
            let weak = weak.clone();
            async move {
                let Some(persistence) = weak.upgrade() else {
                    return Ok(());
                };
                let ack: PersistenceAckPayload = message.payload_as()?;
                if let Err(e) = persistence.handle_acknowledgment(&ack).await {
                    warn!(persistence_id = %ack.persistence_id, error = %e, "Failed to apply acknowledgment");
                }
                Ok(())
            }
        });
        let subscription_id = self
            .transport
            .subscribe(subjects::PERSISTENCE_ACK, handler, SubscribeOptions::default())
            .await?;
        *self.ack_subscription.lock() = Some(subscription_id);

        let recovered = self.get_pending_messages().await?;
        info!(
            namespace = %self.config.namespace,
            outstanding = recovered.len(),
            "Message persistence started"
        );

        let weak = self.self_ref.clone();
        let ticker = Ticker::spawn_with_token(
            "persistence:retry",
            self.config.retry_interval(),
            self.shutdown.child_token(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(persistence) = weak.upgrade() {
                        persistence.process_retry_queue().await;
                    }
                }
            },
        );
        if let Some(previous) = self.retry_ticker.lock().replace(ticker) {
            previous.stop();
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ticker = self.retry_ticker.lock().take();
        if let Some(ticker) = ticker {
            ticker.shutdown().await;
        }
        let subscription = self.ack_subscription.lock().take();
        if let Some(subscription_id) = subscription {
            if let Err(e) = self.transport.unsubscribe(&subscription_id) {
                debug!(error = %e, "Ack subscription already gone");
            }
        }
        info!("Message persistence stopped");
    }

    async fn save(&self, record: &PersistedMessage, options: &StoreOptions) -> A2aResult<()> {
        let value = serde_json::to_value(record)?;
        self.store
            .set_value(&record_key(&record.id), value, options)
            .await
    }

    async fn save_record(&self, record: &PersistedMessage) {
        let options = StoreOptions::namespace(self.config.namespace.clone());
        if let Err(e) = self.save(record, &options).await {
            // the in-memory queue stays authoritative until the next write succeeds
            error!(persistence_id = %record.id, status = %record.status, error = %e, "Failed to store persisted message");
        }
    }

    /// Store `message` for delivery to `target_subject`, returning its id
    pub async fn persist_message(
        &self,
        message: Message,
        target_subject: &str,
        options: PersistOptions,
    ) -> A2aResult<String> {
        if !subjects::is_valid_publish_subject(target_subject) {
            return Err(A2aError::ValidationError(format!(
                "Invalid target subject '{target_subject}'"
            )));
        }

        let id = options
            .persistence_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let record = PersistedMessage {
            id: id.clone(),
            message,
            target_subject: target_subject.to_string(),
            attempts: 0,
            last_attempt: None,
            next_attempt: now,
            persisted_at: now,
            status: PersistenceStatus::Pending,
            error_details: None,
        };

        let mut store_options = StoreOptions::namespace(self.config.namespace.clone())
            .with_metadata("targetSubject", target_subject);
        store_options.metadata.extend(options.metadata);
        self.save(&record, &store_options)
            .await
            .map_err(|e| A2aError::PersistenceError(format!("Failed to persist message {id}: {e}")))?;

        self.queue.insert(id.clone(), record);
        debug!(persistence_id = %id, target_subject = %target_subject, "Message persisted");
        self.events.emit(PersistenceEvent::Persisted {
            id: id.clone(),
            target_subject: target_subject.to_string(),
        });
        Ok(id)
    }

    /// Run one sweep now; returns the number of delivery attempts made
    pub async fn process_retry_queue(&self) -> usize {
        self.process_retry_queue_at(Utc::now()).await
    }

    /// Run one sweep as of `now`
    pub async fn process_retry_queue_at(&self, now: DateTime<Utc>) -> usize {
        let ack_deadline = chrono::Duration::from_std(self.config.ack_timeout())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let expired: Vec<String> = self
            .queue
            .iter()
            .filter(|r| {
                r.status == PersistenceStatus::Processing
                    && r.last_attempt.is_some_and(|at| now - at >= ack_deadline)
            })
            .map(|r| r.id.clone())
            .collect();
        for id in expired {
            warn!(persistence_id = %id, "No acknowledgment before timeout");
            self.record_failure(&id, "acknowledgment timed out".to_string(), now)
                .await;
        }

        let mut due: Vec<(DateTime<Utc>, String)> = self
            .queue
            .iter()
            .filter(|r| r.status == PersistenceStatus::Pending && r.next_attempt <= now)
            .map(|r| (r.next_attempt, r.id.clone()))
            .collect();
        due.sort();

        let mut attempted = 0;
        for (_, id) in due {
            if self.attempt_delivery(&id, now).await {
                attempted += 1;
            }
        }
        attempted
    }

    async fn attempt_delivery(&self, id: &str, now: DateTime<Utc>) -> bool {
        let record = {
            let Some(mut record) = self.queue.get_mut(id) else {
                return false;
            };
            if record.status != PersistenceStatus::Pending {
                return false;
            }
            record.attempts += 1;
            record.status = PersistenceStatus::Processing;
            record.last_attempt = Some(now);
            record.clone()
        };
        self.save_record(&record).await;

        let outbound = record
            .message
            .clone()
            .with_header(PERSISTENCE_ID_HEADER, record.id.clone())
            .with_header(PERSISTENCE_ATTEMPT_HEADER, record.attempts);

        self.events.emit(PersistenceEvent::DeliveryAttempted {
            id: record.id.clone(),
            attempt: record.attempts,
        });
        match self.transport.publish(&record.target_subject, outbound).await {
            Ok(_) => {
                debug!(persistence_id = %record.id, attempt = record.attempts, subject = %record.target_subject, "Persisted message republished");
            }
            Err(e) => {
                self.record_failure(&record.id, format!("publish failed: {e}"), now)
                    .await;
            }
        }
        true
    }

    /// Apply a receiver's acknowledgment
    pub async fn handle_acknowledgment(&self, ack: &PersistenceAckPayload) -> A2aResult<()> {
        if !self.queue.contains_key(&ack.persistence_id) {
            debug!(persistence_id = %ack.persistence_id, "Acknowledgment for untracked message");
            return Ok(());
        }

        if ack.success {
            let record = self.queue.remove(&ack.persistence_id).map(|(_, mut record)| {
                record.status = PersistenceStatus::Delivered;
                record.error_details = None;
                record
            });
            if let Some(record) = record {
                self.save_record(&record).await;
                self.delivered.fetch_add(1, Ordering::Relaxed);
                log_message_operation(
                    "deliver",
                    &record.target_subject,
                    Some(&record.id),
                    record.status.as_str(),
                    ack.receiver.as_deref(),
                );
                self.events.emit(PersistenceEvent::Delivered {
                    id: record.id,
                    attempts: record.attempts,
                });
            }
            return Ok(());
        }

        let error = ack
            .error
            .clone()
            .unwrap_or_else(|| "receiver rejected message".to_string());
        self.record_failure(&ack.persistence_id, error, Utc::now())
            .await;
        Ok(())
    }

    /// Count a failed delivery of an in-flight record
    async fn record_failure(&self, id: &str, error: String, now: DateTime<Utc>) {
        let (record, delay) = {
            let Some(mut record) = self.queue.get_mut(id) else {
                return;
            };
            // a duplicate or late negative ack for a record already re-queued
            if record.status != PersistenceStatus::Processing {
                return;
            }
            record.error_details = Some(error.clone());
            if record.attempts >= MAX_RETRY_ATTEMPTS {
                record.status = PersistenceStatus::Failed;
                (record.clone(), None)
            } else {
                let delay = persistence_retry_delay(record.attempts);
                record.status = PersistenceStatus::Pending;
                record.next_attempt = add_delay(now, delay);
                (record.clone(), Some(delay))
            }
        };

        match delay {
            Some(delay) => {
                self.save_record(&record).await;
                warn!(
                    persistence_id = %id,
                    attempts = record.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "Delivery failed, retry scheduled"
                );
                self.events.emit(PersistenceEvent::RetryScheduled {
                    id: id.to_string(),
                    attempts: record.attempts,
                    delay,
                });
            }
            None => {
                self.queue.remove(id);
                self.save_record(&record).await;
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    persistence_id = %id,
                    attempts = record.attempts,
                    error = %error,
                    "Persisted message failed permanently"
                );
                self.events.emit(PersistenceEvent::Failed {
                    id: id.to_string(),
                    attempts: record.attempts,
                    error,
                });
            }
        }
    }

    /// Reconcile the queue with the store and return every outstanding record,
    /// oldest first. Stored records this node is not tracking are adopted; a
    /// recovered `processing` record is re-queued as `pending` and due now.
    pub async fn get_pending_messages(&self) -> A2aResult<Vec<PersistedMessage>> {
        let keys = self
            .store
            .list_keys(&ListOptions {
                namespace: Some(self.config.namespace.clone()),
                pattern: Some(format!("{PERSISTENCE_KEY_PREFIX}*")),
            })
            .await?;

        for key in keys {
            let Some(value) = self
                .store
                .get_value(&key, Some(&self.config.namespace))
                .await?
            else {
                continue;
            };
            let mut record: PersistedMessage = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable persisted record");
                    continue;
                }
            };
            if !record.status.is_outstanding() || self.queue.contains_key(&record.id) {
                continue;
            }

            if record.status == PersistenceStatus::Processing {
                record.status = PersistenceStatus::Pending;
                record.next_attempt = Utc::now();
                self.save_record(&record).await;
            }
            info!(persistence_id = %record.id, attempts = record.attempts, "Recovered persisted message");
            self.events.emit(PersistenceEvent::Recovered {
                id: record.id.clone(),
            });
            self.queue.entry(record.id.clone()).or_insert(record);
        }

        let mut outstanding: Vec<PersistedMessage> =
            self.queue.iter().map(|r| r.value().clone()).collect();
        outstanding.sort_by(|a, b| a.persisted_at.cmp(&b.persisted_at).then_with(|| a.id.cmp(&b.id)));
        Ok(outstanding)
    }

    /// Tracked record, falling back to the store for finished ones
    pub async fn get_message(&self, id: &str) -> A2aResult<Option<PersistedMessage>> {
        if let Some(record) = self.queue.get(id) {
            return Ok(Some(record.clone()));
        }
        match self
            .store
            .get_value(&record_key(id), Some(&self.config.namespace))
            .await?
        {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn stats(&self) -> PersistenceStats {
        let mut stats = PersistenceStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            ..Default::default()
        };
        for record in self.queue.iter() {
            match record.status {
                PersistenceStatus::Pending => stats.pending += 1,
                PersistenceStatus::Processing => stats.processing += 1,
                _ => {}
            }
        }
        stats
    }

    /// Receiver side: acknowledge a message that arrived through persistence.
    ///
    /// Returns `false` without publishing when the message carries no
    /// persistence id.
    pub async fn acknowledge(
        transport: &Arc<MessageTransport>,
        message: &Message,
        success: bool,
        error: Option<String>,
    ) -> MessagingResult<bool> {
        let Some(persistence_id) = message
            .headers
            .get(PERSISTENCE_ID_HEADER)
            .and_then(|v| v.as_str())
        else {
            return Ok(false);
        };

        let ack = Message::new(MessagePayload::PersistenceAck(PersistenceAckPayload {
            persistence_id: persistence_id.to_string(),
            success,
            error,
            receiver: Some(transport.source().to_string()),
        }))?;
        transport.publish(subjects::PERSISTENCE_ACK, ack).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::messaging::{InMemoryBroker, MessageType};
    use crate::services::InMemoryKeyValueStore;
    use serde_json::json;

    async fn setup() -> (Arc<MessagePersistence>, Arc<MessageTransport>, Arc<InMemoryKeyValueStore>) {
        let transport = MessageTransport::new(
            "sender",
            InMemoryBroker::new().connector(),
            TransportConfig::default(),
        );
        transport.connect().await.unwrap();
        let store = Arc::new(InMemoryKeyValueStore::new());
        let persistence = MessagePersistence::new(
            Arc::clone(&transport),
            store.clone() as Arc<dyn KeyValueStore>,
            PersistenceConfig::default(),
        );
        (persistence, transport, store)
    }

    fn message() -> Message {
        Message::raw(MessageType::Custom, json!({"order": 7}))
    }

    fn nack(id: &str) -> PersistenceAckPayload {
        PersistenceAckPayload {
            persistence_id: id.to_string(),
            success: false,
            error: Some("busy".to_string()),
            receiver: None,
        }
    }

    #[tokio::test]
    async fn test_persist_then_deliver() {
        let (persistence, _transport, store) = setup().await;
        let id = persistence
            .persist_message(message(), "orders.created", PersistOptions::default())
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(persistence.stats().pending, 1);

        assert_eq!(persistence.process_retry_queue().await, 1);
        let record = persistence.get_message(&id).await.unwrap().unwrap();
        assert_eq!(record.status, PersistenceStatus::Processing);
        assert_eq!(record.attempts, 1);

        persistence
            .handle_acknowledgment(&PersistenceAckPayload {
                persistence_id: id.clone(),
                success: true,
                error: None,
                receiver: Some("receiver".into()),
            })
            .await
            .unwrap();

        let record = persistence.get_message(&id).await.unwrap().unwrap();
        assert_eq!(record.status, PersistenceStatus::Delivered);
        assert_eq!(persistence.stats().delivered, 1);
        assert!(persistence.get_pending_messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_schedule_then_permanent_failure() {
        let (persistence, _transport, _store) = setup().await;
        let mut events = persistence.events().subscribe();
        let id = persistence
            .persist_message(message(), "orders.created", PersistOptions::with_id("m-1"))
            .await
            .unwrap();
        assert_eq!(id, "m-1");

        let mut now = Utc::now();
        for _ in 0..MAX_RETRY_ATTEMPTS {
            assert_eq!(persistence.process_retry_queue_at(now).await, 1);
            persistence.handle_acknowledgment(&nack(&id)).await.unwrap();
            // far enough ahead for any slot in the delay table
            now += chrono::Duration::minutes(2);
        }

        let record = persistence.get_message(&id).await.unwrap().unwrap();
        assert_eq!(record.status, PersistenceStatus::Failed);
        assert_eq!(record.attempts, MAX_RETRY_ATTEMPTS);
        assert_eq!(persistence.process_retry_queue_at(now).await, 0);

        let mut delays = Vec::new();
        let mut failed = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                PersistenceEvent::RetryScheduled { delay, .. } => delays.push(delay.as_secs()),
                PersistenceEvent::Failed { .. } => failed += 1,
                _ => {}
            }
        }
        assert_eq!(delays, vec![1, 5, 15, 30]);
        assert_eq!(failed, 1);
        assert_eq!(persistence.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_not_due_before_backoff_elapses() {
        let (persistence, _transport, _store) = setup().await;
        let id = persistence
            .persist_message(message(), "orders.created", PersistOptions::default())
            .await
            .unwrap();
        let now = Utc::now();
        persistence.process_retry_queue_at(now).await;
        persistence.handle_acknowledgment(&nack(&id)).await.unwrap();

        // first retry waits one second
        assert_eq!(persistence.process_retry_queue_at(now).await, 0);
        assert_eq!(
            persistence
                .process_retry_queue_at(now + chrono::Duration::seconds(2))
                .await,
            1
        );
    }

    #[tokio::test]
    async fn test_ack_timeout_counts_as_failure() {
        let (persistence, _transport, _store) = setup().await;
        let id = persistence
            .persist_message(message(), "orders.created", PersistOptions::default())
            .await
            .unwrap();
        let now = Utc::now();
        persistence.process_retry_queue_at(now).await;

        let later = now + chrono::Duration::seconds(31);
        persistence.process_retry_queue_at(later).await;
        let record = persistence.get_message(&id).await.unwrap().unwrap();
        assert_eq!(record.status, PersistenceStatus::Pending);
        assert_eq!(record.error_details.as_deref(), Some("acknowledgment timed out"));
    }

    #[tokio::test]
    async fn test_publish_failure_counts_as_failure() {
        let (persistence, transport, _store) = setup().await;
        let id = persistence
            .persist_message(message(), "orders.created", PersistOptions::default())
            .await
            .unwrap();
        transport.disconnect().await.unwrap();

        persistence.process_retry_queue().await;
        let record = persistence.get_message(&id).await.unwrap().unwrap();
        assert_eq!(record.status, PersistenceStatus::Pending);
        assert_eq!(record.attempts, 1);
        assert!(record.error_details.unwrap().contains("publish failed"));
    }

    #[tokio::test]
    async fn test_recovery_adopts_stored_records() {
        let (persistence, transport, store) = setup().await;
        let id = persistence
            .persist_message(message(), "orders.created", PersistOptions::default())
            .await
            .unwrap();
        persistence.process_retry_queue().await;

        // a fresh instance over the same store, as after a restart
        let restarted = MessagePersistence::new(
            transport,
            store as Arc<dyn KeyValueStore>,
            PersistenceConfig::default(),
        );
        let pending = restarted.get_pending_messages().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].status, PersistenceStatus::Pending);
        assert_eq!(pending[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_store_failure_rejects_persist() {
        let (persistence, _transport, store) = setup().await;
        store.set_failing(true);
        let result = persistence
            .persist_message(message(), "orders.created", PersistOptions::default())
            .await;
        assert!(matches!(result, Err(A2aError::PersistenceError(_))));
        assert_eq!(persistence.stats().pending, 0);

        let invalid = persistence
            .persist_message(message(), "orders.*", PersistOptions::default())
            .await;
        assert!(matches!(invalid, Err(A2aError::ValidationError(_))));
    }
}

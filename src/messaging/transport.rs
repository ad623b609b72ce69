//! # Message Transport
//!
//! Wraps a [`PubSubConnection`] with the behavior every component relies on:
//!
//! - **Envelope stamping**: `publish` fills missing `correlationId`, `messageId`,
//!   `timestamp` and `source` headers before serialization
//! - **Delivery loops**: each subscription owns a task that decodes frames and
//!   invokes its handler; handler errors and panics are logged and the loop
//!   continues, undecodable frames are skipped
//! - **Reconnect**: a failed publish or a closed subscription stream starts an
//!   exponential backoff reconnect (`min(base * 2^attempt, max)`), bounded by
//!   `max_reconnect_attempts`. Exhausting it leaves the transport `Failed`.
//!   Live subscriptions re-attach on every new connection.
//! - **Request/reply**: one `_INBOX.{uuid}` subject per request, bounded by a timeout

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::events::EventBus;
use crate::messaging::connection::{PubSubConnection, PubSubConnector, RawFrame};
use crate::messaging::subjects::INBOX_PREFIX;
use crate::messaging::{Message, MessagingError, MessagingResult};

/// Connection lifecycle of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; needs an explicit `connect()`
    Failed,
}

/// Events emitted by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected { provider: &'static str },
    Disconnected,
    ConnectionLost { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    Reconnected { attempts: u32 },
    ReconnectFailed { attempts: u32 },
    HandlerError {
        subscription_id: String,
        subject: String,
        error: String,
    },
    DecodeError { subject: String, error: String },
}

/// Callback invoked for each message delivered to a subscription
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> MessagingResult<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = MessagingResult<()>> + Send,
{
    async fn handle(&self, message: Message) -> MessagingResult<()> {
        (self.0)(message).await
    }
}

/// Adapt an async closure into a [`MessageHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MessagingResult<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Options for [`MessageTransport::subscribe`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Share deliveries with other subscribers in the same group
    pub queue_group: Option<String>,
}

impl SubscribeOptions {
    pub fn queue_group(group: impl Into<String>) -> Self {
        Self {
            queue_group: Some(group.into()),
        }
    }
}

struct SubscriptionEntry {
    subject: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Backoff before reconnect attempt `attempt` (0-based)
pub fn reconnect_delay(config: &TransportConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    config
        .reconnect_base_delay()
        .saturating_mul(factor)
        .min(config.reconnect_max_delay())
}

/// Pub/sub transport shared by every component of a node
pub struct MessageTransport {
    source: String,
    config: TransportConfig,
    connector: Arc<dyn PubSubConnector>,
    connection: RwLock<Option<Arc<dyn PubSubConnection>>>,
    state: RwLock<ConnectionState>,
    /// Bumped on every successful (re)connect so delivery loops re-attach
    generation: watch::Sender<u64>,
    subscriptions: DashMap<String, SubscriptionEntry>,
    reconnecting: AtomicBool,
    closing: AtomicBool,
    events: EventBus<TransportEvent>,
}

impl std::fmt::Debug for MessageTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTransport")
            .field("source", &self.source)
            .field("provider", &self.connector.provider_name())
            .field("state", &*self.state.read())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl MessageTransport {
    pub fn new(
        source: impl Into<String>,
        connector: Arc<dyn PubSubConnector>,
        config: TransportConfig,
    ) -> Arc<Self> {
        let (generation, _) = watch::channel(0);
        Arc::new(Self {
            source: source.into(),
            config,
            connector,
            connection: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            generation,
            subscriptions: DashMap::new(),
            reconnecting: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            events: EventBus::new("transport"),
        })
    }

    /// Service id stamped as `source` on outbound messages
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn events(&self) -> &EventBus<TransportEvent> {
        &self.events
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
            && self
                .connection
                .read()
                .as_ref()
                .is_some_and(|c| c.is_connected())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn current_connection(&self) -> Option<Arc<dyn PubSubConnection>> {
        if self.connection_state() != ConnectionState::Connected {
            return None;
        }
        self.connection.read().clone()
    }

    fn install_connection(&self, connection: Arc<dyn PubSubConnection>) {
        *self.connection.write() = Some(connection);
        self.set_state(ConnectionState::Connected);
        self.generation.send_modify(|g| *g += 1);
    }

    /// Open the underlying connection. A no-op when already connected.
    pub async fn connect(&self) -> MessagingResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        self.closing.store(false, Ordering::Release);
        self.set_state(ConnectionState::Connecting);

        match self.connector.connect().await {
            Ok(connection) => {
                let provider = connection.provider_name();
                self.install_connection(connection);
                info!(source = %self.source, provider = provider, "Transport connected");
                self.events.emit(TransportEvent::Connected { provider });
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                error!(source = %self.source, error = %e, "Transport connect failed");
                Err(e)
            }
        }
    }

    /// Stop every subscription and close the connection
    pub async fn disconnect(&self) -> MessagingResult<()> {
        self.closing.store(true, Ordering::Release);

        let ids: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, entry)) = self.subscriptions.remove(&id) {
                entry.cancel.cancel();
                handles.push(entry.handle);
            }
        }
        for handle in handles {
            let _ = handle.await;
        }

        let connection = self.connection.write().take();
        self.set_state(ConnectionState::Disconnected);
        if let Some(connection) = connection {
            connection.close().await?;
        }

        info!(source = %self.source, "Transport disconnected");
        self.events.emit(TransportEvent::Disconnected);
        Ok(())
    }

    /// Publish a message, returning its message id
    pub async fn publish(self: &Arc<Self>, subject: &str, message: Message) -> MessagingResult<String> {
        let mut message = message;
        message.headers.fill_defaults(&self.source);
        let message_id = message.headers.message_id.clone().unwrap_or_default();
        let bytes = message.to_bytes()?;

        let connection = self
            .current_connection()
            .ok_or_else(|| MessagingError::not_connected("publish"))?;

        match connection.publish(subject, bytes).await {
            Ok(()) => {
                debug!(
                    subject = %subject,
                    message_type = %message.message_type,
                    message_id = %message_id,
                    "Message published"
                );
                Ok(message_id)
            }
            Err(e) => {
                warn!(subject = %subject, error = %e, "Publish failed");
                if e.is_connection_loss() {
                    self.trigger_reconnect(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Start a delivery loop for `subject`, returning the subscription id
    pub async fn subscribe(
        self: &Arc<Self>,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> MessagingResult<String> {
        if subject.is_empty() {
            return Err(MessagingError::invalid_subject(subject, "empty subject"));
        }

        let connection = self
            .current_connection()
            .ok_or_else(|| MessagingError::not_connected("subscribe"))?;

        let mut generation_rx = self.generation.subscribe();
        generation_rx.borrow_and_update();
        let receiver = connection
            .subscribe(subject, options.queue_group.as_deref())
            .await?;

        let subscription_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run_delivery_loop(
            subscription_id.clone(),
            subject.to_string(),
            options.queue_group.clone(),
            handler,
            cancel.clone(),
            generation_rx,
            receiver,
        ));

        self.subscriptions.insert(
            subscription_id.clone(),
            SubscriptionEntry {
                subject: subject.to_string(),
                cancel,
                handle,
            },
        );

        debug!(
            subject = %subject,
            subscription_id = %subscription_id,
            queue_group = ?options.queue_group,
            "Subscription started"
        );
        Ok(subscription_id)
    }

    /// Stop a subscription. An in-flight handler invocation runs to completion.
    pub fn unsubscribe(&self, subscription_id: &str) -> MessagingResult<()> {
        match self.subscriptions.remove(subscription_id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                debug!(
                    subject = %entry.subject,
                    subscription_id = %subscription_id,
                    "Subscription stopped"
                );
                Ok(())
            }
            None => Err(MessagingError::SubscriptionNotFound {
                subscription_id: subscription_id.to_string(),
            }),
        }
    }

    /// Publish `message` with a fresh reply subject and wait for one response
    pub async fn request(
        self: &Arc<Self>,
        subject: &str,
        message: Message,
        timeout: Duration,
    ) -> MessagingResult<Message> {
        let connection = self
            .current_connection()
            .ok_or_else(|| MessagingError::not_connected("request"))?;

        let inbox = format!("{INBOX_PREFIX}.{}", Uuid::new_v4());
        let mut replies = connection.subscribe(&inbox, None).await?;

        let mut message = message;
        message.headers.reply_to = Some(inbox.clone());
        self.publish(subject, message).await?;

        let wait_for_reply = async {
            while let Some(frame) = replies.recv().await {
                match Message::from_bytes(&frame.payload) {
                    Ok(reply) => return Some(reply),
                    Err(e) => warn!(subject = %inbox, error = %e, "Undecodable reply skipped"),
                }
            }
            None
        };

        match tokio::time::timeout(timeout, wait_for_reply).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(MessagingError::connection(
                "reply subscription closed before a response arrived",
            )),
            Err(_) => Err(MessagingError::timeout(
                format!("request {subject}"),
                timeout.as_millis() as u64,
            )),
        }
    }

    /// Request with the configured default timeout
    pub async fn request_default(
        self: &Arc<Self>,
        subject: &str,
        message: Message,
    ) -> MessagingResult<Message> {
        let timeout = self.config.request_timeout();
        self.request(subject, message, timeout).await
    }

    /// Answer a request on its `replyTo` subject, keeping its correlation id
    pub async fn reply(self: &Arc<Self>, request: &Message, response: Message) -> MessagingResult<String> {
        let reply_to = request
            .headers
            .reply_to
            .clone()
            .ok_or_else(|| MessagingError::invalid_subject("", "request carries no replyTo header"))?;

        let mut response = response;
        if let Some(correlation_id) = request.correlation_id() {
            response.headers.correlation_id = Some(correlation_id.to_string());
        }
        self.publish(&reply_to, response).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_delivery_loop(
        self: Arc<Self>,
        subscription_id: String,
        subject: String,
        queue_group: Option<String>,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
        mut generation_rx: watch::Receiver<u64>,
        initial: crate::messaging::connection::FrameReceiver,
    ) {
        let mut receiver = Some(initial);

        loop {
            if let Some(mut frames) = receiver.take() {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        frame = frames.recv() => match frame {
                            Some(frame) => {
                                self.dispatch(&subscription_id, handler.as_ref(), frame).await;
                            }
                            None => {
                                // A newer connection already exists when the generation moved on
                                let superseded = generation_rx.has_changed().unwrap_or(true);
                                if !self.closing.load(Ordering::Acquire) && !superseded {
                                    warn!(
                                        subject = %subject,
                                        subscription_id = %subscription_id,
                                        "Subscription stream closed"
                                    );
                                    self.trigger_reconnect(format!("subscription stream for {subject} closed"));
                                }
                                break;
                            }
                        }
                    }
                }
            }

            // Wait for a new connection, then re-attach
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = generation_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            generation_rx.borrow_and_update();

            let Some(connection) = self.current_connection() else {
                continue;
            };
            match connection.subscribe(&subject, queue_group.as_deref()).await {
                Ok(frames) => {
                    info!(
                        subject = %subject,
                        subscription_id = %subscription_id,
                        "Subscription re-established"
                    );
                    receiver = Some(frames);
                }
                Err(e) => {
                    warn!(subject = %subject, error = %e, "Failed to re-establish subscription");
                    self.trigger_reconnect(e.to_string());
                }
            }
        }
    }

    async fn dispatch(&self, subscription_id: &str, handler: &dyn MessageHandler, frame: RawFrame) {
        let message = match Message::from_bytes(&frame.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(subject = %frame.subject, error = %e, "Undecodable frame skipped");
                self.events.emit(TransportEvent::DecodeError {
                    subject: frame.subject,
                    error: e.to_string(),
                });
                return;
            }
        };

        let outcome = AssertUnwindSafe(handler.handle(message)).catch_unwind().await;
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                format!("handler panicked: {detail}")
            }
        };

        error!(
            subject = %frame.subject,
            subscription_id = %subscription_id,
            error = %failure,
            "Message handler failed"
        );
        self.events.emit(TransportEvent::HandlerError {
            subscription_id: subscription_id.to_string(),
            subject: frame.subject,
            error: failure,
        });
    }

    /// Start the reconnect loop unless one is running or the transport is closing
    fn trigger_reconnect(self: &Arc<Self>, reason: String) {
        if self.closing.load(Ordering::Acquire)
            || self.connection_state() == ConnectionState::Failed
        {
            return;
        }
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }

        warn!(source = %self.source, reason = %reason, "Connection lost, reconnecting");
        self.set_state(ConnectionState::Reconnecting);
        self.events.emit(TransportEvent::ConnectionLost { reason });
        tokio::spawn(Arc::clone(self).reconnect_loop());
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let stale = self.connection.write().take();
        if let Some(stale) = stale {
            let _ = stale.close().await;
        }

        let max_attempts = self.config.max_reconnect_attempts;
        for attempt in 0..max_attempts {
            let delay = reconnect_delay(&self.config, attempt);
            info!(
                attempt = attempt + 1,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect attempt"
            );
            self.events.emit(TransportEvent::Reconnecting {
                attempt: attempt + 1,
                delay,
            });
            tokio::time::sleep(delay).await;

            if self.closing.load(Ordering::Acquire) {
                self.reconnecting.store(false, Ordering::Release);
                return;
            }

            match self.connector.connect().await {
                Ok(connection) => {
                    self.install_connection(connection);
                    self.reconnecting.store(false, Ordering::Release);
                    info!(attempts = attempt + 1, "Transport reconnected");
                    self.events.emit(TransportEvent::Reconnected {
                        attempts: attempt + 1,
                    });
                    return;
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Reconnect attempt failed");
                }
            }
        }

        self.set_state(ConnectionState::Failed);
        self.reconnecting.store(false, Ordering::Release);
        error!(
            source = %self.source,
            attempts = max_attempts,
            "Reconnect attempts exhausted; transport requires restart"
        );
        self.events.emit(TransportEvent::ReconnectFailed {
            attempts: max_attempts,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::providers::InMemoryBroker;
    use crate::messaging::MessageType;
    use serde_json::{json, Value};
    use tokio::sync::{broadcast, mpsc};

    fn config() -> TransportConfig {
        TransportConfig {
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_ms: 1_000,
            max_reconnect_attempts: 3,
            ..Default::default()
        }
    }

    async fn connected(broker: &InMemoryBroker, source: &str) -> Arc<MessageTransport> {
        let transport = MessageTransport::new(source, broker.connector(), config());
        transport.connect().await.unwrap();
        transport
    }

    fn custom(payload: Value) -> Message {
        Message::raw(MessageType::Custom, payload)
    }

    /// Handler forwarding every payload into a channel
    fn forwarding_handler() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message.payload);
                Ok(())
            }
        });
        (handler, rx)
    }

    fn drain(events: &mut broadcast::Receiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        let config = config();
        assert_eq!(reconnect_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(reconnect_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(reconnect_delay(&config, 3), Duration::from_millis(800));
        assert_eq!(reconnect_delay(&config, 4), Duration::from_millis(1_000));
        assert_eq!(reconnect_delay(&config, 40), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let broker = crate::messaging::providers::InMemoryBroker::new();
        let transport = MessageTransport::new("svc", broker.connector(), config());

        let result = transport
            .publish("a.b", Message::raw(crate::messaging::MessageType::Custom, serde_json::Value::Null))
            .await;
        assert!(matches!(result, Err(MessagingError::NotConnected { .. })));
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_id() {
        let broker = crate::messaging::providers::InMemoryBroker::new();
        let transport = MessageTransport::new("svc", broker.connector(), config());
        assert!(matches!(
            transport.unsubscribe("missing"),
            Err(MessagingError::SubscriptionNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_resumes_after_reconnect_with_backoff() {
        let broker = InMemoryBroker::new();
        let transport = connected(&broker, "svc").await;
        let (handler, mut received) = forwarding_handler();
        transport
            .subscribe("orders.*", handler, SubscribeOptions::default())
            .await
            .unwrap();
        let mut events = transport.events().subscribe();

        broker.set_available(false);
        broker.sever_connections();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.connection_state(), ConnectionState::Reconnecting);

        // attempt 1 fires at 100ms against a down broker, attempt 2 at 300ms
        tokio::time::sleep(Duration::from_millis(150)).await;
        broker.set_available(true);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(transport.connection_state(), ConnectionState::Connected);
        assert!(transport.is_connected());

        let seen = drain(&mut events);
        assert!(matches!(seen[0], TransportEvent::ConnectionLost { .. }));
        assert!(seen.contains(&TransportEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(100),
        }));
        assert!(seen.contains(&TransportEvent::Reconnecting {
            attempt: 2,
            delay: Duration::from_millis(200),
        }));
        assert_eq!(seen.last(), Some(&TransportEvent::Reconnected { attempts: 2 }));

        transport
            .publish("orders.created", custom(json!({"order": 7})))
            .await
            .unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(1), received.recv())
            .await
            .unwrap();
        assert_eq!(payload, Some(json!({"order": 7})));
        assert_eq!(transport.subscription_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reconnects_leave_transport_failed() {
        let broker = InMemoryBroker::new();
        let transport = connected(&broker, "svc").await;
        let mut events = transport.events().subscribe();

        broker.set_available(false);
        broker.sever_connections();
        // a publish on the dead connection starts the reconnect loop
        let lost = transport.publish("orders.created", custom(json!(1))).await;
        assert!(matches!(lost, Err(MessagingError::Publish { .. })));

        // 100 + 200 + 400ms of backoff
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.connection_state(), ConnectionState::Failed);
        assert_eq!(
            drain(&mut events).last(),
            Some(&TransportEvent::ReconnectFailed { attempts: 3 })
        );

        let rejected = transport.publish("orders.created", custom(json!(2))).await;
        assert!(matches!(rejected, Err(MessagingError::NotConnected { .. })));
        // no further attempts once failed
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain(&mut events).is_empty());

        broker.set_available(true);
        transport.connect().await.unwrap();
        assert_eq!(transport.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_receives_correlated_reply() {
        let broker = InMemoryBroker::new();
        let requester = connected(&broker, "requester").await;
        let responder = connected(&broker, "responder").await;

        let replier = Arc::clone(&responder);
        responder
            .subscribe(
                "svc.echo",
                handler_fn(move |request: Message| {
                    let replier = Arc::clone(&replier);
                    async move {
                        let response = custom(json!({"echo": request.payload}));
                        replier.reply(&request, response).await.map(|_| ())
                    }
                }),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        let reply = requester
            .request(
                "svc.echo",
                custom(json!("ping")).with_correlation_id("corr-1"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(reply.payload, json!({"echo": "ping"}));
        assert_eq!(reply.correlation_id(), Some("corr-1"));
        assert_eq!(reply.source(), Some("responder"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let broker = InMemoryBroker::new();
        let transport = connected(&broker, "svc").await;

        let result = transport
            .request("nobody.listens", custom(json!("ping")), Duration::from_millis(500))
            .await;
        assert!(matches!(
            result,
            Err(MessagingError::Timeout { timeout_ms: 500, .. })
        ));

        let no_reply_to = transport.reply(&custom(json!("ping")), custom(json!("pong"))).await;
        assert!(no_reply_to.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_handler_does_not_stop_delivery() {
        let broker = InMemoryBroker::new();
        let transport = connected(&broker, "svc").await;
        let (tx, mut received) = mpsc::unbounded_channel();
        let subscription_id = transport
            .subscribe(
                "jobs",
                handler_fn(move |message: Message| {
                    let tx = tx.clone();
                    async move {
                        match message.payload.as_str() {
                            Some("boom") => panic!("boom"),
                            Some("fail") => Err(MessagingError::handler("rejected")),
                            _ => {
                                let _ = tx.send(message.payload);
                                Ok(())
                            }
                        }
                    }
                }),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();
        let mut events = transport.events().subscribe();

        for payload in ["boom", "fail", "ok"] {
            transport.publish("jobs", custom(json!(payload))).await.unwrap();
        }

        let delivered = tokio::time::timeout(Duration::from_secs(1), received.recv())
            .await
            .unwrap();
        assert_eq!(delivered, Some(json!("ok")));

        let errors: Vec<String> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::HandlerError {
                    subscription_id: id,
                    error,
                    ..
                } if id == subscription_id => Some(error),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("handler panicked: boom"));
        assert!(errors[1].contains("rejected"));
        assert_eq!(transport.connection_state(), ConnectionState::Connected);
    }
}

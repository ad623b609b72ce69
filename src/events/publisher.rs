//! # Typed Event Bus
//!
//! Every component owns an [`EventBus`] for its own event enum. Consumers either
//! hold a `broadcast::Receiver` via [`EventBus::subscribe`] or register a
//! callback with [`EventBus::on`]. Emitting never blocks and never fails: with
//! no subscribers the event is simply dropped.

use std::fmt;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default number of buffered events per subscriber before lagging
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Broadcast channel for one component's events
#[derive(Clone)]
pub struct EventBus<E> {
    name: &'static str,
    sender: broadcast::Sender<E>,
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.name)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl<E: Clone + Send + fmt::Debug + 'static> EventBus<E> {
    pub fn new(name: &'static str) -> Self {
        Self::with_capacity(name, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { name, sender }
    }

    /// Publish an event to every current subscriber
    pub fn emit(&self, event: E) {
        // Ignore error if no subscribers
        if self.sender.send(event).is_err() {
            debug!(bus = self.name, "Event emitted with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run `callback` for every event emitted from now on.
    ///
    /// The returned handle can be aborted to deregister the callback. Lagged
    /// events are logged and skipped.
    pub fn on<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(E) + Send + 'static,
    {
        let mut receiver = self.subscribe();
        let name = self.name;
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => callback(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(bus = name, skipped = skipped, "Event callback lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

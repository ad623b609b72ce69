//! Errors raised by the message transport and its providers.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessagingError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Not connected: {operation} requires an active connection")]
    NotConnected { operation: String },

    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Publish failed: {subject}: {message}")]
    Publish { subject: String, message: String },

    #[error("Subscribe failed: {subject}: {message}")]
    Subscribe { subject: String, message: String },

    #[error("Subscription not found: {subscription_id}")]
    SubscriptionNotFound { subscription_id: String },

    #[error("Invalid subject: {subject}: {reason}")]
    InvalidSubject { subject: String, reason: String },

    #[error("Could not encode message: {message}")]
    MessageSerialization { message: String },

    #[error("Could not decode message: {message}")]
    MessageDeserialization { message: String },

    #[error("Payload type mismatch: expected {expected}, found {found}")]
    PayloadMismatch { expected: String, found: String },

    #[error("Network timeout: operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Handler error: {message}")]
    Handler { message: String },

    #[error("Transport internal error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn not_connected(operation: impl Into<String>) -> Self {
        Self::NotConnected {
            operation: operation.into(),
        }
    }

    pub fn publish(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            subject: subject.into(),
            message: message.into(),
        }
    }

    pub fn subscribe(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Subscribe {
            subject: subject.into(),
            message: message.into(),
        }
    }

    pub fn invalid_subject(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSubject {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    pub fn message_serialization(message: impl Into<String>) -> Self {
        Self::MessageSerialization {
            message: message.into(),
        }
    }

    pub fn message_deserialization(message: impl Into<String>) -> Self {
        Self::MessageDeserialization {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error indicates the underlying connection is gone
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::NotConnected { .. } | Self::Publish { .. }
        )
    }
}

/// Parse failures decode as deserialization errors, the rest as serialization
impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() || err.is_eof() {
            MessagingError::message_deserialization(err.to_string())
        } else {
            MessagingError::message_serialization(err.to_string())
        }
    }
}

impl From<String> for MessagingError {
    fn from(message: String) -> Self {
        MessagingError::internal(message)
    }
}

pub type MessagingResult<T> = Result<T, MessagingError>;

//! # Message Envelope
//!
//! Every frame on the wire is a JSON [`Message`]: a `type` tag, a header block
//! and a payload. The payload is carried as raw JSON so that unknown or custom
//! message kinds can be relayed untouched, while [`MessagePayload`] gives each
//! known [`MessageType`] a statically typed shape.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::alerts::Alert;
use crate::health::SystemHealthStatus;
use crate::messaging::{MessagingError, MessagingResult};
use crate::orchestration::types::{ServiceLoadMetrics, TaskError, TaskInfo, TaskStatus};
use crate::services::ServiceInfo;

/// Header key stamped on republished persisted messages
pub const PERSISTENCE_ID_HEADER: &str = "persistenceId";
/// Header key carrying the delivery attempt number of a persisted message
pub const PERSISTENCE_ATTEMPT_HEADER: &str = "persistenceAttempt";

/// Wire-level message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    TaskCreate,
    TaskRequest,
    TaskAssign,
    TaskUpdate,
    TaskComplete,
    TaskFail,
    TaskCancel,
    ServiceRegister,
    ServiceLoad,
    HealthStatus,
    AlertNotification,
    PersistenceAck,
    Custom,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskCreate => "TASK_CREATE",
            MessageType::TaskRequest => "TASK_REQUEST",
            MessageType::TaskAssign => "TASK_ASSIGN",
            MessageType::TaskUpdate => "TASK_UPDATE",
            MessageType::TaskComplete => "TASK_COMPLETE",
            MessageType::TaskFail => "TASK_FAIL",
            MessageType::TaskCancel => "TASK_CANCEL",
            MessageType::ServiceRegister => "SERVICE_REGISTER",
            MessageType::ServiceLoad => "SERVICE_LOAD",
            MessageType::HealthStatus => "HEALTH_STATUS",
            MessageType::AlertNotification => "ALERT_NOTIFICATION",
            MessageType::PersistenceAck => "PERSISTENCE_ACK",
            MessageType::Custom => "CUSTOM",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope headers.
///
/// All standard fields are optional on construction; [`MessageHeaders::fill_defaults`]
/// stamps the missing ones right before a message is published. Anything else
/// found in the header block survives a round trip through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl MessageHeaders {
    /// Fill every missing standard header. Fields already set are left alone.
    pub fn fill_defaults(&mut self, source: &str) {
        if self.message_id.is_none() {
            self.message_id = Some(Uuid::new_v4().to_string());
        }
        if self.correlation_id.is_none() {
            self.correlation_id = Some(Uuid::new_v4().to_string());
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
        if self.source.is_none() {
            self.source = Some(source.to_string());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.extra.insert(key.into(), value.into());
    }
}

/// A message as carried over the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub headers: MessageHeaders,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    /// Build a message from a typed payload
    pub fn new(payload: MessagePayload) -> MessagingResult<Self> {
        let (message_type, payload) = payload.into_parts()?;
        Ok(Self {
            message_type,
            headers: MessageHeaders::default(),
            payload,
        })
    }

    /// Build a message from an already-encoded payload
    pub fn raw(message_type: MessageType, payload: Value) -> Self {
        Self {
            message_type,
            headers: MessageHeaders::default(),
            payload,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.headers.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn source(&self) -> Option<&str> {
        self.headers.source.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.correlation_id.as_deref()
    }

    /// Decode the payload into the variant matching `message_type`
    pub fn decode_payload(&self) -> MessagingResult<MessagePayload> {
        let raw = self.payload.clone();
        let decoded = match self.message_type {
            MessageType::TaskCreate => MessagePayload::TaskCreate(from_value(raw)?),
            MessageType::TaskRequest => MessagePayload::TaskRequest(from_value(raw)?),
            MessageType::TaskAssign => MessagePayload::TaskAssign(from_value(raw)?),
            MessageType::TaskUpdate => MessagePayload::TaskUpdate(from_value(raw)?),
            MessageType::TaskComplete => MessagePayload::TaskComplete(from_value(raw)?),
            MessageType::TaskFail => MessagePayload::TaskFail(from_value(raw)?),
            MessageType::TaskCancel => MessagePayload::TaskCancel(from_value(raw)?),
            MessageType::ServiceRegister => MessagePayload::ServiceRegister(from_value(raw)?),
            MessageType::ServiceLoad => MessagePayload::ServiceLoad(from_value(raw)?),
            MessageType::HealthStatus => MessagePayload::HealthStatus(from_value(raw)?),
            MessageType::AlertNotification => {
                MessagePayload::AlertNotification(from_value(raw)?)
            }
            MessageType::PersistenceAck => MessagePayload::PersistenceAck(from_value(raw)?),
            MessageType::Custom => MessagePayload::Custom(raw),
        };
        Ok(decoded)
    }

    /// Decode the payload as an arbitrary type, ignoring the type tag
    pub fn payload_as<T: DeserializeOwned>(&self) -> MessagingResult<T> {
        from_value(self.payload.clone())
    }

    pub fn to_bytes(&self) -> MessagingResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| MessagingError::message_serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> MessagingResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| MessagingError::message_deserialization(e.to_string()))
    }
}

fn from_value<T: DeserializeOwned>(value: Value) -> MessagingResult<T> {
    serde_json::from_value(value).map_err(|e| MessagingError::message_deserialization(e.to_string()))
}

/// Typed payloads, one variant per [`MessageType`]
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    TaskCreate(TaskCreatePayload),
    TaskRequest(TaskRequestPayload),
    TaskAssign(TaskAssignPayload),
    TaskUpdate(TaskUpdatePayload),
    TaskComplete(TaskCompletePayload),
    TaskFail(TaskFailPayload),
    TaskCancel(TaskCancelPayload),
    ServiceRegister(ServiceRegisterPayload),
    ServiceLoad(ServiceLoadPayload),
    HealthStatus(SystemHealthStatus),
    AlertNotification(Alert),
    PersistenceAck(PersistenceAckPayload),
    Custom(Value),
}

impl MessagePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::TaskCreate(_) => MessageType::TaskCreate,
            MessagePayload::TaskRequest(_) => MessageType::TaskRequest,
            MessagePayload::TaskAssign(_) => MessageType::TaskAssign,
            MessagePayload::TaskUpdate(_) => MessageType::TaskUpdate,
            MessagePayload::TaskComplete(_) => MessageType::TaskComplete,
            MessagePayload::TaskFail(_) => MessageType::TaskFail,
            MessagePayload::TaskCancel(_) => MessageType::TaskCancel,
            MessagePayload::ServiceRegister(_) => MessageType::ServiceRegister,
            MessagePayload::ServiceLoad(_) => MessageType::ServiceLoad,
            MessagePayload::HealthStatus(_) => MessageType::HealthStatus,
            MessagePayload::AlertNotification(_) => MessageType::AlertNotification,
            MessagePayload::PersistenceAck(_) => MessageType::PersistenceAck,
            MessagePayload::Custom(_) => MessageType::Custom,
        }
    }

    fn into_parts(self) -> MessagingResult<(MessageType, Value)> {
        let message_type = self.message_type();
        let value = match self {
            MessagePayload::TaskCreate(p) => serde_json::to_value(p),
            MessagePayload::TaskRequest(p) => serde_json::to_value(p),
            MessagePayload::TaskAssign(p) => serde_json::to_value(p),
            MessagePayload::TaskUpdate(p) => serde_json::to_value(p),
            MessagePayload::TaskComplete(p) => serde_json::to_value(p),
            MessagePayload::TaskFail(p) => serde_json::to_value(p),
            MessagePayload::TaskCancel(p) => serde_json::to_value(p),
            MessagePayload::ServiceRegister(p) => serde_json::to_value(p),
            MessagePayload::ServiceLoad(p) => serde_json::to_value(p),
            MessagePayload::HealthStatus(p) => serde_json::to_value(p),
            MessagePayload::AlertNotification(p) => serde_json::to_value(p),
            MessagePayload::PersistenceAck(p) => serde_json::to_value(p),
            MessagePayload::Custom(v) => Ok(v),
        }
        .map_err(|e| MessagingError::message_serialization(e.to_string()))?;
        Ok((message_type, value))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreatePayload {
    pub task: TaskInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequestPayload {
    pub task: TaskInfo,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignPayload {
    pub task: TaskInfo,
    pub assigned_to: String,
    /// Strategy that produced the assignment
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdatePayload {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletePayload {
    pub task_id: String,
    pub task_type: String,
    pub result: Value,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailPayload {
    pub task_id: String,
    pub task_type: String,
    pub error: TaskError,
    pub retry_count: u32,
    pub will_retry: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCancelPayload {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegisterPayload {
    pub service: ServiceInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceLoadPayload {
    pub service_id: String,
    pub metrics: ServiceLoadMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceAckPayload {
    pub persistence_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
}

impl From<TaskCreatePayload> for MessagePayload {
    fn from(p: TaskCreatePayload) -> Self {
        MessagePayload::TaskCreate(p)
    }
}

impl From<PersistenceAckPayload> for MessagePayload {
    fn from(p: PersistenceAckPayload) -> Self {
        MessagePayload::PersistenceAck(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fill_defaults_keeps_existing_fields() {
        let mut headers = MessageHeaders {
            correlation_id: Some("corr-1".to_string()),
            ..Default::default()
        };
        headers.fill_defaults("svc-a");

        assert_eq!(headers.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(headers.source.as_deref(), Some("svc-a"));
        assert!(headers.message_id.is_some());
        assert!(headers.timestamp.is_some());
    }

    #[test]
    fn test_wire_format_uses_camel_case_headers() {
        let message = Message::raw(MessageType::Custom, json!({"x": 1}))
            .with_correlation_id("corr-9")
            .with_header(PERSISTENCE_ATTEMPT_HEADER, 2);

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "CUSTOM");
        assert_eq!(value["headers"]["correlationId"], "corr-9");
        assert_eq!(value["headers"]["persistenceAttempt"], 2);
        assert!(value["headers"].get("replyTo").is_none());

        let decoded = Message::from_bytes(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.headers.get(PERSISTENCE_ATTEMPT_HEADER), Some(&json!(2)));
    }

    #[test]
    fn test_decode_payload_by_type() {
        let ack = PersistenceAckPayload {
            persistence_id: "p-1".to_string(),
            success: true,
            error: None,
            receiver: None,
        };
        let message = Message::new(ack.clone().into()).unwrap();
        assert_eq!(message.message_type, MessageType::PersistenceAck);

        match message.decode_payload().unwrap() {
            MessagePayload::PersistenceAck(decoded) => assert_eq!(decoded, ack),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_decode_payload_rejects_mismatched_shape() {
        let message = Message::raw(MessageType::TaskCancel, json!({"unexpected": true}));
        assert!(matches!(
            message.decode_payload(),
            Err(MessagingError::MessageDeserialization { .. })
        ));
    }
}

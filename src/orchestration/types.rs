//! Shared task and load types carried on `task.*` and `system.load` subjects.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::constants::task_error_codes;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    /// Completed and cancelled tasks never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Finished from the caller's perspective (a failed task may still be retried)
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether a locally driven transition from `self` to `next` is allowed
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Pending | InProgress | Completed | Failed | Cancelled) => true,
            (InProgress, InProgress | Completed | Failed | Cancelled) => true,
            // scheduled retry
            (Failed, Pending) => true,
            (Failed, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured task failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl TaskError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Handler errors may be transient
    pub fn handler_error(message: impl Into<String>) -> Self {
        Self::new(task_error_codes::HANDLER_ERROR, message, true)
    }

    pub fn no_handler(task_type: &str) -> Self {
        Self::new(
            task_error_codes::NO_HANDLER,
            format!("No handler registered for task type '{task_type}'"),
            false,
        )
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::new(
            task_error_codes::TIMEOUT,
            format!("Task timed out after {}ms", timeout.as_millis()),
            true,
        )
    }

    /// Panics are not retryable
    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(
            task_error_codes::HANDLER_PANIC,
            format!("Handler panicked: {}", message.into()),
            false,
        )
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A distributed task as tracked by every interested node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub task_id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Per-task execution timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
}

impl TaskInfo {
    /// New pending task with a generated id
    pub fn new(task_type: impl Into<String>, parameters: Value) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            assigned_to: None,
            priority: 0,
            parameters,
            result: None,
            error: None,
            progress: None,
            timeout: None,
            retry_count: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }
}

/// Options accepted by task creation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateTaskOptions {
    pub assign_to: Option<String>,
    pub priority: Option<i32>,
    pub timeout: Option<Duration>,
}

/// Partial update applied by `update_task`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<f64>,
    pub assigned_to: Option<String>,
    pub parameters: Option<Value>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }
}

/// Load report a service publishes on `system.load`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceLoadMetrics {
    #[serde(default)]
    pub queue_length: u32,
    /// Percent
    #[serde(default)]
    pub cpu: f64,
    /// Percent
    #[serde(default)]
    pub memory: f64,
    #[serde(default)]
    pub task_completion_rate: f64,
    /// Milliseconds
    #[serde(default)]
    pub average_response_time: f64,
    /// 0.0..=1.0
    #[serde(default)]
    pub error_rate: f64,
    pub last_updated: DateTime<Utc>,
}

impl Default for ServiceLoadMetrics {
    fn default() -> Self {
        Self {
            queue_length: 0,
            cpu: 0.0,
            memory: 0.0,
            task_completion_rate: 0.0,
            average_response_time: 0.0,
            error_rate: 0.0,
            last_updated: Utc::now(),
        }
    }
}

impl ServiceLoadMetrics {
    /// Weighted load score; lower is less busy
    pub fn load_score(&self) -> f64 {
        self.queue_length as f64 * 10.0 + self.cpu * 0.5 + self.memory * 0.3 + self.error_rate * 20.0
    }
}

/// Counts of tracked tasks by status
pub type TaskStatusCounts = HashMap<TaskStatus, usize>;

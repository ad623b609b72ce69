//! # Task Manager
//!
//! Owns the lifecycle of distributed tasks on one node.
//!
//! Every local transition mutates the tracked [`TaskInfo`] and publishes the
//! matching `task.*` message so peers observe the same lifecycle. Inbound copies
//! update a task only when it is already tracked, or create it when it is
//! addressed to this node (`assignTo` on `task.create`, the assignee of
//! `task.assign`, or a capability match on `task.request`). Messages this node
//! published itself are ignored on receipt.
//!
//! ## Execution
//!
//! [`TaskManager::process_task`] admits a pending task when fewer than
//! `max_concurrent_tasks` are running. Beyond the cap tasks wait in a bounded
//! FIFO backlog that drains as slots free; a full backlog defers the task
//! (left `PENDING`, reported through [`TaskEvent::Deferred`]).
//!
//! A running handler races the task timeout (`task.timeout` or the configured
//! default) and is guarded against panics. Failures are structured
//! [`TaskError`]s; retryable failures are retried after
//! `min(initial * factor^retry_count, max)` until `retry_count` reaches
//! `max_retries`. Cancelling a running task does not interrupt its handler; the
//! handler's eventual result is discarded.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TaskManagerConfig;
use crate::constants::task_capability;
use crate::error::{A2aError, A2aResult};
use crate::events::EventBus;
use crate::logging::log_task_operation;
use crate::messaging::{
    handler_fn, subjects, Message, MessagePayload, MessageTransport, MessagingResult,
    SubscribeOptions, TaskAssignPayload, TaskCancelPayload, TaskCompletePayload,
    TaskCreatePayload, TaskFailPayload, TaskRequestPayload, TaskUpdatePayload,
};
use crate::orchestration::backoff::RetryPolicy;
use crate::orchestration::load_balancer::{LoadBalancer, SelectionOptions};
use crate::orchestration::types::{
    CreateTaskOptions, ServiceLoadMetrics, TaskError, TaskInfo, TaskStatus, TaskStatusCounts,
    TaskUpdate,
};

/// Executes tasks of one type
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: TaskInfo) -> Result<Value, TaskError>;
}

struct FnTaskHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnTaskHandler<F>
where
    F: Fn(TaskInfo) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send,
{
    async fn handle(&self, task: TaskInfo) -> Result<Value, TaskError> {
        (self.0)(task).await
    }
}

/// Adapt an async closure into a [`TaskHandler`]
pub fn task_handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    Arc::new(FnTaskHandler(f))
}

/// Task lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Created(TaskInfo),
    Updated(TaskInfo),
    Started(TaskInfo),
    Completed(TaskInfo),
    Failed { task: TaskInfo, will_retry: bool },
    Cancelled(TaskInfo),
    Assigned { task_id: String, service_id: String },
    RetryScheduled {
        task_id: String,
        retry_count: u32,
        delay: Duration,
    },
    Queued { task_id: String, backlog_len: usize },
    /// Concurrency cap reached and backlog full; the task stays `PENDING`
    Deferred { task_id: String },
    /// A handler finished for a task that was cancelled meanwhile
    ResultDiscarded { task_id: String },
}

/// Result of [`TaskManager::process_task`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Started,
    Queued,
    Deferred,
    /// No handler for the task type; the task was failed with `NO_HANDLER`
    Rejected,
    /// Not pending, already admitted, or the manager is shutting down
    Skipped,
}

#[derive(Debug, Default)]
struct ExecutionState {
    running: HashSet<String>,
    backlog: VecDeque<String>,
}

enum Admission {
    Run,
    Queued(usize),
    Deferred,
    Skip,
}

/// Distributed task lifecycle manager for one service
pub struct TaskManager {
    service_id: String,
    capabilities: Vec<String>,
    transport: Arc<MessageTransport>,
    config: TaskManagerConfig,
    retry_policy: RetryPolicy,
    tasks: DashMap<String, TaskInfo>,
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
    execution: Mutex<ExecutionState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<String>>,
    load_balancer: Mutex<Option<Arc<LoadBalancer>>>,
    shutdown: CancellationToken,
    events: EventBus<TaskEvent>,
    self_ref: Weak<Self>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("service_id", &self.service_id)
            .field("tasks", &self.tasks.len())
            .field("handlers", &self.handlers.len())
            .field("running", &self.execution.lock().running.len())
            .finish()
    }
}

impl TaskManager {
    pub fn new(
        transport: Arc<MessageTransport>,
        capabilities: Vec<String>,
        config: TaskManagerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            service_id: transport.source().to_string(),
            capabilities,
            retry_policy: RetryPolicy::from_config(&config),
            config,
            transport,
            tasks: DashMap::new(),
            handlers: DashMap::new(),
            execution: Mutex::new(ExecutionState::default()),
            workers: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            load_balancer: Mutex::new(None),
            shutdown: CancellationToken::new(),
            events: EventBus::new("task_manager"),
            self_ref: self_ref.clone(),
        })
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn events(&self) -> &EventBus<TaskEvent> {
        &self.events
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Subscribe to every `task.*` subject
    pub async fn start(self: &Arc<Self>) -> MessagingResult<()> {
        if !self.subscriptions.lock().is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(subjects::TASK_SUBJECTS.len());
        for subject in subjects::TASK_SUBJECTS {
            let manager: Weak<Self> = Arc::downgrade(self);
            let id = self
                .transport
                .subscribe(
                    subject,
                    handler_fn(move |message: Message| {
                        let manager = manager.clone();
                        async move {
                            match manager.upgrade() {
                                Some(manager) => manager.handle_inbound(message).await,
                                None => Ok(()),
                            }
                        }
                    }),
                    SubscribeOptions::default(),
                )
                .await?;
            ids.push(id);
        }

        *self.subscriptions.lock() = ids;
        info!(
            service_id = %self.service_id,
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            backlog_capacity = self.config.backlog_capacity,
            "Task manager started"
        );
        Ok(())
    }

    /// Stop inbound processing and pending retries, then wait for running handlers
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let ids: Vec<String> = std::mem::take(&mut *self.subscriptions.lock());
        for id in ids {
            if let Err(e) = self.transport.unsubscribe(&id) {
                debug!(subscription_id = %id, error = %e, "Task subscription already gone");
            }
        }

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
        info!(service_id = %self.service_id, "Task manager stopped");
    }

    pub fn register_task_handler(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        info!(task_type = %task_type, "Task handler registered");
        self.handlers.insert(task_type, handler);
    }

    pub fn has_handler(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Capabilities this node advertises: configured ones plus `task.{type}`
    /// for every registered handler
    pub fn capabilities(&self) -> Vec<String> {
        let mut capabilities = self.capabilities.clone();
        for entry in self.handlers.iter() {
            let capability = task_capability(entry.key());
            if !capabilities.contains(&capability) {
                capabilities.push(capability);
            }
        }
        capabilities.sort();
        capabilities
    }

    pub fn get_task(&self, task_id: &str) -> Option<TaskInfo> {
        self.tasks.get(task_id).map(|t| t.clone())
    }

    /// Tracked tasks, optionally filtered by status, oldest first
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self
            .tasks
            .iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .map(|t| t.clone())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    pub fn status_counts(&self) -> TaskStatusCounts {
        let mut counts = TaskStatusCounts::new();
        for task in self.tasks.iter() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn running_count(&self) -> usize {
        self.execution.lock().running.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.execution.lock().backlog.len()
    }

    /// Load of this node as published on `system.load`. The queue length
    /// counts running and backlogged tasks; the completion rate is completed
    /// over completed plus failed among tracked tasks.
    pub fn load_metrics(&self) -> ServiceLoadMetrics {
        let queue_length = {
            let execution = self.execution.lock();
            execution.running.len() + execution.backlog.len()
        };
        let counts = self.status_counts();
        let completed = counts.get(&TaskStatus::Completed).copied().unwrap_or(0);
        let failed = counts.get(&TaskStatus::Failed).copied().unwrap_or(0);
        let task_completion_rate = if completed + failed == 0 {
            0.0
        } else {
            completed as f64 / (completed + failed) as f64
        };

        ServiceLoadMetrics {
            queue_length: u32::try_from(queue_length).unwrap_or(u32::MAX),
            task_completion_rate,
            ..Default::default()
        }
    }

    /// Stop tracking a task
    pub fn evict_task(&self, task_id: &str) -> Option<TaskInfo> {
        self.execution.lock().backlog.retain(|id| id != task_id);
        self.tasks.remove(task_id).map(|(_, task)| task)
    }

    /// Evict finished, not running tasks last updated before `cutoff`
    pub fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let running = self.execution.lock().running.clone();
        let before = self.tasks.len();
        self.tasks.retain(|id, task| {
            !(task.status.is_finished() && task.updated_at < cutoff && !running.contains(id))
        });
        let evicted = before - self.tasks.len();
        if evicted > 0 {
            debug!(evicted = evicted, "Evicted finished tasks");
        }
        evicted
    }

    /// Create and track a task, publish `task.create`, and process it locally
    /// when it is addressed to this node or unaddressed with a local handler
    pub async fn create_task(
        &self,
        task_type: impl Into<String>,
        parameters: Value,
        options: CreateTaskOptions,
    ) -> A2aResult<TaskInfo> {
        let mut task = TaskInfo::new(task_type, parameters);
        task.assigned_to = options.assign_to.clone();
        if let Some(priority) = options.priority {
            task.priority = priority;
        }
        if let Some(timeout) = options.timeout {
            task = task.with_timeout(timeout);
        }

        self.tasks.insert(task.task_id.clone(), task.clone());
        log_task_operation(
            "create",
            &task.task_id,
            Some(&task.task_type),
            task.status.as_str(),
            options.assign_to.as_deref(),
        );
        self.events.emit(TaskEvent::Created(task.clone()));

        self.publish(
            subjects::TASK_CREATE,
            MessagePayload::TaskCreate(TaskCreatePayload {
                task: task.clone(),
                assign_to: options.assign_to.clone(),
            }),
        )
        .await?;

        let local = match options.assign_to.as_deref() {
            Some(assignee) => assignee == self.service_id,
            None => self.has_handler(&task.task_type),
        };
        if local {
            self.process_task(&task.task_id).await?;
        }

        Ok(self.get_task(&task.task_id).unwrap_or(task))
    }

    /// Track a task and publish `task.request` for any peer holding the
    /// required capabilities (`task.{type}` when none are given)
    pub async fn request_task(
        &self,
        task_type: impl Into<String>,
        parameters: Value,
        required_capabilities: Vec<String>,
    ) -> A2aResult<TaskInfo> {
        let task = TaskInfo::new(task_type, parameters);
        let required_capabilities = if required_capabilities.is_empty() {
            vec![task_capability(&task.task_type)]
        } else {
            required_capabilities
        };

        self.tasks.insert(task.task_id.clone(), task.clone());
        self.events.emit(TaskEvent::Created(task.clone()));
        info!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            required_capabilities = ?required_capabilities,
            "Task requested"
        );

        self.publish(
            subjects::TASK_REQUEST,
            MessagePayload::TaskRequest(TaskRequestPayload {
                task: task.clone(),
                required_capabilities,
            }),
        )
        .await?;
        Ok(task)
    }

    /// Route tasks created through [`TaskManager::dispatch_task`] via `balancer`
    pub fn set_load_balancer(&self, balancer: Arc<LoadBalancer>) {
        *self.load_balancer.lock() = Some(balancer);
    }

    /// Create a task and hand it to the service the load balancer selects.
    ///
    /// The balancer publishes `task.assign`. A task assigned to this node is
    /// processed here since the node ignores its own messages; a task no
    /// eligible service can take stays `PENDING` and unassigned.
    pub async fn dispatch_task(
        &self,
        task_type: impl Into<String>,
        parameters: Value,
        options: SelectionOptions,
    ) -> A2aResult<TaskInfo> {
        let balancer = self.load_balancer.lock().clone().ok_or_else(|| {
            A2aError::ConfigurationError("No load balancer attached to the task manager".to_string())
        })?;

        let task = TaskInfo::new(task_type, parameters);
        let task_id = task.task_id.clone();
        self.tasks.insert(task_id.clone(), task.clone());
        self.events.emit(TaskEvent::Created(task.clone()));

        let Some(service) = balancer.assign_task(&task, &options).await? else {
            return Ok(task);
        };

        if let Some(mut local) = self.tasks.get_mut(&task_id) {
            local.assigned_to = Some(service.id.clone());
            local.updated_at = Utc::now();
        }
        self.events.emit(TaskEvent::Assigned {
            task_id: task_id.clone(),
            service_id: service.id.clone(),
        });

        if service.id == self.service_id {
            self.process_task(&task_id).await?;
        }
        self.get_task(&task_id).ok_or(A2aError::TaskNotFound { task_id })
    }

    /// Apply a partial update and publish `task.update`
    pub async fn update_task(&self, task_id: &str, update: TaskUpdate) -> A2aResult<TaskInfo> {
        let current = self
            .get_task(task_id)
            .ok_or_else(|| A2aError::TaskNotFound {
                task_id: task_id.to_string(),
            })?
            .status;
        let next = update.status.unwrap_or(current);

        let task = self.transition(task_id, next, |task| {
            if let Some(progress) = update.progress {
                task.progress = Some(progress.clamp(0.0, 1.0));
            }
            if let Some(assigned_to) = update.assigned_to.clone() {
                task.assigned_to = Some(assigned_to);
            }
            if let Some(parameters) = update.parameters.clone() {
                task.parameters = parameters;
            }
        })?;

        self.events.emit(TaskEvent::Updated(task.clone()));
        self.publish_update(&task).await?;
        Ok(task)
    }

    /// Mark a task completed with `result` and publish `task.complete`
    pub async fn complete_task(&self, task_id: &str, result: Value) -> A2aResult<TaskInfo> {
        let task = self.transition(task_id, TaskStatus::Completed, |task| {
            task.result = Some(result.clone());
            task.error = None;
            task.progress = Some(1.0);
        })?;

        log_task_operation("complete", task_id, Some(&task.task_type), task.status.as_str(), None);
        self.events.emit(TaskEvent::Completed(task.clone()));

        self.publish(
            subjects::TASK_COMPLETE,
            MessagePayload::TaskComplete(TaskCompletePayload {
                task_id: task.task_id.clone(),
                task_type: task.task_type.clone(),
                result,
                completed_at: task.updated_at,
            }),
        )
        .await?;
        Ok(task)
    }

    /// Mark a task failed, publish `task.fail`, and schedule a retry when the
    /// error is retryable, retries remain and a local handler exists
    pub async fn fail_task(&self, task_id: &str, task_error: TaskError) -> A2aResult<TaskInfo> {
        let task = self.transition(task_id, TaskStatus::Failed, |task| {
            task.error = Some(task_error.clone());
        })?;

        let will_retry = task_error.retryable
            && self.retry_policy.should_retry(task.retry_count)
            && self.has_handler(&task.task_type)
            && !self.shutdown.is_cancelled();

        warn!(
            task_id = %task_id,
            task_type = %task.task_type,
            code = %task_error.code,
            error = %task_error.message,
            retry_count = task.retry_count,
            will_retry = will_retry,
            "Task failed"
        );
        self.events.emit(TaskEvent::Failed {
            task: task.clone(),
            will_retry,
        });

        let published = self
            .publish(
                subjects::TASK_FAIL,
                MessagePayload::TaskFail(TaskFailPayload {
                    task_id: task.task_id.clone(),
                    task_type: task.task_type.clone(),
                    error: task_error,
                    retry_count: task.retry_count,
                    will_retry,
                }),
            )
            .await;

        if will_retry {
            self.schedule_retry(task.task_id.clone(), task.retry_count);
        }
        published.map(|_| task)
    }

    /// Cancel a task and publish `task.cancel`. A running handler is not
    /// interrupted; its result is discarded.
    pub async fn cancel_task(&self, task_id: &str, reason: Option<String>) -> A2aResult<TaskInfo> {
        let task = self.transition(task_id, TaskStatus::Cancelled, |_| {})?;
        self.execution.lock().backlog.retain(|id| id != task_id);

        info!(task_id = %task_id, reason = ?reason, "Task cancelled");
        self.events.emit(TaskEvent::Cancelled(task.clone()));

        self.publish(
            subjects::TASK_CANCEL,
            MessagePayload::TaskCancel(TaskCancelPayload {
                task_id: task_id.to_string(),
                reason,
            }),
        )
        .await?;
        Ok(task)
    }

    /// Admit a pending task for local execution
    pub async fn process_task(&self, task_id: &str) -> A2aResult<ProcessOutcome> {
        let task = self.get_task(task_id).ok_or_else(|| A2aError::TaskNotFound {
            task_id: task_id.to_string(),
        })?;
        if task.status != TaskStatus::Pending || self.shutdown.is_cancelled() {
            return Ok(ProcessOutcome::Skipped);
        }

        let Some(handler) = self.handler_for(&task.task_type) else {
            self.fail_task(task_id, TaskError::no_handler(&task.task_type))
                .await?;
            return Ok(ProcessOutcome::Rejected);
        };

        let admission = {
            let mut execution = self.execution.lock();
            if execution.running.contains(task_id) || execution.backlog.iter().any(|id| id == task_id)
            {
                Admission::Skip
            } else if execution.running.len() < self.config.max_concurrent_tasks {
                execution.running.insert(task_id.to_string());
                Admission::Run
            } else if execution.backlog.len() < self.config.backlog_capacity {
                execution.backlog.push_back(task_id.to_string());
                Admission::Queued(execution.backlog.len())
            } else {
                Admission::Deferred
            }
        };

        match admission {
            Admission::Run => {
                self.begin_execution(task, handler).await;
                Ok(ProcessOutcome::Started)
            }
            Admission::Queued(backlog_len) => {
                debug!(task_id = %task_id, backlog_len = backlog_len, "Task queued behind concurrency cap");
                self.events.emit(TaskEvent::Queued {
                    task_id: task_id.to_string(),
                    backlog_len,
                });
                Ok(ProcessOutcome::Queued)
            }
            Admission::Deferred => {
                warn!(task_id = %task_id, "Concurrency cap and backlog full, task deferred");
                self.events.emit(TaskEvent::Deferred {
                    task_id: task_id.to_string(),
                });
                Ok(ProcessOutcome::Deferred)
            }
            Admission::Skip => Ok(ProcessOutcome::Skipped),
        }
    }

    fn handler_for(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).map(|h| Arc::clone(h.value()))
    }

    /// Move an admitted task to `IN_PROGRESS` and spawn its handler.
    /// The caller has already reserved a running slot.
    async fn begin_execution(&self, task: TaskInfo, handler: Arc<dyn TaskHandler>) {
        let task_id = task.task_id.clone();
        let service_id = self.service_id.clone();
        let started = match self.transition(&task_id, TaskStatus::InProgress, |task| {
            task.assigned_to = Some(service_id);
        }) {
            Ok(started) => started,
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Task no longer startable");
                self.execution.lock().running.remove(&task_id);
                return;
            }
        };

        debug!(task_id = %task_id, task_type = %started.task_type, "Task started");
        self.events.emit(TaskEvent::Started(started.clone()));
        if let Err(e) = self.publish_update(&started).await {
            warn!(task_id = %task_id, error = %e, "Failed to publish task start");
        }

        self.spawn_execution(started, handler);
    }

    fn spawn_execution(&self, task: TaskInfo, handler: Arc<dyn TaskHandler>) {
        let Some(manager) = self.self_arc() else {
            self.execution.lock().running.remove(&task.task_id);
            return;
        };
        let handle = tokio::spawn(manager.run_task(task, handler));
        let mut workers = self.workers.lock();
        workers.retain(|w| !w.is_finished());
        workers.push(handle);
    }

    async fn run_task(self: Arc<Self>, task: TaskInfo, handler: Arc<dyn TaskHandler>) {
        let task_id = task.task_id.clone();
        let timeout = task
            .timeout_duration()
            .unwrap_or_else(|| self.config.task_timeout());

        let outcome = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(handler.handle(task)).catch_unwind(),
        )
        .await;

        self.execution.lock().running.remove(&task_id);

        let still_running = self
            .tasks
            .get(&task_id)
            .is_some_and(|t| t.status == TaskStatus::InProgress);
        if !still_running {
            info!(task_id = %task_id, "Handler finished for a task no longer in progress, result discarded");
            self.events.emit(TaskEvent::ResultDiscarded {
                task_id: task_id.clone(),
            });
        } else {
            let recorded = match outcome {
                Ok(Ok(Ok(result))) => self.complete_task(&task_id, result).await,
                Ok(Ok(Err(task_error))) => self.fail_task(&task_id, task_error).await,
                Ok(Err(panic)) => {
                    let message = if let Some(s) = panic.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "Unknown panic".to_string()
                    };
                    error!(task_id = %task_id, panic_msg = %message, "Task handler panicked");
                    self.fail_task(&task_id, TaskError::panic(message)).await
                }
                Err(_) => self.fail_task(&task_id, TaskError::timeout(timeout)).await,
            };
            if let Err(e) = recorded {
                warn!(task_id = %task_id, error = %e, "Failed to record task outcome");
            }
        }

        self.schedule_backlog();
    }

    fn schedule_backlog(&self) {
        if self.shutdown.is_cancelled() || self.execution.lock().backlog.is_empty() {
            return;
        }
        if let Some(manager) = self.self_arc() {
            tokio::spawn(async move { manager.drain_backlog().await });
        }
    }

    async fn drain_backlog(&self) {
        loop {
            let next = {
                let mut execution = self.execution.lock();
                if execution.running.len() >= self.config.max_concurrent_tasks {
                    None
                } else {
                    let next = execution.backlog.pop_front();
                    if let Some(id) = &next {
                        execution.running.insert(id.clone());
                    }
                    next
                }
            };
            let Some(task_id) = next else {
                break;
            };

            let task = self
                .get_task(&task_id)
                .filter(|t| t.status == TaskStatus::Pending);
            let handler = task.as_ref().and_then(|t| self.handler_for(&t.task_type));
            match (task, handler) {
                (Some(task), Some(handler)) => self.begin_execution(task, handler).await,
                (Some(task), None) => {
                    self.execution.lock().running.remove(&task_id);
                    if let Err(e) = self
                        .fail_task(&task_id, TaskError::no_handler(&task.task_type))
                        .await
                    {
                        warn!(task_id = %task_id, error = %e, "Failed to reject backlogged task");
                    }
                }
                (None, _) => {
                    self.execution.lock().running.remove(&task_id);
                }
            }
        }
    }

    fn schedule_retry(&self, task_id: String, retry_count: u32) {
        let delay = self.retry_policy.delay_for(retry_count);
        info!(task_id = %task_id, retry_count = retry_count, delay_ms = delay.as_millis() as u64, "Task retry scheduled");
        self.events.emit(TaskEvent::RetryScheduled {
            task_id: task_id.clone(),
            retry_count,
            delay,
        });

        let Some(manager) = self.self_arc() else {
            return;
        };
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => manager.retry(&task_id).await,
            }
        });
    }

    async fn retry(&self, task_id: &str) {
        let task = match self.transition(task_id, TaskStatus::Pending, |task| {
            task.retry_count += 1;
            task.error = None;
            task.progress = None;
        }) {
            Ok(task) => task,
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Retry skipped");
                return;
            }
        };

        self.events.emit(TaskEvent::Updated(task.clone()));
        if let Err(e) = self.publish_update(&task).await {
            warn!(task_id = %task_id, error = %e, "Failed to publish task retry");
        }
        if let Err(e) = self.process_task(task_id).await {
            warn!(task_id = %task_id, error = %e, "Failed to process retried task");
        }
    }

    fn transition<F>(&self, task_id: &str, next: TaskStatus, mutate: F) -> A2aResult<TaskInfo>
    where
        F: FnOnce(&mut TaskInfo),
    {
        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| A2aError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        if !task.status.can_transition_to(next) {
            return Err(A2aError::InvalidTaskTransition {
                task_id: task_id.to_string(),
                from: task.status.to_string(),
                to: next.to_string(),
            });
        }
        task.status = next;
        mutate(task.value_mut());
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn publish(&self, subject: &str, payload: MessagePayload) -> A2aResult<()> {
        self.transport
            .publish(subject, Message::new(payload)?)
            .await?;
        Ok(())
    }

    async fn publish_update(&self, task: &TaskInfo) -> A2aResult<()> {
        self.publish(
            subjects::TASK_UPDATE,
            MessagePayload::TaskUpdate(TaskUpdatePayload {
                task_id: task.task_id.clone(),
                status: task.status,
                progress: task.progress,
                assigned_to: task.assigned_to.clone(),
                updated_at: task.updated_at,
            }),
        )
        .await
    }

    fn self_arc(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }

    async fn handle_inbound(&self, message: Message) -> MessagingResult<()> {
        if message.source() == Some(self.service_id.as_str()) {
            return Ok(());
        }

        match message.decode_payload()? {
            MessagePayload::TaskCreate(TaskCreatePayload { task, assign_to }) => {
                if self.tasks.contains_key(&task.task_id) {
                    self.apply_remote(&task.task_id, |local| {
                        local.assigned_to = assign_to.clone().or(local.assigned_to.take());
                    });
                } else if assign_to.as_deref() == Some(self.service_id.as_str()) {
                    self.accept_remote(task).await;
                }
            }
            MessagePayload::TaskRequest(TaskRequestPayload {
                task,
                required_capabilities,
            }) => {
                if !self.tasks.contains_key(&task.task_id)
                    && self.can_serve(&task.task_type, &required_capabilities)
                {
                    self.accept_remote(task).await;
                }
            }
            MessagePayload::TaskAssign(TaskAssignPayload {
                task, assigned_to, ..
            }) => {
                let task_id = task.task_id.clone();
                let known = self.tasks.contains_key(&task_id);
                self.events.emit(TaskEvent::Assigned {
                    task_id: task_id.clone(),
                    service_id: assigned_to.clone(),
                });
                if assigned_to == self.service_id && !known {
                    self.accept_remote(task).await;
                } else if known {
                    self.apply_remote(&task_id, |local| {
                        local.assigned_to = Some(assigned_to.clone());
                    });
                }
            }
            MessagePayload::TaskUpdate(update) => {
                self.apply_remote(&update.task_id, |local| {
                    local.status = update.status;
                    if update.progress.is_some() {
                        local.progress = update.progress;
                    }
                    if update.assigned_to.is_some() {
                        local.assigned_to = update.assigned_to.clone();
                    }
                });
            }
            MessagePayload::TaskComplete(complete) => {
                self.apply_remote(&complete.task_id, |local| {
                    local.status = TaskStatus::Completed;
                    local.result = Some(complete.result.clone());
                    local.error = None;
                });
            }
            MessagePayload::TaskFail(fail) => {
                self.apply_remote(&fail.task_id, |local| {
                    local.status = TaskStatus::Failed;
                    local.error = Some(fail.error.clone());
                    local.retry_count = fail.retry_count;
                });
            }
            MessagePayload::TaskCancel(TaskCancelPayload { task_id, reason }) => {
                self.execution.lock().backlog.retain(|id| id != &task_id);
                if let Some(task) = self.apply_remote(&task_id, |local| {
                    local.status = TaskStatus::Cancelled;
                }) {
                    info!(task_id = %task_id, reason = ?reason, "Task cancelled by peer");
                    self.events.emit(TaskEvent::Cancelled(task));
                }
            }
            other => {
                debug!(message_type = %other.message_type(), "Ignoring non-task message on task subject");
            }
        }
        Ok(())
    }

    fn can_serve(&self, task_type: &str, required_capabilities: &[String]) -> bool {
        if !self.has_handler(task_type) {
            return false;
        }
        let capabilities = self.capabilities();
        required_capabilities.iter().all(|c| capabilities.contains(c))
    }

    /// Track a task addressed to this node and try to run it
    async fn accept_remote(&self, mut task: TaskInfo) {
        task.assigned_to = Some(self.service_id.clone());
        task.status = TaskStatus::Pending;
        let task_id = task.task_id.clone();
        info!(task_id = %task_id, task_type = %task.task_type, "Accepted task from peer");
        self.tasks.insert(task_id.clone(), task.clone());
        self.events.emit(TaskEvent::Created(task));

        if let Err(e) = self.process_task(&task_id).await {
            warn!(task_id = %task_id, error = %e, "Failed to process accepted task");
        }
    }

    /// Apply a peer's view of a tracked task. Completed and cancelled tasks are
    /// never reopened.
    fn apply_remote<F>(&self, task_id: &str, apply: F) -> Option<TaskInfo>
    where
        F: FnOnce(&mut TaskInfo),
    {
        let updated = {
            let mut task = self.tasks.get_mut(task_id)?;
            if task.status.is_terminal() {
                debug!(task_id = %task_id, status = %task.status, "Ignoring peer update to finished task");
                return None;
            }
            apply(task.value_mut());
            task.updated_at = Utc::now();
            task.clone()
        };
        self.events.emit(TaskEvent::Updated(updated.clone()));
        Some(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::constants::task_error_codes;
    use crate::messaging::InMemoryBroker;
    use serde_json::json;

    async fn manager_with(config: TaskManagerConfig) -> Arc<TaskManager> {
        manager_on(&InMemoryBroker::new(), config).await
    }

    async fn manager_on(broker: &InMemoryBroker, config: TaskManagerConfig) -> Arc<TaskManager> {
        let transport = MessageTransport::new("node-a", broker.connector(), TransportConfig::default());
        transport.connect().await.unwrap();
        let manager = TaskManager::new(transport, vec![], config);
        manager.start().await.unwrap();
        manager
    }

    async fn wait_for_status(manager: &TaskManager, task_id: &str, status: TaskStatus) -> TaskInfo {
        for _ in 0..500 {
            if let Some(task) = manager.get_task(task_id) {
                if task.status == status {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached {status}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_task_completes_with_handler_result() {
        let manager = manager_with(TaskManagerConfig::default()).await;
        manager.register_task_handler(
            "echo",
            task_handler_fn(|task: TaskInfo| async move { Ok(task.parameters) }),
        );

        let task = manager
            .create_task("echo", json!({"x": 1}), CreateTaskOptions::default())
            .await
            .unwrap();

        let done = wait_for_status(&manager, &task.task_id, TaskStatus::Completed).await;
        assert_eq!(done.result, Some(json!({"x": 1})));
        assert_eq!(done.assigned_to.as_deref(), Some("node-a"));
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_task_type_fails_without_retry() {
        let manager = manager_with(TaskManagerConfig::default()).await;
        let task = manager
            .create_task(
                "mystery",
                json!({}),
                CreateTaskOptions {
                    assign_to: Some("node-a".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        let error = task.error.unwrap();
        assert_eq!(error.code, task_error_codes::NO_HANDLER);
        assert!(!error.retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_retry_until_max_retries() {
        let config = TaskManagerConfig {
            max_retries: 2,
            task_timeout_ms: 100,
            initial_retry_delay_ms: 50,
            max_retry_delay_ms: 1_000,
            ..Default::default()
        };
        let manager = manager_with(config).await;
        manager.register_task_handler(
            "slow",
            task_handler_fn(|_task: TaskInfo| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }),
        );
        let mut events = manager.events().subscribe();

        let task = manager
            .create_task("slow", json!({}), CreateTaskOptions::default())
            .await
            .unwrap();

        let mut delays = Vec::new();
        let final_task = loop {
            match events.recv().await.unwrap() {
                TaskEvent::RetryScheduled { delay, .. } => delays.push(delay),
                TaskEvent::Failed {
                    task,
                    will_retry: false,
                } => break task,
                _ => {}
            }
        };

        assert_eq!(final_task.task_id, task.task_id);
        assert_eq!(final_task.retry_count, 2);
        assert_eq!(
            final_task.error.map(|e| e.code),
            Some(task_error_codes::TIMEOUT.to_string())
        );
        assert_eq!(
            delays,
            vec![Duration::from_millis(50), Duration::from_millis(100)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_fails_task() {
        let manager = manager_with(TaskManagerConfig::default()).await;
        manager.register_task_handler(
            "boom",
            task_handler_fn(|_task: TaskInfo| async move {
                if true {
                    panic!("handler exploded");
                }
                Ok(Value::Null)
            }),
        );

        let task = manager
            .create_task("boom", json!({}), CreateTaskOptions::default())
            .await
            .unwrap();
        let failed = wait_for_status(&manager, &task.task_id, TaskStatus::Failed).await;
        let error = failed.error.unwrap();
        assert_eq!(error.code, task_error_codes::HANDLER_PANIC);
        assert!(error.message.contains("handler exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_drains_in_order_and_full_backlog_defers() {
        let config = TaskManagerConfig {
            max_concurrent_tasks: 1,
            backlog_capacity: 1,
            ..Default::default()
        };
        let manager = manager_with(config).await;
        manager.register_task_handler(
            "work",
            task_handler_fn(|_task: TaskInfo| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!("done"))
            }),
        );
        let unassigned = CreateTaskOptions::default();

        let first = manager.create_task("work", json!(1), unassigned.clone()).await.unwrap();
        let second = manager.create_task("work", json!(2), unassigned.clone()).await.unwrap();
        let third = manager.create_task("work", json!(3), unassigned).await.unwrap();

        assert_eq!(first.status, TaskStatus::InProgress);
        assert_eq!(second.status, TaskStatus::Pending);
        assert_eq!(manager.backlog_len(), 1);
        assert_eq!(third.status, TaskStatus::Pending);
        // one running plus one backlogged; the deferred task is not queued
        assert_eq!(manager.load_metrics().queue_length, 2);

        wait_for_status(&manager, &first.task_id, TaskStatus::Completed).await;
        wait_for_status(&manager, &second.task_id, TaskStatus::Completed).await;
        // deferred task was never admitted
        assert_eq!(
            manager.get_task(&third.task_id).unwrap().status,
            TaskStatus::Pending
        );
        assert_eq!(
            manager.process_task(&third.task_id).await.unwrap(),
            ProcessOutcome::Started
        );
        wait_for_status(&manager, &third.task_id, TaskStatus::Completed).await;

        let load = manager.load_metrics();
        assert_eq!(load.queue_length, 0);
        assert_eq!(load.task_completion_rate, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_assignment_is_accepted_and_reassignment_tracked() {
        let broker = InMemoryBroker::new();
        let manager = manager_on(&broker, TaskManagerConfig::default()).await;
        manager.register_task_handler(
            "echo",
            task_handler_fn(|task: TaskInfo| async move { Ok(task.parameters) }),
        );
        let peer = MessageTransport::new("node-b", broker.connector(), TransportConfig::default());
        peer.connect().await.unwrap();
        let mut events = manager.events().subscribe();

        let assign = |task: TaskInfo, assigned_to: &str| {
            Message::new(MessagePayload::TaskAssign(TaskAssignPayload {
                task,
                assigned_to: assigned_to.to_string(),
                reason: "ROUND_ROBIN".to_string(),
            }))
            .unwrap()
        };

        let task = TaskInfo::new("echo", json!({"n": 7}));
        peer.publish(subjects::TASK_ASSIGN, assign(task.clone(), "node-a"))
            .await
            .unwrap();

        let done = wait_for_status(&manager, &task.task_id, TaskStatus::Completed).await;
        assert_eq!(done.result, Some(json!({"n": 7})));
        assert_eq!(done.assigned_to.as_deref(), Some("node-a"));
        loop {
            if let TaskEvent::Assigned { task_id, service_id } = events.recv().await.unwrap() {
                assert_eq!(task_id, task.task_id);
                assert_eq!(service_id, "node-a");
                break;
            }
        }

        // an assignment elsewhere is not accepted
        let foreign = TaskInfo::new("echo", json!({}));
        peer.publish(subjects::TASK_ASSIGN, assign(foreign.clone(), "node-c"))
            .await
            .unwrap();
        // a known pending task follows its reassignment
        let pending = manager
            .create_task("unhandled", json!({}), CreateTaskOptions::default())
            .await
            .unwrap();
        peer.publish(subjects::TASK_ASSIGN, assign(pending.clone(), "node-c"))
            .await
            .unwrap();

        for _ in 0..100 {
            let followed = manager
                .get_task(&pending.task_id)
                .is_some_and(|t| t.assigned_to.as_deref() == Some("node-c"));
            if followed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            manager.get_task(&pending.task_id).unwrap().assigned_to.as_deref(),
            Some("node-c")
        );
        assert!(manager.get_task(&foreign.task_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_running_task_discards_result() {
        let manager = manager_with(TaskManagerConfig::default()).await;
        manager.register_task_handler(
            "long",
            task_handler_fn(|_task: TaskInfo| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!("late"))
            }),
        );
        let mut events = manager.events().subscribe();

        let task = manager
            .create_task("long", json!({}), CreateTaskOptions::default())
            .await
            .unwrap();
        manager
            .cancel_task(&task.task_id, Some("user request".into()))
            .await
            .unwrap();

        loop {
            if let TaskEvent::ResultDiscarded { task_id } = events.recv().await.unwrap() {
                assert_eq!(task_id, task.task_id);
                break;
            }
        }
        let cancelled = manager.get_task(&task.task_id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(cancelled.result, None);
        assert!(manager.complete_task(&task.task_id, json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_eviction() {
        let manager = manager_with(TaskManagerConfig::default()).await;
        let task = manager
            .create_task("unhandled", json!({}), CreateTaskOptions::default())
            .await
            .unwrap();
        // no local handler and no assignee: stays pending
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(manager.evict_finished_before(Utc::now()), 0);

        manager.cancel_task(&task.task_id, None).await.unwrap();
        assert_eq!(
            manager.evict_finished_before(Utc::now() + chrono::Duration::seconds(1)),
            1
        );
        assert!(manager.get_task(&task.task_id).is_none());
        assert!(manager.evict_task(&task.task_id).is_none());
    }
}

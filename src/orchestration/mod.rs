//! # Orchestration
//!
//! Task distribution: shared task types, retry backoff, service selection and
//! the per-node task lifecycle manager.

pub mod backoff;
pub mod load_balancer;
pub mod task_manager;
pub mod types;

pub use backoff::RetryPolicy;
pub use load_balancer::{
    consistent_hash_index, string_hash, LoadBalancer, LoadBalancingStrategy, SelectionOptions,
};
pub use task_manager::{
    task_handler_fn, ProcessOutcome, TaskEvent, TaskHandler, TaskManager,
};
pub use types::{
    CreateTaskOptions, ServiceLoadMetrics, TaskError, TaskInfo, TaskStatus, TaskStatusCounts,
    TaskUpdate,
};

// src/queue/mod.rs
//! Task queue port
//!
//! The engine only relies on blocking-pop/push/expire semantics; the store
//! behind them (Redis in production) stays an external collaborator. The
//! in-memory implementation backs tests and the single-process debug
//! runner.

pub mod memory;

pub use memory::InMemoryTaskQueue;

use crate::executor::Task;
use crate::utils::errors::Result;
use std::time::Duration;

/// Blocking-style access to the shared task queue
#[async_trait::async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task on a named channel
    async fn push_task(&self, channel: &str, task: Task) -> Result<()>;

    /// Pop the next task, waiting up to `timeout`; `None` on timeout
    async fn pop_task(&self, channel: &str, timeout: Duration) -> Result<Option<Task>>;

    /// Publish a task's result payload, expiring after `ttl` so unclaimed
    /// results do not accumulate
    async fn push_result(&self, task_id: &str, payload: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Claim a result by task id, waiting up to `timeout`
    async fn pop_result(&self, task_id: &str, timeout: Duration) -> Result<Option<Vec<u8>>>;
}

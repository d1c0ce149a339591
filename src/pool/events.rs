// src/pool/events.rs
//! Events and status reporting emitted by the broker

use crate::executor::{Task, TaskResult};
use crate::pool::worker::WorkerId;
use serde::Serialize;

/// Events published on the broker's event channel
#[derive(Debug)]
pub enum BrokerEvent {
    /// A worker finished a task; the dispatcher publishes the result
    TaskProcessed {
        worker_id: WorkerId,
        task: Task,
        result: TaskResult,
    },

    /// A worker was force-killed, with the diagnostic reason
    WorkerKilled { worker_id: WorkerId, reason: String },
}

/// Load classification of the pool, derived from `busy / concurrency_limit`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PoolStatus {
    Good,
    Warning,
    Critical,
}

impl PoolStatus {
    /// GOOD below 70%, WARNING from 70% to below 90%, CRITICAL at 90%+
    pub fn classify(busy: usize, concurrency_limit: usize) -> Self {
        if concurrency_limit == 0 {
            return PoolStatus::Critical;
        }
        let ratio = busy as f64 / concurrency_limit as f64;
        if ratio >= 0.9 {
            PoolStatus::Critical
        } else if ratio >= 0.7 {
            PoolStatus::Warning
        } else {
            PoolStatus::Good
        }
    }
}

/// Point-in-time view of pool occupancy, for logs and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub starting: usize,
    pub idle: usize,
    pub busy: usize,
    pub cached: usize,
    pub concurrency_limit: usize,
}

impl PoolSnapshot {
    pub fn live(&self) -> usize {
        self.starting + self.idle + self.busy + self.cached
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus::classify(self.busy, self.concurrency_limit)
    }
}

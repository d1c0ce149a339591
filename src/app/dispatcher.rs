// src/app/dispatcher.rs
//! Queue-to-pool dispatch
//!
//! Two loops wire the queue to the broker: the dispatch loop pops tasks
//! and hands each to an acquired worker; the result loop drains the
//! broker's event stream back into the queue's result store, under the
//! configured TTL so unclaimed results expire.

use crate::pool::{BrokerEvent, BrokerHandle};
use crate::queue::TaskQueue;
use crate::utils::config::QueueSettings;
use crate::utils::errors::{Result, RunnerError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct Dispatcher<Q: TaskQueue> {
    queue: Arc<Q>,
    broker: BrokerHandle,
    settings: QueueSettings,
}

impl<Q: TaskQueue + 'static> Dispatcher<Q> {
    pub fn new(queue: Arc<Q>, broker: BrokerHandle, settings: QueueSettings) -> Self {
        Self {
            queue,
            broker,
            settings,
        }
    }

    /// Pop tasks and dispatch them until the pool stops
    pub async fn run_dispatch_loop(&self) -> Result<()> {
        let pop_timeout = Duration::from_secs(self.settings.pop_timeout_secs);
        info!(channel = %self.settings.channel, "dispatcher started");

        loop {
            let task = match self.queue.pop_task(&self.settings.channel, pop_timeout).await {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(e) => {
                    // Queue connectivity loss heals on the backend's side;
                    // keep polling.
                    warn!("task pop failed: {}", e);
                    continue;
                }
            };
            debug!(task = %task.id, app = %task.application_id, "task dequeued");

            let worker = match self
                .broker
                .get_worker_for_task(&task.application_id, task.cacheable)
                .await
            {
                Ok(worker) => worker,
                Err(RunnerError::PoolStopped) => {
                    info!("pool stopped, dispatcher exiting");
                    return Ok(());
                }
                Err(e) => {
                    error!(task = %task.id, "no worker obtainable: {}", e);
                    continue;
                }
            };

            if let Err(e) = self.broker.process_task(worker, task).await {
                error!("dispatch failed: {}", e);
            }
        }
    }

    /// Drain broker events into the queue's result store
    pub async fn run_result_loop(&self, mut events: mpsc::UnboundedReceiver<BrokerEvent>) {
        let ttl = Duration::from_secs(self.settings.result_ttl_secs);
        while let Some(event) = events.recv().await {
            match event {
                BrokerEvent::TaskProcessed { task, result, .. } => {
                    let payload = match serde_json::to_vec(&result) {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!(task = %task.id, "result not serializable: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = self.queue.push_result(&task.id, payload, ttl).await {
                        error!(task = %task.id, "result publish failed: {}", e);
                    }
                }
                BrokerEvent::WorkerKilled { worker_id, reason } => {
                    // Kill reasons are operational diagnostics; the task's
                    // caller sees only an unclaimed result.
                    debug!(worker = %worker_id, reason, "worker removed");
                }
            }
        }
    }
}

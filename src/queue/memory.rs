// src/queue/memory.rs
//! In-memory task queue
//!
//! Channel queues live behind one mutex with a `Notify` for blocked
//! poppers; results live in a `DashMap` with per-entry deadlines, swept
//! lazily on access so no background task is needed.

use crate::executor::Task;
use crate::queue::TaskQueue;
use crate::utils::errors::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub struct InMemoryTaskQueue {
    channels: Mutex<HashMap<String, VecDeque<Task>>>,
    task_posted: Notify,
    results: DashMap<String, ExpiringPayload>,
    result_posted: Notify,
}

struct ExpiringPayload {
    payload: Vec<u8>,
    deadline: Instant,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            task_posted: Notify::new(),
            results: DashMap::new(),
            result_posted: Notify::new(),
        }
    }

    /// Drop results whose TTL has passed
    fn sweep_results(&self) {
        let now = Instant::now();
        self.results.retain(|_, entry| entry.deadline > now);
    }

    /// Queued task count on one channel, for tests and stats
    pub fn depth(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn push_task(&self, channel: &str, task: Task) -> Result<()> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push_back(task);
        self.task_posted.notify_waiters();
        Ok(())
    }

    async fn pop_task(&self, channel: &str, timeout: Duration) -> Result<Option<Task>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking, so a push between the
            // check and the await is not missed.
            let mut notified = std::pin::pin!(self.task_posted.notified());
            notified.as_mut().enable();
            if let Some(task) = self
                .channels
                .lock()
                .get_mut(channel)
                .and_then(VecDeque::pop_front)
            {
                return Ok(Some(task));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn push_result(&self, task_id: &str, payload: Vec<u8>, ttl: Duration) -> Result<()> {
        self.sweep_results();
        self.results.insert(
            task_id.to_string(),
            ExpiringPayload {
                payload,
                deadline: Instant::now() + ttl,
            },
        );
        self.result_posted.notify_waiters();
        Ok(())
    }

    async fn pop_result(&self, task_id: &str, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut notified = std::pin::pin!(self.result_posted.notified());
            notified.as_mut().enable();
            self.sweep_results();
            if let Some((_, entry)) = self.results.remove(task_id) {
                return Ok(Some(entry.payload));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskKind;
    use std::sync::Arc;

    fn task(id: &str) -> Task {
        Task {
            id: id.into(),
            application_id: "app".into(),
            relative_path: String::new(),
            timeout_ms: None,
            cacheable: false,
            arguments: Vec::new(),
            kind: TaskKind::ActionInvocation {
                action_type: "SHUTDOWN".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_push_pop_is_fifo() {
        let queue = InMemoryTaskQueue::new();
        queue.push_task("tasks", task("t-1")).await.unwrap();
        queue.push_task("tasks", task("t-2")).await.unwrap();

        let first = queue.pop_task("tasks", Duration::from_millis(10)).await.unwrap();
        let second = queue.pop_task("tasks", Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.unwrap().id, "t-1");
        assert_eq!(second.unwrap().id, "t-2");
        assert_eq!(queue.depth("tasks"), 0);
    }

    #[tokio::test]
    async fn test_pop_times_out_on_empty_channel() {
        let queue = InMemoryTaskQueue::new();
        let popped = queue.pop_task("tasks", Duration::from_millis(20)).await.unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_blocked_pop_wakes_on_push() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop_task("tasks", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push_task("tasks", task("t-1")).await.unwrap();

        let popped = popper.await.unwrap().unwrap();
        assert_eq!(popped.unwrap().id, "t-1");
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let queue = InMemoryTaskQueue::new();
        queue.push_task("a", task("t-a")).await.unwrap();

        assert!(queue
            .pop_task("b", Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            queue
                .pop_task("a", Duration::from_millis(10))
                .await
                .unwrap()
                .unwrap()
                .id,
            "t-a"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_expire_after_ttl() {
        let queue = InMemoryTaskQueue::new();
        queue
            .push_result("t-1", b"done".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        let claimed = queue
            .pop_result("t-1", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(claimed.is_none(), "expired result must not be claimable");
    }

    #[tokio::test]
    async fn test_result_claimed_once() {
        let queue = InMemoryTaskQueue::new();
        queue
            .push_result("t-1", b"done".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();

        let first = queue.pop_result("t-1", Duration::from_millis(10)).await.unwrap();
        let second = queue.pop_result("t-1", Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.unwrap(), b"done");
        assert!(second.is_none());
    }
}

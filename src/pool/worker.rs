// src/pool/worker.rs
//! Broker-side worker bookkeeping
//!
//! Every live worker process is represented by one [`WorkerState`] owned by
//! the broker loop. The state machine is
//! `starting -> idle <-> cached <-> busy -> (cached | killed)`; a worker is
//! a member of at most one place-list at a time, and relocation between
//! lists is driven exclusively by the broker so the invariant cannot be
//! violated from the outside.

use crate::executor::Task;
use crate::pool::protocol::{ParentFrame, WorkerFrame};
use crate::utils::errors::Result;
use std::fmt;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use ulid::Ulid;

/// Identity of one worker process, unique for the broker's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(Ulid);

impl WorkerId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Which place-list a worker currently belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPlace {
    /// Forked but has not signaled `started` yet
    Starting,
    /// Available for any tenant
    Idle,
    /// Retained with tenant affinity after a cacheable task
    Cached,
    /// Executing one task
    Busy,
}

/// Broker-side handle to the worker process transport.
///
/// Production wraps a spawned child process (stdin writer task + SIGKILL by
/// pid); tests substitute an in-process fake so pool logic runs without
/// forking.
pub trait WorkerLink: Send {
    /// Queue one frame for delivery to the worker
    fn send(&self, frame: ParentFrame) -> Result<()>;

    /// Force-terminate the worker process (SIGKILL-equivalent, never
    /// cooperative)
    fn kill(&self);

    /// OS pid when the link is backed by a real process
    fn pid(&self) -> Option<u32>;
}

/// Everything the broker tracks about one worker
pub struct WorkerState {
    pub id: WorkerId,
    pub link: Box<dyn WorkerLink>,
    pub place: WorkerPlace,

    /// Last heartbeat (or spawn) instant; the watchdog measures staleness
    /// against this
    pub heartbeat: Instant,

    /// Tenant affinity, set when the worker has run that tenant's code
    pub app_id: Option<String>,

    /// The task in flight while busy
    pub current_task: Option<Task>,

    /// Instant the in-flight task was handed over, for duration metrics
    pub dispatched_at: Option<Instant>,

    /// Timer that force-kills the process if a task overstays
    /// `timeout + teardown grace`; at most one is armed at a time
    pub expiration: Option<JoinHandle<()>>,

    /// Kill on the next non-busy relocation (critical error, tenant
    /// eviction)
    pub flagged_for_removal: bool,
}

impl WorkerState {
    pub fn new(id: WorkerId, link: Box<dyn WorkerLink>) -> Self {
        Self {
            id,
            link,
            place: WorkerPlace::Starting,
            heartbeat: Instant::now(),
            app_id: None,
            current_task: None,
            dispatched_at: None,
            expiration: None,
            flagged_for_removal: false,
        }
    }

    /// Cancel the armed expiration timer, if any
    pub fn disarm_expiration(&mut self) {
        if let Some(handle) = self.expiration.take() {
            handle.abort();
        }
    }

    /// Diagnostic reason used when the heartbeat watchdog reaps this worker
    pub fn stale_heartbeat_reason(&self, now: Instant) -> String {
        let elapsed = now.saturating_duration_since(self.heartbeat);
        let app = self.app_id.as_deref().unwrap_or("<none>");
        let task = self
            .current_task
            .as_ref()
            .map(|t| t.id.as_str())
            .unwrap_or("<none>");
        format!(
            "no heartbeat for {:.1}s (app {}, task {})",
            elapsed.as_secs_f64(),
            app,
            task
        )
    }
}

/// A message arriving at the broker from or about one worker
#[derive(Debug)]
pub enum WorkerSignal {
    /// A protocol frame read from the worker's stdout
    Frame(WorkerId, WorkerFrame),

    /// The worker process exited (for any reason, including our own kill)
    Exited(WorkerId),

    /// A task's outer expiration timer fired before the worker reported
    /// completion
    TaskExpired { worker: WorkerId, task_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NullLink;

    impl WorkerLink for NullLink {
        fn send(&self, _frame: ParentFrame) -> Result<()> {
            Ok(())
        }
        fn kill(&self) {}
        fn pid(&self) -> Option<u32> {
            None
        }
    }

    #[test]
    fn test_new_worker_is_starting() {
        let state = WorkerState::new(WorkerId::generate(), Box::new(NullLink));
        assert_eq!(state.place, WorkerPlace::Starting);
        assert!(state.app_id.is_none());
        assert!(!state.flagged_for_removal);
    }

    #[test]
    fn test_stale_reason_contains_diagnostics() {
        let mut state = WorkerState::new(WorkerId::generate(), Box::new(NullLink));
        state.app_id = Some("tenant-1".into());
        let later = state.heartbeat + Duration::from_secs(45);
        let reason = state.stale_heartbeat_reason(later);
        assert!(reason.contains("45.0s"), "reason was: {}", reason);
        assert!(reason.contains("tenant-1"));
    }

    #[tokio::test]
    async fn test_disarm_expiration_aborts_the_timer() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);

        let mut state = WorkerState::new(WorkerId::generate(), Box::new(NullLink));
        state.expiration = Some(tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            FIRED.fetch_add(1, Ordering::SeqCst);
        }));
        state.disarm_expiration();
        assert!(state.expiration.is_none());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_worker_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..64).map(|_| WorkerId::generate()).collect();
        assert_eq!(ids.len(), 64);
    }
}

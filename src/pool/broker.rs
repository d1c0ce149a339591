// src/pool/broker.rs
//! The worker pool broker
//!
//! One actor task owns every piece of pool state: the worker table, the
//! three place-lists, the waiter queue, and all watchdog timers. The public
//! API ([`BrokerHandle`]) talks to it over a command channel with oneshot
//! replies, so no lock ever guards pool state and the place-list invariant
//! (one list per worker) holds by construction.
//!
//! Selection policy:
//! - cached worker with matching tenant affinity first (no cold start),
//! - then the most recently released idle worker (stack discipline keeps a
//!   hot process warm),
//! - then, with the pool at capacity and the cache non-empty, the least
//!   recently cached worker is evicted to make room,
//! - then a fresh worker is started, bounded by the concurrency limit.
//!
//! A request that cannot be satisfied immediately waits; it fails only if
//! worker start itself fails or the pool is stopping.

use crate::executor::Task;
use crate::pool::events::{BrokerEvent, PoolSnapshot, PoolStatus};
use crate::pool::launcher::WorkerLauncher;
use crate::pool::protocol::{ParentFrame, WorkerFrame};
use crate::pool::worker::{WorkerId, WorkerPlace, WorkerSignal, WorkerState};
use crate::utils::config::BrokerSettings;
use crate::utils::errors::{Result, RunnerError};
use metrics::{counter, gauge, histogram};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Public handle to the broker actor
#[derive(Clone)]
pub struct BrokerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl BrokerHandle {
    /// Obtain a worker for a task addressed at `app_id`.
    ///
    /// Waits as long as it takes to reuse, free up, or start a worker;
    /// returns an error only when the pool is stopping or a worker could
    /// not be spawned.
    pub async fn get_worker_for_task(&self, app_id: &str, cacheable: bool) -> Result<WorkerId> {
        let (reply, response) = oneshot::channel();
        self.send(Command::GetWorker {
            app_id: app_id.to_string(),
            cacheable,
            reply,
        })?;
        response.await.map_err(|_| RunnerError::PoolStopped)?
    }

    /// Hand a task to a previously acquired worker
    pub async fn process_task(&self, worker_id: WorkerId, task: Task) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::ProcessTask {
            worker_id,
            task,
            reply,
        })?;
        response.await.map_err(|_| RunnerError::PoolStopped)?
    }

    /// Evict every worker affiliated with a tenant. Busy workers are
    /// flagged and killed once their in-flight task completes.
    pub fn kill_workers_for_app(&self, app_id: &str, reason: &str) -> Result<()> {
        self.send(Command::KillAppWorkers {
            app_id: app_id.to_string(),
            reason: reason.to_string(),
        })
    }

    /// Current occupancy of the place-lists
    pub async fn snapshot(&self) -> Result<PoolSnapshot> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        response.await.map_err(|_| RunnerError::PoolStopped)
    }

    /// Stop accepting work, wait for every busy worker to finish, then
    /// cancel the watchdogs. Idle and cached workers are left alive.
    pub async fn stop(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Stop { reply })?;
        response.await.map_err(|_| RunnerError::PoolStopped)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| RunnerError::PoolStopped)
    }
}

/// Start the broker actor; returns its handle and the event stream
pub fn spawn_broker(
    settings: BrokerSettings,
    launcher: Arc<dyn WorkerLauncher>,
) -> (BrokerHandle, mpsc::UnboundedReceiver<BrokerEvent>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let broker = Broker::new(settings, launcher, event_tx);
    tokio::spawn(broker.run(command_rx));
    (BrokerHandle { commands: command_tx }, event_rx)
}

enum Command {
    GetWorker {
        app_id: String,
        cacheable: bool,
        reply: oneshot::Sender<Result<WorkerId>>,
    },
    ProcessTask {
        worker_id: WorkerId,
        task: Task,
        reply: oneshot::Sender<Result<()>>,
    },
    KillAppWorkers {
        app_id: String,
        reason: String,
    },
    Snapshot {
        reply: oneshot::Sender<PoolSnapshot>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// An unsatisfied `get_worker_for_task` call
struct Waiter {
    app_id: String,
    cacheable: bool,
    reply: oneshot::Sender<Result<WorkerId>>,
}

struct Broker {
    settings: BrokerSettings,
    launcher: Arc<dyn WorkerLauncher>,

    workers: HashMap<WorkerId, WorkerState>,
    /// Stack: most recently released on top
    idle: Vec<WorkerId>,
    busy: Vec<WorkerId>,
    /// Front = most recently cached; evictions take the back
    cached: VecDeque<WorkerId>,
    starting: usize,

    waiters: VecDeque<Waiter>,

    signal_tx: mpsc::UnboundedSender<WorkerSignal>,
    signal_rx: mpsc::UnboundedReceiver<WorkerSignal>,
    events: mpsc::UnboundedSender<BrokerEvent>,

    stopping: bool,
    stop_reply: Option<oneshot::Sender<()>>,
    non_good_since: Option<Instant>,
}

impl Broker {
    fn new(
        settings: BrokerSettings,
        launcher: Arc<dyn WorkerLauncher>,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            launcher,
            workers: HashMap::new(),
            idle: Vec::new(),
            busy: Vec::new(),
            cached: VecDeque::new(),
            starting: 0,
            waiters: VecDeque::new(),
            signal_tx,
            signal_rx,
            events,
            stopping: false,
            stop_reply: None,
            non_good_since: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut heartbeat_tick =
            tokio::time::interval(Duration::from_secs(self.settings.heartbeat_timeout_secs));
        let mut status_tick =
            tokio::time::interval(Duration::from_secs(self.settings.status_period_secs));
        let mut stop_poll =
            tokio::time::interval(Duration::from_millis(self.settings.stop_poll_interval_ms));
        heartbeat_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick completes immediately; swallow it so the
        // watchdogs measure a full period before acting.
        heartbeat_tick.tick().await;
        status_tick.tick().await;

        info!(
            concurrency_limit = self.settings.concurrency_limit,
            cache_limit = self.settings.cache_limit,
            min_idle = self.settings.min_idle,
            "worker pool broker started"
        );
        self.maintain_min_idle();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(signal) = self.signal_rx.recv() => self.handle_signal(signal),
                _ = heartbeat_tick.tick() => self.heartbeat_watchdog(),
                _ = status_tick.tick() => self.status_watchdog(),
                _ = stop_poll.tick(), if self.stopping => {}
            }

            if self.stopping && self.busy.is_empty() {
                if let Some(reply) = self.stop_reply.take() {
                    let _ = reply.send(());
                }
                info!("worker pool broker stopped");
                return;
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::GetWorker {
                app_id,
                cacheable,
                reply,
            } => {
                if self.stopping {
                    let _ = reply.send(Err(RunnerError::PoolStopped));
                    return;
                }
                if let Some(id) = self.try_acquire(&app_id, cacheable) {
                    let _ = reply.send(Ok(id));
                    self.maintain_min_idle();
                    return;
                }
                self.make_room();
                self.waiters.push_back(Waiter {
                    app_id,
                    cacheable,
                    reply,
                });
                self.start_workers_for_demand();
            }

            Command::ProcessTask {
                worker_id,
                task,
                reply,
            } => {
                let _ = reply.send(self.dispatch(worker_id, task));
            }

            Command::KillAppWorkers { app_id, reason } => {
                self.kill_app_workers(&app_id, &reason);
            }

            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }

            Command::Stop { reply } => {
                info!(busy = self.busy.len(), "broker stopping, draining busy workers");
                self.stopping = true;
                self.stop_reply = Some(reply);
                while let Some(waiter) = self.waiters.pop_front() {
                    let _ = waiter.reply.send(Err(RunnerError::PoolStopped));
                }
            }
        }
    }

    // ----- acquisition -----

    /// Cached tenant affinity first, then the idle stack.
    ///
    /// A non-cacheable request skips the cached place: the worker would be
    /// killed after the task, destroying a warm cache entry for nothing.
    fn try_acquire(&mut self, app_id: &str, cacheable: bool) -> Option<WorkerId> {
        if cacheable && self.settings.cache_limit > 0 {
            if let Some(pos) = self
                .cached
                .iter()
                .position(|id| self.workers[id].app_id.as_deref() == Some(app_id))
            {
                if let Some(id) = self.cached.remove(pos) {
                    debug!(worker = %id, app_id, "reusing cached worker");
                    return Some(self.detach(id));
                }
            }
        }
        if let Some(id) = self.idle.pop() {
            return Some(self.detach(id));
        }
        None
    }

    /// With the pool at capacity, evict the least recently cached worker so
    /// a fresh one can start
    fn make_room(&mut self) {
        if self.live() + self.starting >= self.settings.concurrency_limit {
            if let Some(id) = self.cached.pop_back() {
                self.kill_worker(id, "evicted from cache to make room");
            }
        }
    }

    /// Start workers while there is both demand (waiters beyond the idle
    /// and starting supply) and capacity
    fn start_workers_for_demand(&mut self) {
        let supply = self.idle.len() + self.starting;
        let demand = self.waiters.len().saturating_sub(supply);
        for _ in 0..demand {
            if self.live() + self.starting >= self.settings.concurrency_limit {
                break;
            }
            self.start_worker();
        }
    }

    fn start_worker(&mut self) {
        let id = WorkerId::generate();
        match self.launcher.spawn(id, self.signal_tx.clone()) {
            Ok(link) => {
                self.workers.insert(id, WorkerState::new(id, link));
                self.starting += 1;
                counter!("servercode_workers_spawned_total").increment(1);
                debug!(worker = %id, "worker starting");
            }
            Err(e) => {
                error!("worker start failed: {}", e);
                if let Some(waiter) = self.waiters.pop_front() {
                    let _ = waiter
                        .reply
                        .send(Err(RunnerError::ProcessSpawnFailed(e.to_string())));
                }
            }
        }
        self.update_gauges();
    }

    // ----- dispatch -----

    fn dispatch(&mut self, worker_id: WorkerId, task: Task) -> Result<()> {
        let teardown_grace = Duration::from_millis(self.settings.teardown_grace_ms);
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return Err(RunnerError::Protocol(format!(
                "{} is not a live worker",
                worker_id
            )));
        };

        if let Some(timeout) = task.timeout() {
            let signal_tx = self.signal_tx.clone();
            let task_id = task.id.clone();
            worker.expiration = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout + teardown_grace).await;
                let _ = signal_tx.send(WorkerSignal::TaskExpired {
                    worker: worker_id,
                    task_id,
                });
            }));
        }

        worker.app_id = Some(task.application_id.clone());
        worker.current_task = Some(task.clone());
        worker.dispatched_at = Some(Instant::now());
        worker.place = WorkerPlace::Busy;
        self.busy.push(worker_id);
        self.update_gauges();

        self.workers[&worker_id].link.send(ParentFrame::Task { task })
    }

    // ----- worker signals -----

    fn handle_signal(&mut self, signal: WorkerSignal) {
        match signal {
            WorkerSignal::Frame(id, frame) => self.handle_frame(id, frame),
            WorkerSignal::Exited(id) => self.handle_exit(id),
            WorkerSignal::TaskExpired { worker, task_id } => self.handle_expiry(worker, task_id),
        }
    }

    fn handle_frame(&mut self, id: WorkerId, frame: WorkerFrame) {
        let Some(worker) = self.workers.get_mut(&id) else {
            // Frames can trail a kill; nothing to do.
            return;
        };
        worker.heartbeat = Instant::now();

        match frame {
            WorkerFrame::Started => {
                if worker.place == WorkerPlace::Starting {
                    self.starting = self.starting.saturating_sub(1);
                    debug!(worker = %id, "worker ready");
                    self.release(id);
                }
            }

            WorkerFrame::Heartbeat => {}

            WorkerFrame::Idling => {
                worker.disarm_expiration();
                worker.current_task = None;
                worker.dispatched_at = None;
                if worker.place == WorkerPlace::Busy {
                    self.remove_from_place(id);
                }
                self.release(id);
            }

            WorkerFrame::Processed {
                task_id,
                task_result,
            } => {
                worker.disarm_expiration();
                let task = worker.current_task.take();
                let dispatched_at = worker.dispatched_at.take();
                self.remove_from_place(id);

                match task {
                    Some(task) if task.id == task_id => {
                        counter!("servercode_tasks_processed_total").increment(1);
                        if let Some(started) = dispatched_at {
                            histogram!("servercode_task_duration_seconds")
                                .record(started.elapsed().as_secs_f64());
                        }
                        if task_result.is_exception() {
                            counter!("servercode_task_failures_total").increment(1);
                        }
                        let cacheable = task.cacheable;
                        let _ = self.events.send(BrokerEvent::TaskProcessed {
                            worker_id: id,
                            task,
                            result: task_result,
                        });
                        if cacheable {
                            self.release(id);
                        } else {
                            self.kill_worker(id, "released after non-cacheable task");
                            self.replenish();
                        }
                    }
                    other => {
                        warn!(
                            worker = %id,
                            task_id,
                            expected = ?other.map(|t| t.id),
                            "result for a task the worker was not assigned"
                        );
                        self.kill_worker(id, "worker protocol out of sync");
                        self.replenish();
                    }
                }
            }

            WorkerFrame::CriticalError { message } => {
                warn!(worker = %id, "worker reported critical error: {}", message);
                worker.flagged_for_removal = true;
            }
        }
    }

    /// Relocate a no-longer-busy worker: kill when flagged, cache when it
    /// has tenant affinity, otherwise return it to the idle stack
    fn release(&mut self, id: WorkerId) {
        let Some(worker) = self.workers.get_mut(&id) else {
            return;
        };
        if worker.flagged_for_removal {
            self.kill_worker(id, "flagged for removal");
            self.replenish();
            return;
        }

        if worker.app_id.is_some() && self.settings.cache_limit > 0 {
            worker.place = WorkerPlace::Cached;
            self.cached.push_front(id);
            while self.cached.len() > self.settings.cache_limit {
                if let Some(evicted) = self.cached.pop_back() {
                    self.kill_worker(evicted, "cache full");
                }
            }
        } else {
            worker.place = WorkerPlace::Idle;
            worker.app_id = None;
            self.idle.push(id);
        }

        self.satisfy_waiters();
        self.maintain_min_idle();
        self.update_gauges();
    }

    fn handle_exit(&mut self, id: WorkerId) {
        let Some(worker) = self.workers.get_mut(&id) else {
            // Exit after an explicit kill already removed the state.
            return;
        };
        worker.disarm_expiration();
        let place = worker.place;
        warn!(worker = %id, ?place, "worker process exited unexpectedly");
        if place == WorkerPlace::Starting {
            self.starting = self.starting.saturating_sub(1);
        }
        self.remove_from_place(id);
        self.workers.remove(&id);
        self.replenish();
        self.update_gauges();
    }

    fn handle_expiry(&mut self, id: WorkerId, task_id: String) {
        let still_running = self
            .workers
            .get(&id)
            .and_then(|w| w.current_task.as_ref())
            .map(|t| t.id == task_id)
            .unwrap_or(false);
        if still_running {
            self.kill_worker(id, &format!("task {} exceeded timeout + grace", task_id));
            self.replenish();
        }
    }

    // ----- watchdogs & maintenance -----

    fn heartbeat_watchdog(&mut self) {
        let now = Instant::now();
        let timeout = Duration::from_secs(self.settings.heartbeat_timeout_secs);
        let stale: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| now.saturating_duration_since(w.heartbeat) > timeout)
            .map(|w| w.id)
            .collect();

        for id in stale {
            let reason = self.workers[&id].stale_heartbeat_reason(now);
            if self.workers[&id].place == WorkerPlace::Starting {
                self.starting = self.starting.saturating_sub(1);
            }
            self.kill_worker(id, &reason);
        }
        self.replenish();
    }

    fn status_watchdog(&mut self) {
        let status = PoolStatus::classify(self.busy.len(), self.settings.concurrency_limit);
        let load = self.busy.len() as f64 / self.settings.concurrency_limit as f64 * 100.0;
        gauge!("servercode_pool_load_percent").set(load);

        if status == PoolStatus::Good {
            self.non_good_since = None;
            return;
        }
        let since = *self.non_good_since.get_or_insert_with(Instant::now);
        let grace = Duration::from_secs(self.settings.status_grace_secs);
        if since.elapsed() >= grace {
            warn!(
                ?status,
                load_percent = load,
                busy = self.busy.len(),
                limit = self.settings.concurrency_limit,
                "pool load sustained above GOOD"
            );
        }
    }

    /// Keep at least `min_idle` workers warm (bounded by the concurrency
    /// limit), counting ones already on their way up
    fn maintain_min_idle(&mut self) {
        if self.stopping {
            return;
        }
        let target = self.settings.min_idle.min(self.settings.concurrency_limit);
        let deficit = target.saturating_sub(self.idle.len() + self.starting);
        for _ in 0..deficit {
            if self.live() + self.starting >= self.settings.concurrency_limit {
                break;
            }
            self.start_worker();
        }
    }

    /// Re-evaluate demand after a kill or exit freed capacity: hand any
    /// reusable worker to a queued waiter, start fresh workers for the
    /// waiters that remain, and restore the warm-idle floor
    fn replenish(&mut self) {
        if self.stopping {
            return;
        }
        self.satisfy_waiters();
        self.start_workers_for_demand();
        self.maintain_min_idle();
    }

    fn satisfy_waiters(&mut self) {
        while let Some(waiter) = self.waiters.front() {
            let app_id = waiter.app_id.clone();
            let cacheable = waiter.cacheable;
            match self.try_acquire(&app_id, cacheable) {
                Some(id) => {
                    if let Some(waiter) = self.waiters.pop_front() {
                        let _ = waiter.reply.send(Ok(id));
                    }
                }
                None => break,
            }
        }
    }

    fn kill_app_workers(&mut self, app_id: &str, reason: &str) {
        let affected: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| w.app_id.as_deref() == Some(app_id))
            .map(|w| w.id)
            .collect();
        info!(app_id, count = affected.len(), reason, "evicting tenant workers");

        for id in affected {
            match self.workers.get_mut(&id) {
                // Killing mid-flight would corrupt the in-flight result.
                Some(worker) if worker.place == WorkerPlace::Busy => {
                    worker.flagged_for_removal = true;
                }
                _ => self.kill_worker(id, reason),
            }
        }
        self.replenish();
    }

    // ----- primitives -----

    /// Remove a worker from whichever place-list holds it
    fn remove_from_place(&mut self, id: WorkerId) {
        self.idle.retain(|w| *w != id);
        self.busy.retain(|w| *w != id);
        self.cached.retain(|w| *w != id);
    }

    /// Take a worker out of its list without changing liveness
    fn detach(&mut self, id: WorkerId) -> WorkerId {
        self.remove_from_place(id);
        id
    }

    fn kill_worker(&mut self, id: WorkerId, reason: &str) {
        let Some(mut worker) = self.workers.remove(&id) else {
            return;
        };
        worker.disarm_expiration();
        self.remove_from_place(id);
        info!(worker = %id, reason, "killing worker");
        worker.link.kill();
        counter!("servercode_workers_killed_total").increment(1);
        let _ = self.events.send(BrokerEvent::WorkerKilled {
            worker_id: id,
            reason: reason.to_string(),
        });
        self.update_gauges();
    }

    fn live(&self) -> usize {
        self.workers.len()
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            starting: self.starting,
            idle: self.idle.len(),
            busy: self.busy.len(),
            cached: self.cached.len(),
            concurrency_limit: self.settings.concurrency_limit,
        }
    }

    fn update_gauges(&self) {
        gauge!("servercode_pool_busy").set(self.busy.len() as f64);
        gauge!("servercode_pool_idle").set(self.idle.len() as f64);
        gauge!("servercode_pool_cached").set(self.cached.len() as f64);
        gauge!("servercode_pool_starting").set(self.starting as f64);
    }
}

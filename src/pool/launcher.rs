// src/pool/launcher.rs
//! Worker process launching
//!
//! The production launcher re-executes the engine's own binary with the
//! `worker` role, pipes stdin/stdout for the frame protocol, and leaves
//! stderr inherited so worker logs land next to broker logs. Broker-side
//! the child is reduced to a [`WorkerLink`]: a frame sender backed by a
//! writer task draining to the child's stdin, plus a SIGKILL by pid.

use crate::pool::protocol::{decode_frame, encode_frame, ParentFrame};
use crate::pool::worker::{WorkerId, WorkerLink, WorkerSignal};
use crate::utils::errors::{Result, RunnerError};
use futures::StreamExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

/// Spawns worker processes and wires their transports back to the broker.
///
/// Synchronous on purpose: `tokio::process::Command::spawn` does not await,
/// and a sync trait stays object-safe for the broker's `Arc<dyn _>` field.
pub trait WorkerLauncher: Send + Sync {
    /// Start one worker. Frames and the exit notification for the new
    /// worker are delivered through `signals`.
    fn spawn(
        &self,
        id: WorkerId,
        signals: mpsc::UnboundedSender<WorkerSignal>,
    ) -> Result<Box<dyn WorkerLink>>;
}

/// Launches real OS worker processes
pub struct ProcessLauncher {
    /// Path of the worker executable; the broker's own binary when `None`
    exec_path: Option<String>,
}

impl ProcessLauncher {
    pub fn new(exec_path: Option<String>) -> Self {
        Self { exec_path }
    }

    fn executable(&self) -> Result<std::path::PathBuf> {
        match &self.exec_path {
            Some(path) => Ok(path.into()),
            None => std::env::current_exe()
                .map_err(|e| RunnerError::ProcessSpawnFailed(format!("current_exe: {}", e))),
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn spawn(
        &self,
        id: WorkerId,
        signals: mpsc::UnboundedSender<WorkerSignal>,
    ) -> Result<Box<dyn WorkerLink>> {
        let executable = self.executable()?;
        debug!(worker = %id, ?executable, "spawning worker process");

        let mut child = Command::new(executable)
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::ProcessSpawnFailed(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| RunnerError::ProcessSpawnFailed("child has no pid".into()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::ProcessSpawnFailed("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::ProcessSpawnFailed("failed to capture stdout".into()))?;

        // Writer task: drain outbound frames to the child's stdin
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ParentFrame>();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let line = match encode_frame(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(worker = %id, "failed to encode frame: {}", e);
                        continue;
                    }
                };
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
        });

        // Reader task: forward inbound frames, then the exit notification
        let reader_signals = signals.clone();
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stdout, LinesCodec::new());
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(worker = %id, "stdout read failed: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match decode_frame(&line) {
                    Ok(frame) => {
                        if reader_signals.send(WorkerSignal::Frame(id, frame)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(worker = %id, "{}", e),
                }
            }
            match child.wait().await {
                Ok(status) => debug!(worker = %id, %status, "worker process exited"),
                Err(e) => warn!(worker = %id, "wait failed: {}", e),
            }
            let _ = reader_signals.send(WorkerSignal::Exited(id));
        });

        Ok(Box::new(ProcessLink {
            id,
            pid,
            frames: frame_tx,
            killed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// Transport handle for a spawned worker process
struct ProcessLink {
    id: WorkerId,
    pid: u32,
    frames: mpsc::UnboundedSender<ParentFrame>,
    killed: Arc<AtomicBool>,
}

impl WorkerLink for ProcessLink {
    fn send(&self, frame: ParentFrame) -> Result<()> {
        self.frames
            .send(frame)
            .map_err(|_| RunnerError::Protocol(format!("{} transport closed", self.id)))
    }

    fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Tenant code is untrusted and may not yield; never wait for a
        // cooperative exit.
        if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            warn!(worker = %self.id, pid = self.pid, "SIGKILL failed: {}", e);
        }
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}

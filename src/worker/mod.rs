// src/worker/mod.rs
//! Worker process bootstrap
//!
//! The broker re-executes its own binary with the `worker` role; this is
//! that role's entry point. Stdout carries protocol frames exclusively
//! (logs go to stderr), stdin delivers task assignments, and a heartbeat
//! frame goes out on a fixed period so the broker's watchdog can tell a
//! stuck worker from a busy one. Task execution runs concurrently with the
//! frame loop: a task may legitimately take longer than the heartbeat
//! period, and its heartbeats must keep flowing the whole time.

pub mod session;

pub use session::WorkerSession;

use crate::executor::Control;
use crate::model::CodeRepository;
use crate::pool::protocol::{decode_frame, encode_frame, ParentFrame, WorkerFrame};
use crate::sandbox;
use crate::utils::config::RunnerConfig;
use crate::utils::errors::{Result, RunnerError};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{info, warn};

/// Run the worker frame loop until shutdown or broker disconnect
pub async fn run_worker(config: RunnerConfig, repository: Arc<dyn CodeRepository>) -> Result<()> {
    sandbox::bind_death_signal();

    let session = Arc::new(WorkerSession::new(repository, config.worker.clone()));
    let heartbeat_period = Duration::from_secs(config.worker.heartbeat_period_secs);
    run_frame_loop(
        session,
        tokio::io::stdin(),
        tokio::io::stdout(),
        heartbeat_period,
    )
    .await
}

type InFlight = JoinHandle<(WorkerFrame, Control)>;

async fn run_frame_loop<R, W>(
    session: Arc<WorkerSession>,
    reader: R,
    mut writer: W,
    heartbeat_period: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedRead::new(reader, LinesCodec::new());
    let mut heartbeat = tokio::time::interval(heartbeat_period);
    let mut in_flight: Option<InFlight> = None;

    write_frame(&mut writer, &WorkerFrame::Started).await?;
    info!(pid = std::process::id(), "worker ready");

    loop {
        tokio::select! {
            line = frames.next() => {
                let Some(line) = line else {
                    info!("broker closed the pipe, exiting");
                    return Ok(());
                };
                let line = line.map_err(|e| {
                    RunnerError::Protocol(format!("stdin read: {}", e))
                })?;
                if line.trim().is_empty() {
                    continue;
                }
                match decode_frame::<ParentFrame>(&line) {
                    Ok(ParentFrame::Task { task }) => {
                        if in_flight.is_some() {
                            warn!(task = %task.id, "task assigned while one is already running");
                            let message =
                                format!("task {} assigned while another is in flight", task.id);
                            write_frame(&mut writer, &WorkerFrame::CriticalError { message })
                                .await?;
                            continue;
                        }
                        let session = session.clone();
                        in_flight =
                            Some(tokio::spawn(async move { session.handle_task(task).await }));
                    }
                    Err(e) => {
                        warn!("{}", e);
                        write_frame(
                            &mut writer,
                            &WorkerFrame::CriticalError { message: e.to_string() },
                        )
                        .await?;
                    }
                }
            }

            outcome = finished(&mut in_flight), if in_flight.is_some() => {
                in_flight = None;
                let (reply, control) = outcome.map_err(|e| {
                    RunnerError::Protocol(format!("task runner failed: {}", e))
                })?;
                write_frame(&mut writer, &reply).await?;
                if control == Control::Shutdown {
                    info!("worker shutting down");
                    return Ok(());
                }
            }

            _ = heartbeat.tick() => {
                write_frame(&mut writer, &WorkerFrame::Heartbeat).await?;
            }
        }
    }
}

async fn finished(
    slot: &mut Option<InFlight>,
) -> std::result::Result<(WorkerFrame, Control), tokio::task::JoinError> {
    match slot {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &WorkerFrame) -> Result<()> {
    let line = encode_frame(frame)?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Task, TaskKind};
    use crate::model::{SourceModule, StaticCodeRepository};
    use crate::utils::config::WorkerSettings;
    use serde_json::json;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex;

    /// Session whose only handler parks on a channel until the test
    /// releases it
    fn blocking_session(release: std_mpsc::Receiver<()>) -> Arc<WorkerSession> {
        let release = Arc::new(Mutex::new(release));
        let repo = StaticCodeRepository::new();
        repo.register_app(
            "app",
            vec![SourceModule::new("handlers.rs", move |code| {
                let release = release.clone();
                code.add_handler("beforeCreate", Some("Order"), move |_ctx| {
                    let _ = release.lock().unwrap().recv();
                    Ok(None)
                })?;
                Ok(())
            })],
        );
        Arc::new(WorkerSession::new(Arc::new(repo), WorkerSettings::default()))
    }

    fn slow_task(id: &str) -> Task {
        Task {
            id: id.into(),
            application_id: "app".into(),
            relative_path: String::new(),
            timeout_ms: Some(30_000),
            cacheable: true,
            arguments: serde_json::to_vec(&json!([{}, {}])).unwrap(),
            kind: TaskKind::MethodInvocation {
                event_id: 1,
                target: Some("Order".into()),
            },
        }
    }

    async fn next_frame<R: AsyncRead + Unpin>(
        frames: &mut FramedRead<R, LinesCodec>,
    ) -> WorkerFrame {
        let line = tokio::time::timeout(Duration::from_secs(5), frames.next())
            .await
            .expect("worker went silent")
            .expect("pipe closed")
            .unwrap();
        decode_frame::<WorkerFrame>(&line).unwrap()
    }

    async fn send_task<W: AsyncWrite + Unpin>(writer: &mut W, task: Task) {
        let line = encode_frame(&ParentFrame::Task { task }).unwrap();
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
        writer.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeats_flow_while_a_task_runs() {
        let (release_tx, release_rx) = std_mpsc::channel();
        let session = blocking_session(release_rx);

        let (broker_side, worker_side) = tokio::io::duplex(4096);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let (broker_read, mut broker_write) = tokio::io::split(broker_side);

        let frame_loop = tokio::spawn(run_frame_loop(
            session,
            worker_read,
            worker_write,
            Duration::from_millis(20),
        ));

        let mut frames = FramedRead::new(broker_read, LinesCodec::new());
        assert!(matches!(next_frame(&mut frames).await, WorkerFrame::Started));

        send_task(&mut broker_write, slow_task("t-slow")).await;

        // The handler is parked; heartbeats must keep arriving while the
        // task is in flight.
        let mut heartbeats = 0;
        while heartbeats < 3 {
            match next_frame(&mut frames).await {
                WorkerFrame::Heartbeat => heartbeats += 1,
                WorkerFrame::Processed { .. } => panic!("task finished while still parked"),
                other => panic!("unexpected frame: {:?}", other),
            }
        }

        release_tx.send(()).unwrap();
        loop {
            match next_frame(&mut frames).await {
                WorkerFrame::Processed {
                    task_id,
                    task_result,
                } => {
                    assert_eq!(task_id, "t-slow");
                    assert!(!task_result.is_exception());
                    break;
                }
                WorkerFrame::Heartbeat => {}
                other => panic!("unexpected frame: {:?}", other),
            }
        }

        frame_loop.abort();
    }

    #[tokio::test]
    async fn test_second_assignment_while_busy_is_refused() {
        let (release_tx, release_rx) = std_mpsc::channel();
        let session = blocking_session(release_rx);

        let (broker_side, worker_side) = tokio::io::duplex(4096);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let (broker_read, mut broker_write) = tokio::io::split(broker_side);

        let frame_loop = tokio::spawn(run_frame_loop(
            session,
            worker_read,
            worker_write,
            Duration::from_secs(60),
        ));

        let mut frames = FramedRead::new(broker_read, LinesCodec::new());
        assert!(matches!(next_frame(&mut frames).await, WorkerFrame::Started));

        send_task(&mut broker_write, slow_task("t-1")).await;
        send_task(&mut broker_write, slow_task("t-2")).await;

        loop {
            match next_frame(&mut frames).await {
                WorkerFrame::CriticalError { message } => {
                    assert!(message.contains("t-2"));
                    break;
                }
                WorkerFrame::Heartbeat => {}
                other => panic!("unexpected frame: {:?}", other),
            }
        }

        // The in-flight task is unaffected by the refused assignment.
        release_tx.send(()).unwrap();
        loop {
            match next_frame(&mut frames).await {
                WorkerFrame::Processed { task_id, .. } => {
                    assert_eq!(task_id, "t-1");
                    break;
                }
                WorkerFrame::Heartbeat => {}
                other => panic!("unexpected frame: {:?}", other),
            }
        }

        frame_loop.abort();
    }
}

// src/main.rs
//! Engine entry point
//!
//! One binary, two roles: invoked plain it runs the broker/dispatcher
//! daemon; invoked as `servercode-engine worker` it runs the worker
//! process bootstrap. The broker launches workers by re-executing its own
//! binary.

use anyhow::Result;
use servercode_engine::app::Dispatcher;
use servercode_engine::model::StaticCodeRepository;
use servercode_engine::observability::{init_metrics, init_tracing};
use servercode_engine::pool::{spawn_broker, ProcessLauncher};
use servercode_engine::queue::InMemoryTaskQueue;
use servercode_engine::utils::config::RunnerConfig;
use servercode_engine::worker::run_worker;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let config = RunnerConfig::load()?;
    let worker_role = std::env::args().nth(1).as_deref() == Some("worker");

    if worker_role {
        // Worker role: stdout belongs to the frame protocol from here on.
        let repository = Arc::new(StaticCodeRepository::new());
        run_worker(config, repository).await?;
        return Ok(());
    }

    init_metrics(&config.metrics)?;
    info!("starting servercode-engine v{}", servercode_engine::VERSION);

    let launcher = Arc::new(ProcessLauncher::new(config.worker.exec_path.clone()));
    let (broker, events) = spawn_broker(config.broker.clone(), launcher);

    let queue = Arc::new(InMemoryTaskQueue::new());
    let dispatcher = Arc::new(Dispatcher::new(
        queue.clone(),
        broker.clone(),
        config.queue.clone(),
    ));

    {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run_dispatch_loop().await });
    }
    {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run_result_loop(events).await });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining pool");
    broker.stop().await?;
    info!("engine stopped");
    Ok(())
}

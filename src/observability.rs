// src/observability.rs
//! Observability bootstrap
//!
//! Tracing and metrics initialization shared by the daemon and worker roles.
//! All log output goes to stderr: worker processes reserve stdout for the
//! task protocol, and the daemon follows the same convention so both roles
//! log identically.

use crate::utils::config::MetricsSettings;
use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize structured logging.
///
/// Honors `RUST_LOG` for filtering and `SERVERCODE_LOG_FORMAT=json` for
/// machine-readable output.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_format = std::env::var("SERVERCODE_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .context("failed to install json tracing subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .context("failed to install tracing subscriber")?;
    }

    Ok(())
}

/// Initialize the Prometheus exporter and describe the engine's metrics.
///
/// No-op when the exporter is disabled; the `metrics` macros then record
/// into the default no-op recorder.
pub fn init_metrics(settings: &MetricsSettings) -> Result<()> {
    if !settings.enabled {
        return Ok(());
    }

    let addr: SocketAddr = settings
        .listen_addr
        .parse()
        .with_context(|| format!("invalid metrics listen address: {}", settings.listen_addr))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;

    describe_gauge!("servercode_pool_busy", "Workers currently executing a task");
    describe_gauge!("servercode_pool_idle", "Warm workers with no tenant model loaded");
    describe_gauge!("servercode_pool_cached", "Workers retained with a tenant model loaded");
    describe_gauge!("servercode_pool_starting", "Workers spawned but not yet started");
    describe_gauge!(
        "servercode_pool_load_percent",
        "Busy workers as a percentage of the concurrency limit"
    );
    describe_counter!("servercode_tasks_processed_total", "Tasks completed by workers");
    describe_counter!("servercode_task_failures_total", "Tasks that ended in an error result");
    describe_counter!("servercode_workers_spawned_total", "Worker processes launched");
    describe_counter!("servercode_workers_killed_total", "Worker processes force-killed");
    describe_histogram!(
        "servercode_task_duration_seconds",
        "Wall-clock time from dispatch to result"
    );

    Ok(())
}

// src/utils/config.rs
//! Runner configuration
//!
//! Layered loading: an optional `servercode.{toml,yaml,json}` file in the
//! working directory, overridden by `SERVERCODE_*` environment variables
//! (`SERVERCODE_BROKER__CONCURRENCY_LIMIT=32` style).

use crate::utils::errors::{Result, RunnerError};
use serde::Deserialize;

fn invalid(message: String) -> RunnerError {
    RunnerError::Config(config::ConfigError::Message(message))
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Worker pool broker settings
    pub broker: BrokerSettings,

    /// Task queue settings
    pub queue: QueueSettings,

    /// Worker process settings
    pub worker: WorkerSettings,

    /// Metrics exporter settings
    pub metrics: MetricsSettings,
}

/// Settings governing the worker pool broker
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Maximum number of simultaneously live workers (default: 16)
    pub concurrency_limit: usize,

    /// Maximum number of cached (tenant-affine) workers (default: 4)
    pub cache_limit: usize,

    /// Idle workers kept warm to absorb cold-start latency (default: 2)
    pub min_idle: usize,

    /// Heartbeat staleness threshold; also the watchdog period (default: 30s)
    pub heartbeat_timeout_secs: u64,

    /// Extra time granted past a task's own timeout before the worker
    /// process is force-killed (default: 5000ms)
    pub teardown_grace_ms: u64,

    /// Period of the load/status watchdog (default: 10s)
    pub status_period_secs: u64,

    /// How long the pool may stay above GOOD load before it is reported
    /// (default: 60s)
    pub status_grace_secs: u64,

    /// Poll interval of the graceful-stop wait loop (default: 250ms)
    pub stop_poll_interval_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            concurrency_limit: 16,
            cache_limit: 4,
            min_idle: 2,
            heartbeat_timeout_secs: 30,
            teardown_grace_ms: 5_000,
            status_period_secs: 10,
            status_grace_secs: 60,
            stop_poll_interval_ms: 250,
        }
    }
}

/// Settings for the task queue client
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Channel tasks are popped from (default: "tasks")
    pub channel: String,

    /// TTL on published results so unclaimed ones expire (default: 10s)
    pub result_ttl_secs: u64,

    /// Blocking-pop timeout before the dispatcher re-polls (default: 5s)
    pub pop_timeout_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            channel: "tasks".to_string(),
            result_ttl_secs: 10,
            pop_timeout_secs: 5,
        }
    }
}

/// Settings applied inside each worker process
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker heartbeat period (default: 5s). Must be well below the
    /// broker's heartbeat timeout.
    pub heartbeat_period_secs: u64,

    /// Timeout applied to tasks that carry none of their own (default: 5000ms)
    pub default_timeout_ms: u64,

    /// Override for the worker executable; the broker re-executes its own
    /// binary when unset
    pub exec_path: Option<String>,

    /// Sandbox applied before tenant code runs
    pub sandbox: SandboxSettings,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            heartbeat_period_secs: 5,
            default_timeout_ms: 5_000,
            exec_path: None,
            sandbox: SandboxSettings::default(),
        }
    }
}

/// Sandbox capability settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Deny subprocess creation inside workers (default: true)
    pub deny_subprocess: bool,

    /// Drop to a per-tenant unprivileged uid before tenant code runs.
    /// Requires the worker to start privileged; off by default so
    /// development runs work unprivileged.
    pub drop_identity: bool,

    /// First uid of the per-tenant identity range (default: 20000)
    pub base_uid: u32,

    /// Size of the per-tenant identity range (default: 10000)
    pub uid_range: u32,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            deny_subprocess: true,
            drop_identity: false,
            base_uid: 20_000,
            uid_range: 10_000,
        }
    }
}

/// Prometheus exporter settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Whether to expose a Prometheus scrape endpoint (default: false)
    pub enabled: bool,

    /// Listen address of the scrape endpoint (default: 127.0.0.1:9793)
    pub listen_addr: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9793".to_string(),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        let raw = config::Config::builder()
            .add_source(config::File::with_name("servercode").required(false))
            .add_source(config::Environment::with_prefix("SERVERCODE").separator("__"))
            .build()?;

        let loaded: RunnerConfig = raw.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Load configuration from an explicit file, still honoring environment
    /// overrides
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("SERVERCODE").separator("__"))
            .build()?;

        let loaded: RunnerConfig = raw.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.broker.concurrency_limit == 0 {
            return Err(invalid("broker.concurrency_limit must be at least 1".into()));
        }
        if self.broker.min_idle > self.broker.concurrency_limit {
            return Err(invalid(format!(
                "broker.min_idle ({}) exceeds broker.concurrency_limit ({})",
                self.broker.min_idle, self.broker.concurrency_limit
            )));
        }
        if self.worker.heartbeat_period_secs >= self.broker.heartbeat_timeout_secs {
            return Err(invalid(format!(
                "worker.heartbeat_period_secs ({}) must be below broker.heartbeat_timeout_secs ({})",
                self.worker.heartbeat_period_secs, self.broker.heartbeat_timeout_secs
            )));
        }
        if self.worker.sandbox.uid_range == 0 {
            return Err(invalid("worker.sandbox.uid_range must be at least 1".into()));
        }
        Ok(())
    }
}

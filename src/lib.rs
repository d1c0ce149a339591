// src/lib.rs
//! Multi-tenant server-code execution engine
//!
//! Tenant-supplied event handlers, timers and services run in isolated
//! worker processes, dispatched from a shared task queue and supervised by
//! an elastic worker pool.
//!
//! # Architecture
//!
//! - **pool**: worker process supervision (broker, launcher, pipe protocol)
//! - **executor**: in-worker task classification and execution
//! - **model**: the per-tenant handler/type/service catalog
//! - **codec**: cycle-safe argument graph encoding
//! - **sandbox**: per-process capability confinement
//! - **queue**: task queue port and in-memory implementation
//! - **worker**: the worker-role process bootstrap
//! - **app**: dispatcher and platform glue
//! - **observability**: tracing and metrics bootstrap
//! - **utils**: configuration and error types

pub mod app;
pub mod codec;
pub mod executor;
pub mod model;
pub mod observability;
pub mod pool;
pub mod queue;
pub mod sandbox;
pub mod utils;
pub mod worker;

// Re-export commonly used types
pub use executor::{Task, TaskExecutor, TaskKind, TaskResult};
pub use model::{ServerCodeModel, StaticCodeRepository};
pub use pool::{spawn_broker, BrokerHandle};
pub use utils::config::RunnerConfig;
pub use utils::errors::{Result, RunnerError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// src/utils/errors.rs
//! Engine-wide error types
//!
//! The taxonomy separates faults that travel back to the task caller
//! (integrity violations, timeouts) from faults that stay inside the
//! engine (spawn failures, protocol breakage, configuration problems).
//! Tenant code failures are NOT errors at this level: they are converted
//! into the exception envelope by the executor and returned as normal
//! results.

use thiserror::Error;

/// Result type used throughout the engine
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Errors produced by the engine itself
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The task references an event/handler/service missing from the model
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Two registrations claimed the same handler key, type or service name
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// A registration was malformed (bad timer schedule, blank name, or
    /// attempted outside module load time)
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    /// The in-worker task deadline elapsed before the handler finished
    #[error("task execution aborted due to timeout")]
    ExecutionTimeout,

    /// Tenant code attempted a capability the sandbox denies, or the
    /// sandbox itself could not be engaged
    #[error("sandbox violation: {0}")]
    SandboxViolation(String),

    /// A worker process could not be spawned
    #[error("failed to spawn worker process: {0}")]
    ProcessSpawnFailed(String),

    /// The broker refused the request because it is shutting down
    #[error("worker pool is stopped")]
    PoolStopped,

    /// A malformed or unexpected frame crossed the worker pipe
    #[error("worker protocol error: {0}")]
    Protocol(String),

    /// The argument codec could not encode or decode a value graph
    #[error("argument codec error: {0}")]
    Codec(String),

    /// The task queue backend failed
    #[error("queue error: {0}")]
    Queue(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// True when the fault should be reported to the task caller rather
    /// than logged and absorbed by the pool
    pub fn is_caller_visible(&self) -> bool {
        matches!(
            self,
            RunnerError::Integrity(_)
                | RunnerError::ExecutionTimeout
                | RunnerError::SandboxViolation(_)
        )
    }
}

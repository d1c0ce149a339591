// src/executor/isolation.rs
//! Fault isolation for tenant code
//!
//! Tenant bodies run on a blocking thread so a panic or an overrun cannot
//! take the executor down. On timeout the invocation is abandoned, not
//! cancelled: the thread may keep running, which is why the broker keeps
//! its own process-level timer as the outer safety net.

use std::time::Duration;
use tokio::task::JoinError;
use tracing::warn;

/// How an isolated invocation ended
#[derive(Debug)]
pub enum Isolated<T> {
    Completed(T),
    /// The body panicked; the payload message is best effort
    Panicked(String),
    TimedOut,
}

/// Run `body` on a blocking thread, racing it against `timeout`
pub async fn run_isolated<T, F>(timeout: Duration, body: F) -> Isolated<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let join = tokio::task::spawn_blocking(body);
    match tokio::time::timeout(timeout, join).await {
        Ok(Ok(value)) => Isolated::Completed(value),
        Ok(Err(join_error)) => {
            let message = panic_message(join_error);
            warn!(error = %message, "tenant invocation panicked");
            Isolated::Panicked(message)
        }
        Err(_) => Isolated::TimedOut,
    }
}

fn panic_message(join_error: JoinError) -> String {
    if !join_error.is_panic() {
        return "invocation was cancelled".to_string();
    }
    let panic = join_error.into_panic();
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "tenant code panicked".to_string()
    }
}

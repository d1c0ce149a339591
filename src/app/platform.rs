// src/app/platform.rs
//! Controlling platform port
//!
//! The HTTP flows against the controlling platform (runner registration,
//! model publication) are orthogonal glue; the engine only needs the seam.
//! [`NullPlatform`] keeps standalone and test runs self-contained.

use crate::utils::errors::Result;
use tracing::debug;

/// What the engine reports to the controlling platform
#[async_trait::async_trait]
pub trait PlatformClient: Send + Sync {
    /// Announce this runner instance
    async fn register_runner(&self, runner_id: &str) -> Result<()>;

    /// Withdraw this runner instance
    async fn unregister_runner(&self, runner_id: &str) -> Result<()>;

    /// Publish a built model summary for one tenant deployment
    async fn publish_model(&self, app_id: &str, summary: &str) -> Result<()>;

    /// Liveness report
    async fn heartbeat(&self, runner_id: &str) -> Result<()>;
}

/// Platform client that acknowledges everything locally
#[derive(Debug, Default)]
pub struct NullPlatform;

#[async_trait::async_trait]
impl PlatformClient for NullPlatform {
    async fn register_runner(&self, runner_id: &str) -> Result<()> {
        debug!(runner_id, "runner registered (standalone)");
        Ok(())
    }

    async fn unregister_runner(&self, runner_id: &str) -> Result<()> {
        debug!(runner_id, "runner unregistered (standalone)");
        Ok(())
    }

    async fn publish_model(&self, app_id: &str, summary: &str) -> Result<()> {
        debug!(app_id, summary, "model published (standalone)");
        Ok(())
    }

    async fn heartbeat(&self, _runner_id: &str) -> Result<()> {
        Ok(())
    }
}

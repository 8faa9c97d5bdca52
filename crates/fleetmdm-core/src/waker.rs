//! Seam between the command queue and whatever wakes devices.

use async_trait::async_trait;

use crate::error::Result;

/// Wakes a dormant device so it starts a connect exchange.
#[async_trait]
pub trait DeviceWaker: Send + Sync {
    /// Returns the push message identifier.
    async fn wake(&self, udid: &str) -> Result<String>;
}

/// Waker that does nothing, for deployments without push.
#[derive(Debug, Clone, Default)]
pub struct NoopWaker;

#[async_trait]
impl DeviceWaker for NoopWaker {
    async fn wake(&self, udid: &str) -> Result<String> {
        tracing::debug!(udid = %udid, "Wake requested with no waker configured");
        Ok(String::new())
    }
}

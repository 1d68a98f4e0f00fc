use crate::protocol::TargetId;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Failed to launch target {target}: {reason}")]
pub struct LaunchError {
    pub target: String,
    pub reason: String,
}

/// Opens a new execution context on demand (the `spawnTarget` task).
///
/// Implementations attach the new context to the dispatcher themselves;
/// the dispatcher only learns about it through `contextReady`.
#[async_trait]
pub trait TargetLauncher: Send + Sync {
    async fn spawn(&self, target: &TargetId, url: &str) -> Result<(), LaunchError>;
}
